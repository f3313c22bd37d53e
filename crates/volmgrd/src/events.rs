//! Replication event feed.
//!
//! Tails the replication tooling's event stream (`drbdsetup events2 all`)
//! through a long-lived child process. The only event acted upon is the
//! control resource dropping to the Secondary role with no connection
//! argument: that is the signature of a peer having finished writing the
//! control volume, and it triggers a reconciliation pass. The feed is
//! advisory; losing it degrades responsiveness, not correctness.
//!
//! A broken or ended feed moves the watcher through a
//! broken -> restarting -> watching cycle with a fixed backoff. The very
//! first spawn failing is fatal so a misconfigured utility path is caught
//! at startup.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use volmgr_proto::constants::CTRL_RES_NAME;
use volmgr_proto::defaults::EVENTS_RESTART_INTERVAL_SECS;
use volmgr_proto::error::{DmError, DmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    Watching,
    Broken,
    Restarting,
}

pub struct EventsWatcher {
    util: PathBuf,
    trigger: Arc<Notify>,
    state: WatchState,
}

impl EventsWatcher {
    pub fn new(util_path: &str, util: &str, trigger: Arc<Notify>) -> Self {
        Self {
            util: PathBuf::from(util_path).join(util),
            trigger,
            state: WatchState::Idle,
        }
    }

    fn transition(&mut self, next: WatchState) {
        debug!("event feed {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Follow the event feed until the task is cancelled. The first spawn
    /// failure is returned; later failures restart the feed after a fixed
    /// delay.
    pub async fn run(mut self) -> DmResult<()> {
        let mut first = true;
        loop {
            let mut child = match Command::new(&self.util)
                .args(["events2", "all"])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    if first {
                        warn!("cannot start event feed {}: {}", self.util.display(), e);
                        return Err(DmError::Plugin);
                    }
                    warn!(
                        "event feed restart failed ({}), retrying in {}s",
                        e, EVENTS_RESTART_INTERVAL_SECS
                    );
                    self.transition(WatchState::Restarting);
                    tokio::time::sleep(Duration::from_secs(EVENTS_RESTART_INTERVAL_SECS)).await;
                    continue;
                }
            };
            first = false;
            self.transition(WatchState::Watching);
            info!("event feed started ({})", self.util.display());

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if is_peer_change(&line, CTRL_RES_NAME) {
                        debug!("control volume changed by a peer");
                        self.trigger.notify_one();
                    }
                }
            }

            // EOF or broken pipe.
            self.transition(WatchState::Broken);
            let _ = child.kill().await;
            warn!(
                "event feed ended, restarting in {}s",
                EVENTS_RESTART_INTERVAL_SECS
            );
            self.transition(WatchState::Restarting);
            tokio::time::sleep(Duration::from_secs(EVENTS_RESTART_INTERVAL_SECS)).await;
        }
    }
}

/// A change event for the control resource that drops it to the Secondary
/// role, carrying no connection argument, means a peer released the
/// control volume after writing it.
fn is_peer_change(line: &str, ctrl_res: &str) -> bool {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("change") {
        return false;
    }
    if fields.next() != Some("resource") {
        return false;
    }
    let mut is_ctrl = false;
    let mut secondary = false;
    let mut has_connection = false;
    for field in fields {
        match field.split_once(':') {
            Some(("name", name)) => is_ctrl = name == ctrl_res,
            Some(("role", role)) => secondary = role == "Secondary",
            Some(("connection", _)) => has_connection = true,
            _ => {}
        }
    }
    is_ctrl && secondary && !has_connection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_change_recognized() {
        let line = format!("change resource name:{} role:Secondary", CTRL_RES_NAME);
        assert!(is_peer_change(&line, CTRL_RES_NAME));
    }

    #[test]
    fn test_other_resource_ignored() {
        assert!(!is_peer_change(
            "change resource name:r0 role:Secondary",
            CTRL_RES_NAME
        ));
    }

    #[test]
    fn test_connection_events_ignored() {
        let line = format!(
            "change resource name:{} connection:peer role:Secondary",
            CTRL_RES_NAME
        );
        assert!(!is_peer_change(&line, CTRL_RES_NAME));
    }

    #[test]
    fn test_non_change_events_ignored() {
        let line = format!("exists resource name:{} role:Secondary", CTRL_RES_NAME);
        assert!(!is_peer_change(&line, CTRL_RES_NAME));
        assert!(!is_peer_change("", CTRL_RES_NAME));
        let line = format!("change resource name:{} role:Primary", CTRL_RES_NAME);
        assert!(!is_peer_change(&line, CTRL_RES_NAME));
    }

    #[tokio::test]
    async fn test_first_spawn_failure_is_fatal() {
        let trigger = Arc::new(Notify::new());
        let watcher = EventsWatcher::new("/nonexistent", "no-such-util", trigger);
        let err = watcher.run().await.unwrap_err();
        assert!(matches!(err, DmError::Plugin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_restarts_after_eof() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir();
        let name = "volmgrd-events-feed.sh";
        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\necho \"change resource name:{} role:Secondary\"\n",
            CTRL_RES_NAME
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let trigger = Arc::new(Notify::new());
        let watcher = EventsWatcher::new(&dir.display().to_string(), name, trigger.clone());
        let handle = tokio::spawn(watcher.run());

        // The stand-in utility emits one peer change and exits. A second
        // notification can only come from the feed being respawned after
        // the backoff.
        trigger.notified().await;
        trigger.notified().await;

        handle.abort();
        let _ = std::fs::remove_file(&path);
    }
}
