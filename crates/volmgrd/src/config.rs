//! Server configuration.
//!
//! Loads a flat string-to-string mapping from a line-oriented key=value
//! file. Values may contain `\n`, `\t`, `\\` and `\=` escapes, a trailing
//! backslash continues a line, and `#` starts a comment (leading whitespace
//! allowed). Keys that are not part of the compiled-in default set are
//! discarded; keys absent from the file keep their default.

use std::collections::HashMap;
use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use volmgr_proto::defaults;

pub const KEY_MAX_NODE_ID: &str = "max-node-id";
pub const KEY_MAX_PEERS: &str = "max-peers";
pub const KEY_MIN_MINOR_NR: &str = "min-minor-nr";
pub const KEY_MIN_PORT_NR: &str = "min-port-nr";
pub const KEY_MAX_PORT_NR: &str = "max-port-nr";
pub const KEY_STORAGE_PLUGIN: &str = "storage-plugin";
pub const KEY_DEPLOYER_PLUGIN: &str = "deployer-plugin";
pub const KEY_UTIL_PATH: &str = "util-path";
pub const KEY_EVENTS_UTIL: &str = "events-util";
pub const KEY_STORE_PATH: &str = "store-path";
pub const KEY_SECRET: &str = "secret";

/// The compiled-in default for every recognized key.
fn default_entries() -> Vec<(&'static str, String)> {
    vec![
        (KEY_MAX_NODE_ID, defaults::DEFAULT_MAX_NODE_ID.to_string()),
        (KEY_MAX_PEERS, defaults::DEFAULT_MAX_PEERS.to_string()),
        (KEY_MIN_MINOR_NR, defaults::DEFAULT_MIN_MINOR_NR.to_string()),
        (KEY_MIN_PORT_NR, defaults::DEFAULT_MIN_PORT_NR.to_string()),
        (KEY_MAX_PORT_NR, defaults::DEFAULT_MAX_PORT_NR.to_string()),
        (KEY_STORAGE_PLUGIN, defaults::DEFAULT_STORAGE_PLUGIN.to_string()),
        (KEY_DEPLOYER_PLUGIN, defaults::DEFAULT_DEPLOYER_PLUGIN.to_string()),
        (KEY_UTIL_PATH, defaults::DEFAULT_UTIL_PATH.to_string()),
        (KEY_EVENTS_UTIL, defaults::DEFAULT_EVENTS_UTIL.to_string()),
        (KEY_STORE_PATH, defaults::DEFAULT_STORE_PATH.to_string()),
        (KEY_SECRET, defaults::DEFAULT_SECRET.to_string()),
    ]
}

/// Typed view over the merged configuration.
#[derive(Debug, Clone)]
pub struct ServerConf {
    values: HashMap<String, String>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            values: default_entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

impl ServerConf {
    /// Load the configuration file, merging it over the defaults. A missing
    /// or unreadable file falls back to the defaults.
    pub async fn load(path: &Path) -> Self {
        let mut conf = Self::default();
        match fs::read_to_string(path).await {
            Ok(text) => {
                conf.merge(&parse_conf(&text));
                debug!("loaded configuration from {}", path.display());
            }
            Err(e) => {
                warn!(
                    "cannot read configuration file {}, using defaults: {}",
                    path.display(),
                    e
                );
            }
        }
        conf
    }

    pub fn from_text(text: &str) -> Self {
        let mut conf = Self::default();
        conf.merge(&parse_conf(text));
        conf
    }

    fn merge(&mut self, parsed: &HashMap<String, String>) {
        for (key, value) in parsed {
            if self.values.contains_key(key) {
                self.values.insert(key.clone(), value.clone());
            } else {
                warn!("ignoring unknown configuration key '{}'", key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Override a known key, e.g. from a command-line argument. Returns
    /// whether the key was recognized.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        if self.values.contains_key(key) {
            self.values.insert(key.to_string(), value.to_string());
            true
        } else {
            false
        }
    }

    fn get_number(&self, key: &str, default: u64) -> u64 {
        match self.values.get(key).map(|v| v.parse::<u64>()) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                warn!(
                    "configuration key '{}' has a non-numeric value, using default {}",
                    key, default
                );
                default
            }
            None => default,
        }
    }

    pub fn max_node_id(&self) -> u32 {
        self.get_number(KEY_MAX_NODE_ID, u64::from(defaults::DEFAULT_MAX_NODE_ID)) as u32
    }

    pub fn max_peers(&self) -> u32 {
        self.get_number(KEY_MAX_PEERS, u64::from(defaults::DEFAULT_MAX_PEERS)) as u32
    }

    pub fn min_minor_nr(&self) -> u32 {
        self.get_number(KEY_MIN_MINOR_NR, u64::from(defaults::DEFAULT_MIN_MINOR_NR)) as u32
    }

    pub fn min_port_nr(&self) -> u16 {
        self.get_number(KEY_MIN_PORT_NR, u64::from(defaults::DEFAULT_MIN_PORT_NR)) as u16
    }

    pub fn max_port_nr(&self) -> u16 {
        self.get_number(KEY_MAX_PORT_NR, u64::from(defaults::DEFAULT_MAX_PORT_NR)) as u16
    }

    pub fn storage_plugin(&self) -> &str {
        self.get(KEY_STORAGE_PLUGIN).unwrap_or(defaults::DEFAULT_STORAGE_PLUGIN)
    }

    pub fn deployer_plugin(&self) -> &str {
        self.get(KEY_DEPLOYER_PLUGIN).unwrap_or(defaults::DEFAULT_DEPLOYER_PLUGIN)
    }

    pub fn util_path(&self) -> &str {
        self.get(KEY_UTIL_PATH).unwrap_or(defaults::DEFAULT_UTIL_PATH)
    }

    pub fn events_util(&self) -> &str {
        self.get(KEY_EVENTS_UTIL).unwrap_or(defaults::DEFAULT_EVENTS_UTIL)
    }

    pub fn store_path(&self) -> &str {
        self.get(KEY_STORE_PATH).unwrap_or(defaults::DEFAULT_STORE_PATH)
    }

    pub fn secret(&self) -> &str {
        self.get(KEY_SECRET).unwrap_or(defaults::DEFAULT_SECRET)
    }
}

/// Parse the raw file text into a key/value mapping. Malformed lines are
/// skipped with a warning.
pub fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut lines = text.lines();
    while let Some(first) = lines.next() {
        let mut logical = first.to_string();
        while ends_with_continuation(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next),
                None => break,
            }
        }
        let trimmed = logical.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match split_key_value(trimmed) {
            Some((key, value)) => {
                values.insert(key, value);
            }
            None => {
                warn!("skipping malformed configuration line '{}'", trimmed);
            }
        }
    }
    values
}

/// A line continues on the next one when it ends in an odd number of
/// backslashes (an even count is escaped backslashes and stands alone).
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Split at the first unescaped '=' and unescape both halves.
fn split_key_value(line: &str) -> Option<(String, String)> {
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '=' {
            let key = unescape(line[..idx].trim());
            let value = unescape(line[idx + 1..].trim());
            if key.is_empty() {
                return None;
            }
            return Some((key, value));
        }
    }
    None
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('=') => out.push('='),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_and_comments() {
        let text = "# leading comment\n   # indented comment\nmax-peers = 3\n\nmin-minor-nr=200\n";
        let values = parse_conf(text);
        assert_eq!(values.get("max-peers").map(String::as_str), Some("3"));
        assert_eq!(values.get("min-minor-nr").map(String::as_str), Some("200"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_parse_escapes() {
        let values = parse_conf("secret = a\\=b\\nc\\td\\\\e\n");
        assert_eq!(
            values.get("secret").map(String::as_str),
            Some("a=b\nc\td\\e")
        );
    }

    #[test]
    fn test_parse_continuation() {
        let values = parse_conf("util-path = /usr/\\\nlocal/sbin\n");
        assert_eq!(
            values.get("util-path").map(String::as_str),
            Some("/usr/local/sbin")
        );
        // An escaped trailing backslash is a literal, not a continuation.
        let values = parse_conf("secret = tail\\\\\nmax-peers = 3\n");
        assert_eq!(values.get("secret").map(String::as_str), Some("tail\\"));
        assert_eq!(values.get("max-peers").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_malformed_line_skipped() {
        let values = parse_conf("no equals sign here\nmax-peers=5\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("max-peers").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_unknown_keys_discarded_defaults_kept() {
        let conf = ServerConf::from_text("bogus-key = 42\nmax-peers = 5\n");
        assert!(conf.get("bogus-key").is_none());
        assert_eq!(conf.max_peers(), 5);
        assert_eq!(conf.max_node_id(), volmgr_proto::defaults::DEFAULT_MAX_NODE_ID);
    }

    #[test]
    fn test_unparseable_number_falls_back() {
        let conf = ServerConf::from_text("max-peers = many\n");
        assert_eq!(conf.max_peers(), volmgr_proto::defaults::DEFAULT_MAX_PEERS);
    }
}
