//! Free-id allocation and name validation.
//!
//! Minor numbers, ports, node ids and volume ids are all allocated by the
//! same rule: the smallest unused integer in a bounded range. The search is
//! pure and deterministic so allocation behavior is reproducible in tests.

use crate::constants::{
    NODE_NAME_LABEL_MAXLEN, NODE_NAME_MAXLEN, NODE_NAME_MINLEN, RES_NAME_MAXLEN, RES_NAME_MINLEN,
    RES_NAME_VALID_CHARS, RES_NAME_VALID_INNER_CHARS,
};
use crate::error::{DmError, DmResult};

/// Find the smallest integer in `min..=max` that is not in `used`.
///
/// `used` does not have to be sorted and may contain values outside the
/// range; those are ignored. Returns `None` iff `used` covers the whole
/// range.
pub fn get_free_number(min: u64, max: u64, used: &[u64]) -> Option<u64> {
    if min > max {
        return None;
    }
    let mut in_range: Vec<u64> = used
        .iter()
        .copied()
        .filter(|&nr| nr >= min && nr <= max)
        .collect();
    in_range.sort_unstable();
    in_range.dedup();

    let mut candidate = min;
    for nr in in_range {
        if nr != candidate {
            break;
        }
        if candidate == max {
            return None;
        }
        candidate += 1;
    }
    Some(candidate)
}

/// Validate a node name against host name constraints
/// (RFC952/RFC1035/RFC1123).
///
/// The name must be 2..=255 characters, consist of dot-separated labels of
/// at most 63 characters each, and each label may contain letters, digits
/// and inner hyphens only.
pub fn check_node_name(name: &str) -> DmResult<()> {
    if name.len() < NODE_NAME_MINLEN || name.len() > NODE_NAME_MAXLEN {
        return Err(DmError::InvalidName);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > NODE_NAME_LABEL_MAXLEN {
            return Err(DmError::InvalidName);
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(DmError::InvalidName);
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(DmError::InvalidName);
        }
    }
    Ok(())
}

/// Validate a resource name.
///
/// 1..=48 characters; letters, digits and `_` anywhere; `-` only between
/// other characters.
pub fn check_res_name(name: &str) -> DmResult<()> {
    check_object_name(
        name,
        RES_NAME_MINLEN,
        RES_NAME_MAXLEN,
        RES_NAME_VALID_CHARS,
        RES_NAME_VALID_INNER_CHARS,
    )
}

/// Shared validator for flat object names with a set of extra characters
/// allowed anywhere and a set allowed only in inner positions.
fn check_object_name(
    name: &str,
    min_len: usize,
    max_len: usize,
    valid: &str,
    valid_inner: &str,
) -> DmResult<()> {
    if name.len() < min_len || name.len() > max_len {
        return Err(DmError::InvalidName);
    }
    let last = name.len() - 1;
    for (idx, c) in name.chars().enumerate() {
        if c.is_ascii_alphanumeric() || valid.contains(c) {
            continue;
        }
        if valid_inner.contains(c) && idx != 0 && idx != last {
            continue;
        }
        return Err(DmError::InvalidName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_free_number_basic() {
        assert_eq!(get_free_number(0, 10, &[]), Some(0));
        assert_eq!(get_free_number(0, 10, &[0, 1, 2]), Some(3));
        assert_eq!(get_free_number(5, 10, &[5, 7]), Some(6));
        assert_eq!(get_free_number(0, 2, &[0, 1, 2]), None);
    }

    #[test]
    fn test_free_number_ignores_out_of_range() {
        assert_eq!(get_free_number(10, 20, &[1, 2, 30]), Some(10));
    }

    #[test]
    fn test_free_number_unsorted_duplicates() {
        assert_eq!(get_free_number(0, 5, &[3, 0, 0, 1, 3]), Some(2));
    }

    #[test]
    fn test_free_number_empty_range() {
        assert_eq!(get_free_number(5, 4, &[]), None);
        assert_eq!(get_free_number(7, 7, &[]), Some(7));
        assert_eq!(get_free_number(7, 7, &[7]), None);
    }

    proptest! {
        #[test]
        fn prop_smallest_free(used in prop::collection::vec(0u64..64, 0..80)) {
            let result = get_free_number(0, 63, &used);
            match result {
                Some(nr) => {
                    // returned value is free and within the range
                    prop_assert!(nr <= 63);
                    prop_assert!(!used.contains(&nr));
                    // and is the smallest such value
                    for candidate in 0..nr {
                        prop_assert!(used.contains(&candidate));
                    }
                }
                None => {
                    // the whole range must be covered
                    for candidate in 0u64..=63 {
                        prop_assert!(used.contains(&candidate));
                    }
                }
            }
        }

        #[test]
        fn prop_idempotent(used in prop::collection::vec(0u64..32, 0..40)) {
            prop_assert_eq!(
                get_free_number(0, 31, &used),
                get_free_number(0, 31, &used)
            );
        }
    }

    #[test]
    fn test_node_name_rules() {
        assert!(check_node_name("alice").is_ok());
        assert!(check_node_name("node-1.example.com").is_ok());
        assert!(check_node_name("a").is_err()); // too short
        assert!(check_node_name("-alice").is_err());
        assert!(check_node_name("alice-").is_err());
        assert!(check_node_name("al ice").is_err());
        assert!(check_node_name("alice..b").is_err());
        let long_label = "x".repeat(64);
        assert!(check_node_name(&long_label).is_err());
        let long_name = format!("{}.{}", "y".repeat(63), "z".repeat(200));
        assert!(check_node_name(&long_name).is_err());
    }

    #[test]
    fn test_res_name_rules() {
        assert!(check_res_name("r0").is_ok());
        assert!(check_res_name("_backup").is_ok());
        assert!(check_res_name("web-data").is_ok());
        assert!(check_res_name("-web").is_err());
        assert!(check_res_name("web-").is_err());
        assert!(check_res_name("").is_err());
        assert!(check_res_name(&"r".repeat(49)).is_err());
        assert!(check_res_name("web/data").is_err());
    }
}
