//! Hierarchical key paths
//!
//! Configuration keys are flat strings whose segments are joined with `:`,
//! e.g. `storage:postgres:password`.

/// Separator between the segments of a configuration key
pub const KEY_DELIMITER: &str = ":";

/// Join a parent path and a child segment
pub fn combine(parent: Option<&str>, key: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{parent}{KEY_DELIMITER}{key}"),
        _ => key.to_string(),
    }
}

/// Last segment of a path
pub fn section_key(path: &str) -> &str {
    path.rsplit_once(KEY_DELIMITER)
        .map(|(_, key)| key)
        .unwrap_or(path)
}

/// Path without its last segment, `None` for top-level keys
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once(KEY_DELIMITER).map(|(parent, _)| parent)
}

/// Immediate child segment of `key` below `parent`, if `key` lives under it
pub(crate) fn child_segment<'a>(key: &'a str, parent: Option<&str>) -> Option<&'a str> {
    let rest = match parent {
        None => key,
        Some(parent) => key
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix(KEY_DELIMITER))?,
    };
    Some(
        rest.split_once(KEY_DELIMITER)
            .map(|(segment, _)| segment)
            .unwrap_or(rest),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine() {
        assert_eq!(combine(None, "db"), "db");
        assert_eq!(combine(Some(""), "db"), "db");
        assert_eq!(combine(Some("storage:postgres"), "password"), "storage:postgres:password");
    }

    #[test]
    fn test_section_key_and_parent() {
        assert_eq!(section_key("storage:postgres:password"), "password");
        assert_eq!(section_key("db"), "db");
        assert_eq!(parent_path("storage:postgres:password"), Some("storage:postgres"));
        assert_eq!(parent_path("db"), None);
    }

    #[test]
    fn test_child_segment() {
        assert_eq!(child_segment("a:b:c", None), Some("a"));
        assert_eq!(child_segment("a:b:c", Some("a")), Some("b"));
        assert_eq!(child_segment("a:b:c", Some("a:b")), Some("c"));
        assert_eq!(child_segment("ab:c", Some("a")), None);
        assert_eq!(child_segment("a", Some("a")), None);
    }
}
