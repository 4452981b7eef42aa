//! Map-entry resolution for a posted `MOUNT` request (spec §4.4
//! `resolve_and_execute`'s map half). Runs in the forked worker, independent
//! of `brokerd`'s own copy of the node tree, so that special (`-name`) and
//! executable map files — resolved per lookup key rather than once at mount
//! time — are re-evaluated with the real key instead of whatever
//! `brokerd` pre-populated the tree with (see DESIGN.md Open Question:
//! "who calls `vfs_mount_over`").

use broker_core::error::{BrokerError, Result};
use broker_core::map::{self, FileMapLoader, MapEntry, MapLoader, Variables};

/// Recovers `(map_name, host_mountpoint)` from a `Request.from` string built
/// by `brokerd` as `"map <name> @ <mountpoint>"`.
pub fn parse_from(from: &str) -> Result<(&str, &str)> {
    let rest = from
        .strip_prefix("map ")
        .ok_or_else(|| BrokerError::BadInput(format!("`from` has no `map ` prefix: {from}")))?;
    rest.split_once(" @ ")
        .ok_or_else(|| BrokerError::BadInput(format!("`from` has no ` @ mountpoint` suffix: {from}")))
}

/// Locates the entry matching `key` within `map_name`, loading the map fresh
/// (so special/executable maps see the real lookup key, per §4.3.1 steps
/// 3/4), and returns its fully expanded single-target `location` if it
/// resolves to one (a multi-target/`sub != "/"` entry has no single
/// location; the caller treats that the same as "node already navigable,
/// nothing to mount").
pub fn resolve_mount(map_name: &str, key: &str, vars: &Variables) -> Result<Option<String>> {
    let loaded = FileMapLoader { lookup_key: key }.load(map_name)?;
    let entry = find_entry(&loaded, key);
    let Some(entry) = entry else {
        return Err(BrokerError::NotFound);
    };
    let Some(target) = entry.targets.iter().find(|t| t.sub == "/") else {
        return Ok(None);
    };
    // Unlike `populate_tree`'s literal branch, there's no deferred-expansion
    // case here: by the time a `MOUNT` request reaches this worker, `key` is
    // already the real looked-up name (a literal entry's own key, or the
    // wildcard's match), so §4.3.1 step 6's ampersand substitution always
    // applies against it, same as the literal-key path.
    let location = map::expand_location(&target.location, key, vars);
    Ok(Some(location))
}

fn find_entry<'a>(map: &'a map::Map, key: &str) -> Option<&'a MapEntry> {
    map.entries
        .iter()
        .find(|e| e.key == key)
        .or_else(|| map.entries.iter().find(|e| e.key == "*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_from_splits_name_and_mountpoint() {
        let (name, mp) = parse_from("map /etc/auto.net @ /net").unwrap();
        assert_eq!(name, "/etc/auto.net");
        assert_eq!(mp, "/net");
    }

    #[test]
    fn parse_from_rejects_missing_prefix() {
        assert!(parse_from("/etc/auto.net @ /net").is_err());
    }

    #[test]
    fn resolve_mount_finds_literal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.net");
        std::fs::write(&path, "alpha host:/export/alpha\n").unwrap();
        let location = resolve_mount(path.to_str().unwrap(), "alpha", &Variables::new()).unwrap();
        assert_eq!(location.as_deref(), Some("host:/export/alpha"));
    }

    #[test]
    fn resolve_mount_expands_ampersand_on_literal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.net");
        std::fs::write(&path, "alpha &:/export/&\n").unwrap();
        let location = resolve_mount(path.to_str().unwrap(), "alpha", &Variables::new()).unwrap();
        assert_eq!(location.as_deref(), Some("alpha:/export/alpha"));
    }

    #[test]
    fn resolve_mount_expands_wildcard_ampersand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.net");
        std::fs::write(&path, "* -rw &:/export/&\n").unwrap();
        let location = resolve_mount(path.to_str().unwrap(), "foo", &Variables::new()).unwrap();
        assert_eq!(location.as_deref(), Some("foo:/export/foo"));
    }

    #[test]
    fn resolve_mount_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.net");
        std::fs::write(&path, "alpha host:/export/alpha\n").unwrap();
        let err = resolve_mount(path.to_str().unwrap(), "nope", &Variables::new()).unwrap_err();
        assert!(matches!(err, BrokerError::NotFound));
    }
}
