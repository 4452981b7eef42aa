//! C4 trigger engine: bridges `fuser::Filesystem` hooks to `broker-core`'s
//! C2 (`Tree`)/C3 (`RequestTable`), implementing §4.2's trigger gate and
//! §4.1's `ignore_thread`/`trigger` contract.

use broker_core::channel::SingleSession;
use broker_core::error::{BrokerError, Result};
use broker_core::node::{NodeId, Tree};
use broker_core::request::{RequestKind, RequestTable};
use tracing::{debug, trace};

/// Runs the §4.2 trigger gate for `node`, named `key` under `prefix`
/// (`from` identifies the map/HSM-config source for the fingerprint).
///
/// Returns `Ok(())` immediately without posting anything when the node
/// already has something mounted over it, is still within its cache
/// window, or the caller is `ignore_thread` (§4.1 "Reentrancy rule").
#[allow(clippy::too_many_arguments)]
pub fn trigger_for_node(
    tree: &Tree,
    requests: &RequestTable,
    session: &SingleSession,
    caller_pid: i32,
    node: NodeId,
    from: &str,
    path: &str,
    prefix: &str,
    key: &str,
) -> Result<()> {
    if tree.is_mounted_over(node) || tree.cached(node) {
        return Ok(());
    }
    if let Some(helper) = session.current() {
        if helper.is_descendant(caller_pid) {
            trace!(caller_pid, "ignore_thread: trigger suppressed");
            return Ok(());
        }
    }

    let options = tree.effective_options(node);
    let result = requests.trigger(RequestKind::Mount, from, path, prefix, key, &options, || false);
    match &result {
        Ok(()) => debug!(path, key, "trigger completed"),
        Err(e) => debug!(path, key, error = %e, "trigger failed"),
    }
    result
}

/// After a successful trigger, attaches the foreign filesystem named by the
/// node's `location` over it (§6.1 `vfs_mount_over`), using the teacher's
/// new-mount syscalls.
pub fn mount_foreign_over(tree: &Tree, node: NodeId, target: &str) -> Result<()> {
    let location = tree.location_of(node).ok_or(BrokerError::NotFound)?;
    let (fstype, source) = location
        .split_once(':')
        .map(|(_, path)| ("nfs", path))
        .unwrap_or(("nfs", location.as_str()));
    let options = default_options(fstype, &tree.effective_options(node));

    broker_core::newmount::mount_over(target, fstype, source, &options)
        .map_err(|e| BrokerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    tree.set_mounted_over(node, true);
    Ok(())
}

/// §4.4 "injects default options (`automounted`; `retrycnt=1` for nfs unless
/// overridden)": every broker-initiated mount is tagged `automounted` so C7
/// (the reaper) can recognize it later via `MountEntry::is_automounted`, and
/// an `nfs` mount gets a `retrycnt=1` default unless the map entry's own
/// options already set one.
fn default_options(fstype: &str, entry_options: &str) -> String {
    let mut opts: Vec<String> = entry_options
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if !opts.iter().any(|o| o == "automounted") {
        opts.push("automounted".to_string());
    }
    if fstype == "nfs" && !opts.iter().any(|o| o.starts_with("retrycnt=")) {
        opts.push("retrycnt=1".to_string());
    }
    opts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_injects_automounted_and_retrycnt() {
        let opts = default_options("nfs", "rw");
        assert_eq!(opts, "rw,automounted,retrycnt=1");
    }

    #[test]
    fn default_options_respects_explicit_retrycnt() {
        let opts = default_options("nfs", "rw,retrycnt=5");
        assert_eq!(opts, "rw,retrycnt=5,automounted");
    }

    #[test]
    fn default_options_skips_retrycnt_for_non_nfs() {
        let opts = default_options("ext4", "rw");
        assert_eq!(opts, "rw,automounted");
    }
}
