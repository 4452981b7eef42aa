//! HSM action dispatch (spec §6.5/§6.6): the generalization of C6's
//! `resolve_and_execute` loop to the HSM `RequestKind`s, invoked from the
//! same forked-worker loop as `MOUNT`.
//!
//! Grounded in `broker_core::config`'s `HsmConfig`/`RemoteConfig` parse tree
//! and `broker_core::hsm`'s xattr record; this module is the only piece that
//! ties the two together with actual remote command execution.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;

use broker_core::config::{expand_exec_template, HsmConfig, MountConfig};
use broker_core::error::{BrokerError, Result};
use broker_core::hsm;
use broker_core::request::RequestKind;
use tracing::debug;

/// Finds the `mount` block whose `path` is a prefix of `full_path`,
/// preferring the longest (most specific) match.
fn mount_for<'a>(cfg: &'a HsmConfig, full_path: &str) -> Option<&'a MountConfig> {
    cfg.mounts
        .iter()
        .filter(|m| full_path == m.path || full_path.starts_with(&format!("{}/", m.path)))
        .max_by_key(|m| m.path.len())
}

fn relpath(mount: &MountConfig, full_path: &str) -> String {
    full_path
        .strip_prefix(&mount.path)
        .unwrap_or(full_path)
        .trim_start_matches('/')
        .to_string()
}

fn backing_path(mount: &MountConfig, rel: &str) -> std::path::PathBuf {
    let local = mount.local.as_deref().unwrap_or(&mount.path);
    if rel.is_empty() {
        Path::new(local).to_path_buf()
    } else {
        Path::new(local).join(rel)
    }
}

/// Picks the `*_exec` field relevant to `kind` out of a `RemoteConfig`.
fn exec_template<'a>(remote: &'a broker_core::config::RemoteConfig, kind: RequestKind) -> Option<&'a str> {
    match kind {
        RequestKind::Archive => remote.archive_exec.as_deref(),
        RequestKind::Release => remote.release_exec.as_deref(),
        RequestKind::Stage => remote.stage_exec.as_deref(),
        RequestKind::Recycle => remote.recycle_exec.as_deref(),
        _ => None,
    }
}

/// Runs every configured remote's template for `kind` against `full_path`,
/// in declaration order, short-circuiting on the first nonzero exit (§6.6:
/// "action dispatch iterates remotes in order and short-circuits on first
/// error").
fn run_remotes(mount: &MountConfig, full_path: &str, kind: RequestKind) -> Result<()> {
    let rel = relpath(mount, full_path);
    for remote in &mount.remotes {
        let Some(template) = exec_template(remote, kind) else {
            continue;
        };
        let cmd_line = expand_exec_template(template, &mount.path, &rel);
        debug!(remote = remote.name, cmd = cmd_line, "running hsm remote action");
        let mut parts = cmd_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| BrokerError::BadInput(format!("empty exec template for remote {}", remote.name)))?;
        let status = Command::new(program)
            .args(parts)
            .status()
            .map_err(BrokerError::Io)?;
        if !status.success() {
            return Err(BrokerError::HelperFailed(format!(
                "remote {} action exited with {:?}",
                remote.name,
                status.code()
            )));
        }
    }
    Ok(())
}

/// Applies one HSM `RequestKind` to `full_path` (a path under the broker
/// mount, as carried in `Request.path`): updates the xattr record and runs
/// the configured remotes in order.
pub fn dispatch(cfg: &HsmConfig, kind: RequestKind, full_path: &str) -> Result<()> {
    let mount = mount_for(cfg, full_path).ok_or(BrokerError::NotFound)?;
    let rel = relpath(mount, full_path);
    let backing = backing_path(mount, &rel);

    let mut record = hsm::read_record(&backing)?;
    match kind {
        RequestKind::Stage => {
            if !record.needs_staging() {
                debug!(path = full_path, "stage requested on a node already online");
            }
            run_remotes(mount, full_path, kind)?;
            record.apply_stage();
        }
        RequestKind::Archive => {
            run_remotes(mount, full_path, kind)?;
            record.apply_archive();
        }
        RequestKind::Release => {
            let meta = std::fs::metadata(&backing).map_err(BrokerError::Io)?;
            run_remotes(mount, full_path, kind)?;
            record.apply_release(meta.nlink() as u32, meta.size(), meta.blocks() as u64 * 512);
        }
        RequestKind::Recycle => {
            run_remotes(mount, full_path, kind)?;
        }
        RequestKind::Unmanage => {
            record.apply_unmanage();
        }
        RequestKind::Mount => {
            return Err(BrokerError::BadInput("dispatch() does not handle MOUNT".into()));
        }
    }
    hsm::write_record(&backing, &record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::config::RemoteConfig;

    fn sample_cfg(tmp: &Path) -> HsmConfig {
        HsmConfig {
            pidfile: None,
            maxproc: 1,
            mounts: vec![MountConfig {
                path: "/scratch".to_string(),
                local: Some(tmp.to_string_lossy().into_owned()),
                remotes: vec![RemoteConfig {
                    name: "noop".to_string(),
                    archive_exec: Some("/bin/true".to_string()),
                    release_exec: Some("/bin/true".to_string()),
                    stage_exec: Some("/bin/true".to_string()),
                    recycle_exec: Some("/bin/true".to_string()),
                }],
            }],
        }
    }

    #[test]
    fn mount_for_picks_longest_prefix_match() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = sample_cfg(tmp.path());
        let m = mount_for(&cfg, "/scratch/a/b").unwrap();
        assert_eq!(m.path, "/scratch");
        assert!(mount_for(&cfg, "/other").is_none());
    }

    #[test]
    fn dispatch_archive_updates_record() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"data").unwrap();
        let cfg = sample_cfg(tmp.path());
        dispatch(&cfg, RequestKind::Archive, "/scratch/f").unwrap();
        let record = hsm::read_record(&file).unwrap();
        assert_eq!(record.state, hsm::HsmState::Unmodified);
    }

    #[test]
    fn dispatch_unmanage_resets_record() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"data").unwrap();
        let cfg = sample_cfg(tmp.path());
        dispatch(&cfg, RequestKind::Release, "/scratch/f").unwrap();
        dispatch(&cfg, RequestKind::Unmanage, "/scratch/f").unwrap();
        let record = hsm::read_record(&file).unwrap();
        assert_eq!(record.state, hsm::HsmState::Unmanaged);
    }
}
