//! The host interception boundary (spec §6.1), implemented against
//! `fuser::Filesystem`. Owns the per-mount node tree and request table and
//! drives the C4 trigger engine from `lookup`/`readdir`/`getattr`/`mkdir`.
//!
//! Grounded in the pack's `spkenv-spk` PID-routing FUSE filesystem
//! (`Router`/`Mount` in `crates/spfs-vfs/src/macos/router.rs`), whose
//! `Filesystem` impl this mirrors method-for-method.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use broker_core::error::BrokerError;
use broker_core::node::{NodeAttr, NodeId, Tree, DIR_MODE};
use broker_core::request::RequestTable;
use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyDirectory, ReplyEmpty, ReplyEntry, Request};
use tracing::{instrument, warn};

use crate::trigger::{mount_foreign_over, trigger_for_node};

/// How long the kernel may cache a lookup/attr reply before re-asking
/// (spec says nothing in-kernel should ever diverge from the live tree, so
/// this stays short rather than `Duration::MAX`).
const ATTR_TTL: Duration = Duration::from_secs(1);

const FUSE_ROOT_ID: u64 = 1;

fn ino_of(node: NodeId) -> u64 {
    u64::from(node.raw()) + 1
}

fn node_of(ino: u64) -> NodeId {
    NodeId::from_raw((ino - 1) as u32)
}

pub struct BrokerFs {
    tree: Arc<Tree>,
    requests: Arc<RequestTable>,
    session: Arc<broker_core::channel::SingleSession>,
    /// Label used as the `from` field of every fingerprint this mount
    /// posts, e.g. `"map /net"` (§6.2 `Request.from`).
    from: String,
    /// The full host path this broker mount is rooted at (§6.2
    /// `Request.prefix` for root-level lookups).
    mountpoint: String,
}

impl BrokerFs {
    pub fn new(
        tree: Arc<Tree>,
        requests: Arc<RequestTable>,
        session: Arc<broker_core::channel::SingleSession>,
        from: String,
        mountpoint: String,
    ) -> Self {
        BrokerFs {
            tree,
            requests,
            session,
            from,
            mountpoint,
        }
    }

    fn attr_for(&self, node: NodeId) -> FileAttr {
        let a: NodeAttr = self.tree.getattr(node);
        to_file_attr(ino_of(node), &a)
    }

    fn trigger(&self, req: &Request<'_>, node: NodeId) -> Result<(), i32> {
        let path = self.tree.path(node);
        let key = self.tree.key_of(node);
        let prefix = self
            .tree
            .parent_of(node)
            .map(|p| self.tree.path(p))
            .unwrap_or_else(|| self.mountpoint.clone());
        match trigger_for_node(
            &self.tree,
            &self.requests,
            &self.session,
            req.pid() as i32,
            node,
            &self.from,
            &path,
            &prefix,
            &key,
        ) {
            Ok(()) => {
                if self.tree.location_of(node).is_some() && !self.tree.is_mounted_over(node) {
                    let target = format!("{}{}", self.mountpoint, path);
                    if let Err(e) = mount_foreign_over(&self.tree, node, &target) {
                        warn!(path, error = %e, "vfs_mount_over failed after successful trigger");
                        return Err(BrokerError::Io(std::io::Error::other(e.to_string())).to_errno());
                    }
                }
                Ok(())
            }
            Err(e) => Err(e.to_errno()),
        }
    }
}

fn to_file_attr(ino: u64, a: &NodeAttr) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: a.ctime,
        mtime: a.ctime,
        ctime: a.ctime,
        crtime: a.ctime,
        kind: FileType::Directory,
        perm: DIR_MODE as u16,
        nlink: a.nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl Filesystem for BrokerFs {
    #[instrument(skip_all, fields(pid = req.pid()))]
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_node = if parent == FUSE_ROOT_ID {
            self.tree.root()
        } else {
            node_of(parent)
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let node = match self.tree.lookup(parent_node, name) {
            Ok(n) => n,
            Err(BrokerError::NotFound) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        if let Err(errno) = self.trigger(req, node) {
            reply.error(errno);
            return;
        }
        reply.entry(&ATTR_TTL, &self.attr_for(node), 0);
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let node = if ino == FUSE_ROOT_ID { self.tree.root() } else { node_of(ino) };
        if let Err(errno) = self.trigger(req, node) {
            reply.error(errno);
            return;
        }
        reply.attr(&ATTR_TTL, &self.attr_for(node));
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn readdir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let node = if ino == FUSE_ROOT_ID { self.tree.root() } else { node_of(ino) };
        if let Err(errno) = self.trigger(req, node) {
            reply.error(errno);
            return;
        }
        let entries = self.tree.readdir(node);
        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            let kind = FileType::Directory;
            let child_ino = entry.node.map(ino_of).unwrap_or(ino);
            if reply.add(child_ino, (i + 1) as i64, kind, OsStr::from_bytes(entry.name.as_bytes())) {
                break;
            }
        }
        reply.ok();
    }

    /// §4.2: `mkdir` is permitted only for the helper or a descendant.
    #[instrument(skip_all, fields(pid = req.pid()))]
    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let is_helper = self
            .session
            .current()
            .is_some_and(|s| s.is_descendant(req.pid() as i32));
        if !is_helper {
            reply.error(libc::EPERM);
            return;
        }
        let parent_node = if parent == FUSE_ROOT_ID { self.tree.root() } else { node_of(parent) };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let node = self.tree.mkdir(parent_node, name);
        reply.entry(&ATTR_TTL, &self.attr_for(node), 0);
    }

    /// Directory renaming at any level is unsupported (spec scenario 6).
    #[instrument(skip_all, fields(pid = req.pid()))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EOPNOTSUPP);
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        if ino != FUSE_ROOT_ID {
            self.tree.reclaim(node_of(ino));
        }
    }

    fn destroy(&mut self) {
        self.requests.force_unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_roundtrips_through_node_id() {
        let n = NodeId::from_raw(41);
        assert_eq!(node_of(ino_of(n)), n);
    }

    #[test]
    fn file_attr_reflects_synthetic_directory_shape() {
        let attr = to_file_attr(
            5,
            &NodeAttr {
                fileno: 5,
                ctime: SystemTime::now(),
                nlink: 3,
            },
        );
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, DIR_MODE as u16);
        assert_eq!(attr.nlink, 3);
    }
}
