//! Lazy namespace (spec C2, §3.1, §4.2): an arena of [`Node`]s forming the
//! directory tree mirrored under a single broker mount.
//!
//! Per the design note in spec §9 ("manual per-node back-pointers forming
//! cycles"), this deliberately avoids `Rc<RefCell<..>>` parent/child links in
//! favor of an arena keyed by [`NodeId`], with parent and children stored as
//! ids. The whole arena lives behind one [`std::sync::Mutex`] per mount
//! (`Tree`), which is the "mount-lock" of the §5 lock order.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Instant, SystemTime},
};

use crate::error::{BrokerError, Result};

/// Opaque handle into a [`Tree`]'s arena. Stable for the lifetime of the
/// owning broker mount (I-N5: nodes are never renamed or reparented).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Recovers a `NodeId` from the raw value a host interception boundary
    /// (e.g. a FUSE inode number) stores it as.
    pub fn from_raw(v: u32) -> Self {
        NodeId(v)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A name in a broker-controlled directory tree (spec §3.1).
#[derive(Debug)]
pub struct Node {
    pub key: String,
    /// Comma-separated, not yet joined with ancestors' options.
    pub options: String,
    pub location: Option<String>,
    pub map: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Suppresses triggering until this instant elapses (None = always
    /// subject to triggering, the automounter default until something
    /// mounts over the node).
    pub cached_until: Option<Instant>,
    pub retries: u32,
    pub ctime: SystemTime,
    pub fileno: u64,
    /// Set once a foreign filesystem has been mounted over this node via
    /// `vfs_mount_over` (§6.1); cleared by `reclaim`.
    pub mounted_over: bool,
}

impl Node {
    fn new(key: String, options: String, fileno: u64) -> Self {
        Node {
            key,
            options,
            location: None,
            map: None,
            parent: None,
            children: Vec::new(),
            cached_until: None,
            retries: 0,
            ctime: SystemTime::now(),
            fileno,
            mounted_over: false,
        }
    }

    /// (I-N3) Leaf entry: has `location`, no `map`.
    pub fn is_leaf(&self) -> bool {
        self.location.is_some()
    }

    /// (I-N3) Internal node indirecting to another map.
    pub fn is_map_ref(&self) -> bool {
        self.map.is_some() && self.location.is_none()
    }

    pub fn is_wildcard(&self) -> bool {
        self.key == "*"
    }

    pub fn cached(&self) -> bool {
        self.cached_until.is_some_and(|t| Instant::now() < t)
    }
}

/// One directory entry as produced by `readdir` (spec §4.2).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub fileno: u64,
    pub node: Option<NodeId>,
}

/// The in-memory tree for a single broker mount (spec C2).
///
/// Protected by one exclusive lock for the whole tree, per §5: "the node
/// tree is protected by a per-mount exclusive lock."
pub struct Tree {
    inner: Mutex<Inner>,
    fileno_counter: AtomicU64,
}

struct Inner {
    arena: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// `key = "/"`, no parent.
    pub fn new_indirect() -> Self {
        Self::new_root("/")
    }

    /// Direct-map roots use `key = "/-"`.
    pub fn new_direct() -> Self {
        Self::new_root("/-")
    }

    fn new_root(key: &str) -> Self {
        let fileno_counter = AtomicU64::new(1);
        let root_fileno = fileno_counter.fetch_add(1, Ordering::Relaxed);
        let root = Node::new(key.to_string(), String::new(), root_fileno);
        Tree {
            inner: Mutex::new(Inner {
                arena: vec![root],
                root: NodeId(0),
            }),
            fileno_counter,
        }
    }

    pub fn root(&self) -> NodeId {
        self.inner.lock().unwrap().root
    }

    fn next_fileno(&self) -> u64 {
        self.fileno_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a freshly constructed child under `parent`, returning its id.
    /// Used both by map-parse-time population and by wildcard/lookup-time
    /// materialization (spec §4.3.1 step 5).
    pub fn insert_child(
        &self,
        parent: NodeId,
        key: String,
        options: String,
        location: Option<String>,
        map: Option<String>,
    ) -> NodeId {
        let fileno = self.next_fileno();
        let mut inner = self.inner.lock().unwrap();
        let id = NodeId(inner.arena.len() as u32);
        let mut node = Node::new(key, options, fileno);
        node.location = location;
        node.map = map;
        node.parent = Some(parent);
        inner.arena.push(node);
        inner.arena[parent.0 as usize].children.push(id);
        id
    }

    /// `lookup(parent, name)`: returns the child matching `name`, or the
    /// literal `*` sibling cloned with its key replaced (spec §4.3.1 step 5),
    /// or `NotFound`.
    pub fn lookup(&self, parent: NodeId, name: &str) -> Result<NodeId> {
        {
            let inner = self.inner.lock().unwrap();
            let parent_node = &inner.arena[parent.0 as usize];
            for &child in &parent_node.children {
                if inner.arena[child.0 as usize].key == name {
                    return Ok(child);
                }
            }
        }
        // no literal match: look for a wildcard sibling to clone (not held
        // across insert_child, which takes its own lock).
        let wildcard = {
            let inner = self.inner.lock().unwrap();
            let parent_node = &inner.arena[parent.0 as usize];
            parent_node
                .children
                .iter()
                .copied()
                .find(|&c| inner.arena[c.0 as usize].is_wildcard())
        };
        match wildcard {
            Some(wc) => {
                let (options, location, map) = {
                    let inner = self.inner.lock().unwrap();
                    let w = &inner.arena[wc.0 as usize];
                    (w.options.clone(), w.location.clone(), w.map.clone())
                };
                let location = location.map(|l| crate::map::substitute_ampersand(&l, name));
                Ok(self.insert_child(parent, name.to_string(), options, location, map))
            }
            None => Err(BrokerError::NotFound),
        }
    }

    /// `readdir(node)`: `.`, `..`, then children in insertion order.
    pub fn readdir(&self, node: NodeId) -> Vec<DirEntry> {
        let inner = self.inner.lock().unwrap();
        let n = &inner.arena[node.0 as usize];
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                fileno: n.fileno,
                node: Some(node),
            },
            DirEntry {
                name: "..".to_string(),
                fileno: n
                    .parent
                    .map(|p| inner.arena[p.0 as usize].fileno)
                    .unwrap_or(n.fileno),
                node: n.parent,
            },
        ];
        for &c in &n.children {
            let child = &inner.arena[c.0 as usize];
            entries.push(DirEntry {
                name: child.key.clone(),
                fileno: child.fileno,
                node: Some(c),
            });
        }
        entries
    }

    /// `getattr(node)`: synthetic directory attributes (spec §4.2).
    pub fn getattr(&self, node: NodeId) -> NodeAttr {
        let inner = self.inner.lock().unwrap();
        let n = &inner.arena[node.0 as usize];
        NodeAttr {
            fileno: n.fileno,
            ctime: n.ctime,
            nlink: 2 + n.children.iter().filter(|&&c| {
                inner.arena[c.0 as usize].location.is_none() && inner.arena[c.0 as usize].map.is_none()
            }).count() as u32,
        }
    }

    /// `mkdir(parent, name)`. Caller identity (helper-only) is checked by
    /// the caller before invoking this; the tree itself has no notion of
    /// identity.
    pub fn mkdir(&self, parent: NodeId, name: &str) -> NodeId {
        self.insert_child(parent, name.to_string(), String::new(), None, None)
    }

    /// Looks up a literal (non-wildcard) child by exact key, without the
    /// wildcard-materialization side effect `lookup` has. Used by
    /// map-parse-time population, which must not conjure wildcard clones
    /// for keys the map simply hasn't declared yet.
    pub fn find_literal_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let inner = self.inner.lock().unwrap();
        inner.arena[parent.0 as usize]
            .children
            .iter()
            .copied()
            .find(|&c| inner.arena[c.0 as usize].key == name)
    }

    /// Walks/creates `components` under `parent`, reusing existing literal
    /// children (so two targets sharing a path prefix, e.g. `/a` and `/a/b`,
    /// don't get duplicate intermediate nodes) and setting `location`/`map`
    /// only on the final component (I-N3: intermediate directories have
    /// neither). Returns the final node's id.
    pub fn insert_path(
        &self,
        parent: NodeId,
        components: &[&str],
        leaf_options: &str,
        location: Option<String>,
        map: Option<String>,
    ) -> NodeId {
        let mut cur = parent;
        for (i, comp) in components.iter().enumerate() {
            let is_last = i == components.len() - 1;
            cur = match self.find_literal_child(cur, comp) {
                Some(id) => {
                    if is_last {
                        self.set_leaf(id, leaf_options.to_string(), location.clone(), map.clone());
                    }
                    id
                }
                None if is_last => {
                    self.insert_child(cur, comp.to_string(), leaf_options.to_string(), location.clone(), map.clone())
                }
                None => self.insert_child(cur, comp.to_string(), String::new(), None, None),
            };
        }
        cur
    }

    /// Sets an existing node's `location`/`map`, merging `options` into
    /// whatever options the node already carries (entry-level options set
    /// at creation, target-level options merged in here), preserving
    /// duplicates per P4.
    pub fn set_leaf(&self, node: NodeId, options: String, location: Option<String>, map: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        let n = &mut inner.arena[node.0 as usize];
        if !options.is_empty() {
            n.options = if n.options.is_empty() {
                options
            } else {
                format!("{},{options}", n.options)
            };
        }
        if location.is_some() {
            n.location = location;
        }
        if map.is_some() {
            n.map = map;
        }
    }

    /// Releases the backing identity for `node` without freeing the arena
    /// slot (I-N5).
    pub fn reclaim(&self, node: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.arena[node.0 as usize].mounted_over = false;
    }

    pub fn set_mounted_over(&self, node: NodeId, mounted: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.arena[node.0 as usize].mounted_over = mounted;
    }

    pub fn is_mounted_over(&self, node: NodeId) -> bool {
        self.inner.lock().unwrap().arena[node.0 as usize].mounted_over
    }

    pub fn set_cached_until(&self, node: NodeId, until: Option<Instant>) {
        self.inner.lock().unwrap().arena[node.0 as usize].cached_until = until;
    }

    pub fn cached(&self, node: NodeId) -> bool {
        self.inner.lock().unwrap().arena[node.0 as usize].cached()
    }

    /// (P4) Effective options: the `,`-join of ancestors' options from root
    /// to `node`, preserving duplicates.
    pub fn effective_options(&self, node: NodeId) -> String {
        let inner = self.inner.lock().unwrap();
        let mut chain = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = &inner.arena[id.0 as usize];
            if !n.options.is_empty() {
                chain.push(n.options.clone());
            }
            cur = n.parent;
        }
        chain.reverse();
        chain.join(",")
    }

    /// Full path of `node` from the mount root, e.g. `/alpha/beta`.
    pub fn path(&self, node: NodeId) -> String {
        let inner = self.inner.lock().unwrap();
        let mut parts = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = &inner.arena[id.0 as usize];
            if n.parent.is_some() {
                parts.push(n.key.clone());
            }
            cur = n.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    pub fn location_of(&self, node: NodeId) -> Option<String> {
        self.inner.lock().unwrap().arena[node.0 as usize].location.clone()
    }

    pub fn map_of(&self, node: NodeId) -> Option<String> {
        self.inner.lock().unwrap().arena[node.0 as usize].map.clone()
    }

    pub fn key_of(&self, node: NodeId) -> String {
        self.inner.lock().unwrap().arena[node.0 as usize].key.clone()
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.inner.lock().unwrap().arena[node.0 as usize].parent
    }

    /// (I-N5) Removes a node whose children are empty. Used only by
    /// administrative unmount of a subtree; renaming/reparenting remains
    /// unsupported (scenario 6, `EOPNOTSUPP`).
    pub fn remove_leaf(&self, node: NodeId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.arena[node.0 as usize].children.is_empty() {
            return Err(BrokerError::BadInput("node has children".into()));
        }
        if let Some(parent) = inner.arena[node.0 as usize].parent {
            inner.arena[parent.0 as usize].children.retain(|&c| c != node);
        }
        Ok(())
    }

    /// §3.1's `retries` counter, carried on every node per the generic node
    /// model. The automounter never calls this: §4.1's retry policy is
    /// "HSM variant only", and this workspace's HSM action dispatch has no
    /// `Node` of its own to count against (see `brokerctl`'s `RetryPolicy`).
    /// Kept for a future HSM-over-FUSE trigger path that would share this
    /// node tree with the automounter.
    pub fn increment_retries(&self, node: NodeId) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let n = &mut inner.arena[node.0 as usize];
        n.retries += 1;
        n.retries
    }

    pub fn reset_retries(&self, node: NodeId) {
        self.inner.lock().unwrap().arena[node.0 as usize].retries = 0;
    }
}

/// Synthetic directory attributes returned by `getattr` (spec §4.2): mode
/// 0755, `fileid = fileno`, times from `ctime`.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub fileno: u64,
    pub ctime: SystemTime,
    pub nlink: u32,
}

pub const DIR_MODE: u32 = 0o755;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent() {
        let tree = Tree::new_indirect();
        assert_eq!(tree.key_of(tree.root()), "/");
        assert!(tree.parent_of(tree.root()).is_none());
    }

    #[test]
    fn direct_root_key() {
        let tree = Tree::new_direct();
        assert_eq!(tree.key_of(tree.root()), "/-");
    }

    #[test]
    fn wildcard_materializes_on_miss() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        tree.insert_child(root, "*".to_string(), "rw".to_string(), Some("&:/export/&".to_string()), None);
        let found = tree.lookup(root, "foo").unwrap();
        assert_eq!(tree.key_of(found), "foo");
        assert_eq!(tree.location_of(found).unwrap(), "foo:/export/foo");
        // second lookup now resolves the materialized literal node, not another clone
        let found2 = tree.lookup(root, "foo").unwrap();
        assert_eq!(found, found2);
    }

    #[test]
    fn effective_options_preserves_duplicates() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        let a = tree.insert_child(root, "a".to_string(), "rw".to_string(), None, None);
        let b = tree.insert_child(a, "b".to_string(), "rw".to_string(), None, None);
        assert_eq!(tree.effective_options(b), "rw,rw");
    }

    #[test]
    fn readdir_includes_dot_and_dotdot() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        tree.insert_child(root, "a".to_string(), String::new(), None, None);
        let entries = tree.readdir(root);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[2].name, "a");
    }

    #[test]
    fn insert_path_shares_common_prefix() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        let key = tree.insert_child(root, "beta".to_string(), "rw".to_string(), None, None);
        let a = tree.insert_path(key, &["a"], "soft", Some("host:/x".to_string()), None);
        let b = tree.insert_path(key, &["b"], "", Some("host:/y".to_string()), None);
        assert_ne!(a, b);
        assert_eq!(tree.location_of(a).unwrap(), "host:/x");
        assert_eq!(tree.location_of(b).unwrap(), "host:/y");
        assert_eq!(tree.key_of(a), "a");
    }

    #[test]
    fn insert_path_reuses_intermediate_dirs() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        let first = tree.insert_path(root, &["a", "b"], "", Some("host:/1".to_string()), None);
        let second = tree.insert_path(root, &["a", "c"], "", Some("host:/2".to_string()), None);
        let a1 = tree.parent_of(first).unwrap();
        let a2 = tree.parent_of(second).unwrap();
        assert_eq!(a1, a2, "both paths should share the same intermediate `a` node");
        assert!(tree.location_of(a1).is_none());
    }

    #[test]
    fn readdir_is_monotonic_without_mkdir() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        tree.insert_child(root, "a".to_string(), String::new(), None, None);
        tree.insert_child(root, "b".to_string(), String::new(), None, None);
        let first: Vec<String> = tree.readdir(root).into_iter().map(|e| e.name).collect();
        let second: Vec<String> = tree.readdir(root).into_iter().map(|e| e.name).collect();
        assert_eq!(first, second, "repeated readdir with no intervening mkdir must reproduce the same sequence");
    }

    #[test]
    fn remove_leaf_rejects_nonempty() {
        let tree = Tree::new_indirect();
        let root = tree.root();
        let a = tree.insert_child(root, "a".to_string(), String::new(), None, None);
        tree.insert_child(a, "b".to_string(), String::new(), None, None);
        assert!(tree.remove_leaf(a).is_err());
    }
}
