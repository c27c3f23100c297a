//! The in-memory filesystem tree: nodes, parent/child mapping, xattrs,
//! and hardlink indirection.
//!
//! Nodes live in an arena owned by a single [`Tree`], addressed by
//! [`NodeId`]. Parent -> child edges are the only owning edges; a
//! hardlink is a non-owning [`NodeId`] back-reference resolved once,
//! after parsing, in the fixup pass (see [`crate::dump`]).

use rustc_hash::FxHashMap;

use crate::error::{CfsError, Result};

/// File type bits out of `mode`, the same encoding as POSIX `st_mode`.
const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeKind {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl NodeKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => NodeKind::Directory,
            S_IFLNK => NodeKind::Symlink,
            S_IFBLK => NodeKind::BlockDevice,
            S_IFCHR => NodeKind::CharDevice,
            S_IFIFO => NodeKind::Fifo,
            S_IFSOCK => NodeKind::Socket,
            _ => NodeKind::Regular,
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, NodeKind::Directory)
    }
}

/// A timestamp with second + nanosecond resolution, per the dump format's
/// `MTIME` field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u64,
}

/// A stable index into a [`Tree`]'s node arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A single file, directory, symlink, device, or socket in the tree.
#[derive(Debug)]
pub struct Node {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev: u32,
    pub size: u64,
    pub mtime: Timestamp,
    pub payload: Option<String>,
    pub content: Option<Vec<u8>>,
    pub digest: Option<[u8; 32]>,
    pub xattrs: FxHashMap<Vec<u8>, Vec<u8>>,
    pub name: Vec<u8>,
    pub children: FxHashMap<Vec<u8>, NodeId>,
    /// Ordered names, so directory iteration is reproducible even though
    /// `children` is a hash map for O(1) lookups.
    pub child_order: Vec<Vec<u8>>,
    pub parent: Option<NodeId>,
    pub hardlink_target: Option<NodeId>,
}

impl Node {
    fn new() -> Self {
        Node {
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            rdev: 0,
            size: 0,
            mtime: Timestamp::default(),
            payload: None,
            content: None,
            digest: None,
            xattrs: FxHashMap::default(),
            name: Vec::new(),
            children: FxHashMap::default(),
            child_order: Vec::new(),
            parent: None,
            hardlink_target: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    pub fn is_hardlink(&self) -> bool {
        self.hardlink_target.is_some()
    }

    pub fn set_xattr(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if self.xattrs.contains_key(&key) {
            return Err(CfsError::DuplicateXattr);
        }
        self.xattrs.insert(key, value);
        Ok(())
    }

    pub fn set_content(&mut self, content: Vec<u8>) -> Result<()> {
        if content.len() as u64 != self.size {
            return Err(CfsError::ContentSizeMismatch {
                expected: self.size,
                actual: content.len() as u64,
            });
        }
        self.content = Some(content);
        Ok(())
    }
}

/// An owning handle to a whole filesystem tree.
///
/// The arena is append-only until the tree is frozen (end of parse): no
/// API here removes a node. The whole tree, and every node in it, is
/// dropped together when the `Tree` is dropped.
#[derive(Debug)]
pub struct Tree {
    arena: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// Create a tree with a single, as-yet-unconfigured root node.
    pub fn new_root() -> Self {
        let arena = vec![Node::new()];
        Tree {
            arena,
            root: NodeId(0),
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.arena[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.arena[id.0]
    }

    /// Allocate a fresh, parentless node and return its id.
    pub fn new_node(&mut self) -> NodeId {
        self.arena.push(Node::new());
        NodeId(self.arena.len() - 1)
    }

    pub fn lookup_child(&self, dir: NodeId, name: &[u8]) -> Option<NodeId> {
        self.node(dir).children.get(name).copied()
    }

    /// Attach `child` under `parent` as `name`. `parent` must be a
    /// directory, `child` must not already have a parent, and `name`
    /// must be unique among `parent`'s children.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId, name: Vec<u8>) -> Result<()> {
        if !self.node(parent).kind().is_directory() {
            return Err(CfsError::MissingParent(lossy(&name)));
        }
        if self.node(child).parent.is_some() {
            return Err(CfsError::AlreadyExists(lossy(&name)));
        }
        if self.node(parent).children.contains_key(&name) {
            return Err(CfsError::AlreadyExists(lossy(&name)));
        }
        self.node_mut(parent).child_order.push(name.clone());
        self.node_mut(parent).children.insert(name.clone(), child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(child).name = name;
        Ok(())
    }

    /// Resolve a `/`-separated path against the tree, ignoring leading and
    /// repeated slashes and tolerating a trailing slash. Does not follow
    /// symlinks. Returns `None` if any component is missing.
    pub fn lookup_path(&self, path: &[u8]) -> Option<NodeId> {
        let mut current = self.root;
        for component in split_components(path) {
            current = self.lookup_child(current, component)?;
        }
        Some(current)
    }

    /// Resolve all but the last component of `path`, returning the parent
    /// directory and the final component name. Fails if any intermediate
    /// component is missing or isn't a directory.
    pub fn lookup_parent_path<'a>(&self, path: &'a [u8]) -> Result<(NodeId, &'a [u8])> {
        let components: Vec<&[u8]> = split_components(path).collect();
        let (last, parents) = components
            .split_last()
            .ok_or_else(|| CfsError::MissingParent(lossy(path)))?;

        let mut current = self.root;
        for component in parents {
            if !self.node(current).kind().is_directory() {
                return Err(CfsError::MissingParent(lossy(path)));
            }
            current = self
                .lookup_child(current, component)
                .ok_or_else(|| CfsError::MissingParent(lossy(path)))?;
        }
        if !self.node(current).kind().is_directory() {
            return Err(CfsError::MissingParent(lossy(path)));
        }
        Ok((current, last))
    }

    /// Make `node` a hardlink to `target`. `target` must not be a
    /// directory. Callers that want to preserve `target`'s own `nlink`
    /// (rather than have it silently overwritten) must save and restore
    /// it themselves around this call; see [`crate::dump`]'s hardlink
    /// fixup pass, which is the one place that matters.
    pub fn make_hardlink(&mut self, node: NodeId, target: NodeId) -> Result<()> {
        if self.node(target).kind().is_directory() {
            return Err(CfsError::HardlinkIsDir);
        }
        self.node_mut(node).hardlink_target = Some(target);
        Ok(())
    }

    /// Follow a node's hardlink indirection, if it has one. `nlink` is
    /// deliberately excluded from this: it is never shared through the
    /// hardlink edge.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        self.node(id).hardlink_target.unwrap_or(id)
    }

    /// Depth-first pre-order walk over every node in the tree, including
    /// the root, in child-insertion order.
    pub fn walk(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![self.root];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            if self.node(id).kind().is_directory() {
                // Push in reverse so traversal visits children in order.
                for name in self.node(id).child_order.iter().rev() {
                    stack.push(self.node(id).children[name]);
                }
            }
            Some(id)
        })
    }

    /// The full `/`-separated path from the root to `id`, not following
    /// hardlinks.
    pub fn path_of(&self, id: NodeId) -> Vec<u8> {
        let mut components = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            components.push(self.node(current).name.clone());
            current = parent;
        }
        components.reverse();
        let mut out = Vec::new();
        for c in components {
            out.push(b'/');
            out.extend_from_slice(&c);
        }
        if out.is_empty() {
            out.push(b'/');
        }
        out
    }
}

fn split_components(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.split(|&b| b == b'/').filter(|c| !c.is_empty())
}

pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_is_empty_at_start() {
        let tree = Tree::new_root();
        let root = tree.root_id();
        assert_eq!(tree.path_of(root), b"/");
        assert!(tree.node(root).children.is_empty());
    }

    #[test]
    fn add_and_lookup_child() {
        let mut tree = Tree::new_root();
        let root = tree.root_id();
        tree.node_mut(root).mode = S_IFDIR | 0o755;

        let a = tree.new_node();
        tree.node_mut(a).mode = S_IFREG | 0o644;
        tree.add_child(root, a, b"a".to_vec()).unwrap();

        assert_eq!(tree.lookup_child(root, b"a"), Some(a));
        assert_eq!(tree.lookup_path(b"/a"), Some(a));
        assert_eq!(tree.lookup_path(b"//a/"), Some(a));
        assert_eq!(tree.lookup_path(b"/nope"), None);
        assert_eq!(tree.path_of(a), b"/a");
    }

    #[test]
    fn duplicate_sibling_name_fails() {
        let mut tree = Tree::new_root();
        let root = tree.root_id();
        tree.node_mut(root).mode = S_IFDIR;
        let a = tree.new_node();
        let b = tree.new_node();
        tree.add_child(root, a, b"x".to_vec()).unwrap();
        assert!(tree.add_child(root, b, b"x".to_vec()).is_err());
    }

    #[test]
    fn hardlink_target_cant_be_dir() {
        let mut tree = Tree::new_root();
        let root = tree.root_id();
        tree.node_mut(root).mode = S_IFDIR;
        let link = tree.new_node();
        assert!(tree.make_hardlink(link, root).is_err());
    }

    #[test]
    fn duplicate_xattr_fails() {
        let mut tree = Tree::new_root();
        let id = tree.new_node();
        let node = tree.node_mut(id);
        node.set_xattr(b"k".to_vec(), b"v1".to_vec()).unwrap();
        assert!(node.set_xattr(b"k".to_vec(), b"v2".to_vec()).is_err());
    }

    #[test]
    fn content_size_mismatch_fails() {
        let mut tree = Tree::new_root();
        let id = tree.new_node();
        let node = tree.node_mut(id);
        node.size = 5;
        assert!(node.set_content(b"test".to_vec()).is_err());
        node.size = 4;
        assert!(node.set_content(b"test".to_vec()).is_ok());
    }

    #[test]
    fn walk_visits_in_insertion_order() {
        let mut tree = Tree::new_root();
        let root = tree.root_id();
        tree.node_mut(root).mode = S_IFDIR;
        let a = tree.new_node();
        tree.add_child(root, a, b"a".to_vec()).unwrap();
        let b = tree.new_node();
        tree.add_child(root, b, b"b".to_vec()).unwrap();

        let order: Vec<NodeId> = tree.walk().collect();
        assert_eq!(order, vec![root, a, b]);
    }
}
