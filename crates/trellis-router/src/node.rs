//! Radix index over literal route prefixes.
//!
//! Every compiled pattern starts with a (possibly empty) run of constant
//! text. The index stores each route position under that text in a
//! compressed trie, so a lookup only has to consider routes whose literal
//! prefix is a prefix of the request path. Full pattern matching still
//! decides the winner; the index only narrows the candidate set.
//!
//! ```text
//!                 "" [wildcard routes]
//!                  │
//!                 "/"
//!          ┌───────┴────────┐
//!        "api/"           "static"
//!     ┌────┴────┐            [7]
//!   "users"   "v1/"
//!    [0,3]     [1]
//! ```

use smallvec::SmallVec;

/// Candidate buffer returned by lookups.
pub type Candidates = SmallVec<[u32; 16]>;

/// A node in the prefix trie.
#[derive(Debug, Clone, Default)]
pub struct Node {
    label: Vec<u8>,
    routes: Vec<u32>,
    children: Vec<Node>,
}

impl Node {
    fn leaf(label: &[u8], route: u32) -> Self {
        Self {
            label: label.to_vec(),
            routes: vec![route],
            children: Vec::new(),
        }
    }

    fn insert(&mut self, key: &[u8], route: u32) {
        if key.is_empty() {
            self.routes.push(route);
            return;
        }

        let Some(pos) = self.children.iter().position(|c| c.label[0] == key[0]) else {
            let at = self
                .children
                .partition_point(|c| c.label[0] < key[0]);
            self.children.insert(at, Self::leaf(key, route));
            return;
        };

        let child = &mut self.children[pos];
        let common = child
            .label
            .iter()
            .zip(key)
            .take_while(|(a, b)| a == b)
            .count();

        if common < child.label.len() {
            let mut lower = std::mem::take(child);
            child.label = lower.label[..common].to_vec();
            lower.label.drain(..common);
            child.children.push(lower);
        }
        child.insert(&key[common..], route);
    }

    /// Number of nodes in this subtree.
    fn count(&self) -> usize {
        1 + self.children.iter().map(Self::count).sum::<usize>()
    }
}

/// A per-method index from literal prefix to route positions.
///
/// # Example
///
/// ```rust
/// use trellis_router::{Candidates, RadixIndex};
///
/// let mut index = RadixIndex::new();
/// index.insert("/api/users", 0);
/// index.insert("/api/", 1);
/// index.insert("/static", 2);
///
/// let mut out = Candidates::new();
/// index.lookup("/api/users/7", &mut out);
/// assert_eq!(out.as_slice(), [0, 1]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RadixIndex {
    root: Node,
    len: usize,
}

impl RadixIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `route` under `prefix`.
    pub fn insert(&mut self, prefix: &str, route: u32) {
        self.root.insert(prefix.as_bytes(), route);
        self.len += 1;
    }

    /// Number of routes indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of trie nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Collects every route whose prefix is a prefix of `path`, sorted by
    /// position so registration order is preserved.
    pub fn lookup(&self, path: &str, out: &mut Candidates) {
        out.clear();
        let mut node = &self.root;
        let mut rest = path.as_bytes();
        out.extend_from_slice(&node.routes);

        while let Some(&first) = rest.first() {
            let Some(child) = node.children.iter().find(|c| c.label[0] == first) else {
                break;
            };
            if !rest.starts_with(&child.label) {
                break;
            }
            out.extend_from_slice(&child.routes);
            rest = &rest[child.label.len()..];
            node = child;
        }
        out.sort_unstable();
    }
}
