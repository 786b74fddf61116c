//! Parameter storage.
//!
//! [`ParamValues`] holds positional path captures in a fixed-capacity
//! array that is reused across requests, so a pooled context never
//! reallocates its slots. [`Params`] is a small named map used for domain
//! captures and for handing matches to callers outside the hot path.

use smallvec::SmallVec;

/// Maximum number of parameters a single pattern may declare.
pub const MAX_PARAMS: usize = 30;

/// Domain captures kept inline before spilling to the heap.
const INLINE_PARAMS: usize = 4;

/// Positional parameter values captured by a path match.
///
/// The slot array has a fixed capacity of [`MAX_PARAMS`]. Clearing only
/// touches the slots used by the previous match and keeps the string
/// buffers for reuse.
///
/// # Example
///
/// ```rust
/// use trellis_router::ParamValues;
///
/// let mut values = ParamValues::new();
/// values.set(0, "entity");
/// values.set(1, "1/2");
/// assert_eq!(values.len(), 2);
/// assert_eq!(values.get(1), "1/2");
///
/// values.clear();
/// assert!(values.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct ParamValues {
    slots: Box<[String; MAX_PARAMS]>,
    len: usize,
}

impl Default for ParamValues {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamValues {
    /// Creates an empty slot array.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| String::new())),
            len: 0,
        }
    }

    /// Writes `value` into slot `index`, growing the used length.
    ///
    /// Indices at or beyond [`MAX_PARAMS`] are ignored; patterns that
    /// would need them are rejected at compile time.
    pub fn set(&mut self, index: usize, value: &str) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.clear();
            slot.push_str(value);
            if index >= self.len {
                self.len = index + 1;
            }
        }
    }

    /// Returns the value in slot `index`, or `""` when unused.
    #[must_use]
    pub fn get(&self, index: usize) -> &str {
        if index < self.len {
            &self.slots[index]
        } else {
            ""
        }
    }

    /// Number of slots written by the last match.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The used slots, in pattern order.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.slots[..self.len]
    }

    /// Clears the slots used by the previous match.
    pub fn clear(&mut self) {
        for slot in &mut self.slots[..self.len] {
            slot.clear();
        }
        self.len = 0;
    }

    /// Truncates to `len` slots, clearing the rest.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            for slot in &mut self.slots[len..self.len] {
                slot.clear();
            }
            self.len = len;
        }
    }
}

/// Named captures of a domain pattern, in label order.
///
/// Hosts rarely carry more than a couple of parameters, so the pairs live
/// inline for the common case.
///
/// ```rust
/// use trellis_router::Params;
///
/// let mut params = Params::new();
/// params.insert("user", "john");
/// params.insert("user", "jane");
///
/// assert_eq!(params.get("user"), Some("jane"));
/// assert_eq!(params.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    pairs: SmallVec<[(String, String); INLINE_PARAMS]>,
}

impl Params {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing an earlier capture of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.pairs.push((name, value)),
        }
    }

    /// Looks up a capture by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v.as_str()))
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of captures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// `(name, value)` pairs in capture order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Drops every capture but keeps the buffer.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}
