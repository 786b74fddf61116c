//! Path compiler and route registry for Trellis.
//!
//! This crate holds the allocation-light half of the framework: it turns
//! route patterns into matchers, parses host patterns, and keeps routes in
//! a method-indexed registry that is frozen before serving.
//!
//! # Features
//!
//! - **Pattern Compiler**: parameters, optional segments, wildcards,
//!   greedy `+`, and typed constraints (`/users/:id<int>`)
//! - **Domain Patterns**: host matching with captures (`:user.blog.example.com`)
//! - **Registration Order**: the earliest registered matching route wins
//! - **Radix Index**: optional per-method prefix trie to narrow candidates
//! - **Fixed Slots**: captures land in a reusable [`ParamValues`] array
//!
//! # Example
//!
//! ```rust
//! use trellis_router::{ParamValues, PatternOptions, RoutePattern};
//!
//! let pattern = RoutePattern::compile("/users/:id<int>/*", PatternOptions::default()).unwrap();
//! let mut values = ParamValues::new();
//!
//! assert!(pattern.match_path("/users/42/posts/7", "/users/42/posts/7", &mut values));
//! assert_eq!(pattern.param_names(), ["id", "*"]);
//! assert_eq!(values.as_slice(), ["42", "posts/7"]);
//!
//! assert!(!pattern.match_path("/users/abc", "/users/abc", &mut values));
//! ```
//!
//! # Architecture
//!
//! ```text
//!   RouterBuilder (mutable, per-method slots + USE slot)
//!          │ build(radix)
//!          ▼
//!   Router (frozen)
//!     ├─ stacks[method]   USE merged in by registration position
//!     ├─ radix[method]    literal prefix → stack indices
//!     └─ domains          deduplicated host patterns
//! ```

mod constraint;
mod domain;
mod error;
mod method;
mod node;
mod params;
mod pattern;
mod router;

pub use constraint::Constraint;
pub use domain::{normalize_host, DomainPattern};
pub use error::{DomainError, PatternError};
pub use method::{MethodKind, Slot, METHOD_COUNT, USE_SLOT};
pub use node::{Candidates, RadixIndex};
pub use params::{ParamValues, Params, MAX_PARAMS};
pub use pattern::{normalize_candidate, PatternOptions, RoutePattern, Segment, SegmentKind};
pub use router::{Entry, Routable, Router, RouterBuilder};
