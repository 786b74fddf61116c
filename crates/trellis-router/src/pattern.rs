//! Route pattern compiler and matcher.
//!
//! A pattern such as `/api/v1/:resource<alpha>/*` is compiled once at
//! registration into a sequence of [`Segment`]s. Matching walks the
//! segments against the request path with bounded backtracking and writes
//! the captures into a reusable [`ParamValues`] array.
//!
//! # Syntax
//!
//! | form | meaning |
//! |------|---------|
//! | `/users` | constant text |
//! | `:id` | one non-empty path segment |
//! | `:id?` | optional segment, captured as `""` when absent |
//! | `:id<int>` | constrained parameter (see [`Constraint`]) |
//! | `*` | any remainder, possibly empty, `/` included |
//! | `+` | any non-empty remainder |
//! | `\:` | literal `:` (also `\*`, `\+`, `\?`) |
//!
//! # Example
//!
//! ```rust
//! use trellis_router::{ParamValues, PatternOptions, RoutePattern};
//!
//! let pattern = RoutePattern::compile("/api/v1/:p/*", PatternOptions::default()).unwrap();
//! let mut values = ParamValues::new();
//!
//! assert!(pattern.match_path("/api/v1/entity/1/2", "/api/v1/entity/1/2", &mut values));
//! assert_eq!(values.as_slice(), ["entity", "1/2"]);
//! assert!(!pattern.match_path("/api/v1", "/api/v1", &mut values));
//! ```

use crate::constraint::Constraint;
use crate::error::PatternError;
use crate::params::{ParamValues, MAX_PARAMS};

/// Options that influence how a pattern is compiled and matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternOptions {
    /// Compare constant text case-sensitively.
    pub case_sensitive: bool,
    /// Treat `/a` and `/a/` as different paths.
    pub strict: bool,
}

/// The kind of a compiled segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal text.
    Constant,
    /// `:name`
    Param,
    /// `:name?`
    OptionalParam,
    /// `*`
    Wildcard,
    /// `+`
    Plus,
    /// `:name<...>`
    Constrained,
}

/// One compiled pattern segment.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Literal text, case-folded unless the pattern is case-sensitive.
    Const(String),
    /// A named parameter.
    Param {
        /// Parameter name
        name: String,
        /// Slot index in the capture array
        index: usize,
        /// Whether the parameter may be absent
        optional: bool,
        /// Whether the `/` before the parameter is optional too
        slash: bool,
        /// Constraints that must all hold
        constraints: Vec<Constraint>,
    },
    /// `*`, zero or more characters.
    Wildcard {
        /// `*` or `*N`
        name: String,
        /// Slot index in the capture array
        index: usize,
        /// Whether the `/` before the wildcard is optional too
        slash: bool,
    },
    /// `+`, one or more characters.
    Plus {
        /// `+` or `+N`
        name: String,
        /// Slot index in the capture array
        index: usize,
    },
}

impl Segment {
    /// Returns the kind of this segment.
    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Const(_) => SegmentKind::Constant,
            Self::Param { constraints, .. } if !constraints.is_empty() => SegmentKind::Constrained,
            Self::Param { optional: true, .. } => SegmentKind::OptionalParam,
            Self::Param { .. } => SegmentKind::Param,
            Self::Wildcard { .. } => SegmentKind::Wildcard,
            Self::Plus { .. } => SegmentKind::Plus,
        }
    }

    fn is_capture(&self) -> bool {
        !matches!(self, Self::Const(_))
    }
}

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    normalized: String,
    segments: Vec<Segment>,
    names: Vec<String>,
    prefix: String,
    options: PatternOptions,
}

type Captures = [(usize, usize); MAX_PARAMS];

impl RoutePattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] when a `+` is followed by anything other
    /// than constant text, a constraint is unknown or its regex fails to
    /// compile, more than [`MAX_PARAMS`] parameters are declared, or a
    /// parameter name is declared twice.
    pub fn compile(pattern: &str, options: PatternOptions) -> Result<Self, PatternError> {
        let normalized = normalize_pattern(pattern, options.strict);
        let mut segments = tokenize(pattern, &normalized, options)?;
        mark_optional_slashes(&mut segments);
        let names = assign_names(pattern, &mut segments)?;

        if let Some(pos) = segments.iter().position(|s| matches!(s, Segment::Plus { .. })) {
            if segments[pos + 1..].iter().any(Segment::is_capture) {
                return Err(PatternError::invalid(
                    pattern,
                    "'+' may only be followed by constant segments",
                ));
            }
        }

        let prefix = match segments.first() {
            Some(Segment::Const(text)) => text.clone(),
            _ => String::new(),
        };

        Ok(Self {
            raw: pattern.to_string(),
            normalized,
            segments,
            names,
            prefix,
            options,
        })
    }

    /// The pattern exactly as registered.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The pattern after leading/trailing slash normalisation.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// The compiled segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names in positional order.
    #[must_use]
    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    /// The options this pattern was compiled with.
    #[must_use]
    pub fn options(&self) -> PatternOptions {
        self.options
    }

    /// Leading constant text, used as the radix index key.
    #[must_use]
    pub fn literal_prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the positional slot for `name`.
    ///
    /// When a pattern holds several wildcards, `*` resolves to `*1`
    /// (likewise `+` to `+1`).
    #[must_use]
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name).or_else(|| match name {
            "*" => self.names.iter().position(|n| n == "*1"),
            "+" => self.names.iter().position(|n| n == "+1"),
            _ => None,
        })
    }

    /// Matches the whole of `path`.
    ///
    /// `detection` is the canonical (case-folded, trailing-slash trimmed)
    /// path and `original` the same path before folding; both must have
    /// the same length. Captured values are taken from `original`.
    pub fn match_path(&self, detection: &str, original: &str, values: &mut ParamValues) -> bool {
        self.run(detection, original, values, false)
    }

    /// Matches a prefix of `path` ending at a `/` boundary, as `USE`
    /// middleware does.
    pub fn match_prefix(&self, detection: &str, original: &str, values: &mut ParamValues) -> bool {
        self.run(detection, original, values, true)
    }

    /// Convenience matcher that folds `path` itself and returns the
    /// captured values.
    #[must_use]
    pub fn captures(&self, path: &str) -> Option<Vec<String>> {
        let original = normalize_candidate(path, self.options.strict);
        let detection = if self.options.case_sensitive {
            original.clone()
        } else {
            original.to_ascii_lowercase()
        };
        let mut values = ParamValues::new();
        self.match_path(&detection, &original, &mut values)
            .then(|| values.as_slice().to_vec())
    }

    fn run(&self, detection: &str, original: &str, values: &mut ParamValues, prefix: bool) -> bool {
        let (detection, original) = if detection.is_empty() {
            ("/", "/")
        } else {
            (detection, original)
        };
        if detection.len() != original.len() {
            return false;
        }

        let mut caps: Captures = [(0, 0); MAX_PARAMS];
        let matcher = Matcher {
            segments: &self.segments,
            path: detection,
            original,
            prefix,
        };
        if !matcher.step(0, 0, &mut caps) {
            return false;
        }

        for (i, (start, end)) in caps.iter().take(self.names.len()).enumerate() {
            values.set(i, &original[*start..*end]);
        }
        values.truncate(self.names.len());
        true
    }
}

struct Matcher<'a> {
    segments: &'a [Segment],
    path: &'a str,
    original: &'a str,
    prefix: bool,
}

impl Matcher<'_> {
    fn step(&self, seg: usize, pos: usize, caps: &mut Captures) -> bool {
        let bytes = self.path.as_bytes();
        let Some(segment) = self.segments.get(seg) else {
            return pos == bytes.len()
                || (self.prefix && (bytes[pos] == b'/' || (pos > 0 && bytes[pos - 1] == b'/')));
        };

        match segment {
            Segment::Const(text) => {
                self.path[pos..].starts_with(text.as_str()) && self.step(seg + 1, pos + text.len(), caps)
            }
            Segment::Param {
                index,
                optional,
                slash,
                constraints,
                ..
            } => {
                if *slash {
                    if bytes.get(pos) == Some(&b'/')
                        && self.param_at(seg, pos + 1, *index, *optional, constraints, caps)
                    {
                        return true;
                    }
                    caps[*index] = (pos, pos);
                    return self.step(seg + 1, pos, caps);
                }
                self.param_at(seg, pos, *index, *optional, constraints, caps)
            }
            Segment::Wildcard { index, slash, .. } => {
                if *slash {
                    if bytes.get(pos) == Some(&b'/') && self.greedy_at(seg, pos + 1, *index, 0, caps) {
                        return true;
                    }
                    caps[*index] = (pos, pos);
                    return self.step(seg + 1, pos, caps);
                }
                self.greedy_at(seg, pos, *index, 0, caps)
            }
            Segment::Plus { index, .. } => self.greedy_at(seg, pos, *index, 1, caps),
        }
    }

    /// Whether the segment after `seg` starts without a separator, which
    /// makes the current capture prefer the shortest split.
    fn followed_by_capture(&self, seg: usize) -> bool {
        self.segments.get(seg + 1).is_some_and(Segment::is_capture)
    }

    fn param_at(
        &self,
        seg: usize,
        start: usize,
        index: usize,
        optional: bool,
        constraints: &[Constraint],
        caps: &mut Captures,
    ) -> bool {
        let bytes = self.path.as_bytes();
        let seg_end = bytes[start.min(bytes.len())..]
            .iter()
            .position(|&b| b == b'/')
            .map_or(bytes.len(), |i| start + i);

        if seg_end > start {
            let try_end = |end: usize, caps: &mut Captures| {
                if !self.original.is_char_boundary(end) {
                    return false;
                }
                let value = &self.original[start..end];
                if !constraints.iter().all(|c| c.check(value)) {
                    return false;
                }
                caps[index] = (start, end);
                self.step(seg + 1, end, caps)
            };
            if self.followed_by_capture(seg) {
                if (start + 1..=seg_end).any(|end| try_end(end, caps)) {
                    return true;
                }
            } else if (start + 1..=seg_end).rev().any(|end| try_end(end, caps)) {
                return true;
            }
        }

        if optional && start <= bytes.len() {
            caps[index] = (start, start);
            return self.step(seg + 1, start, caps);
        }
        false
    }

    fn greedy_at(&self, seg: usize, start: usize, index: usize, min: usize, caps: &mut Captures) -> bool {
        let len = self.path.len();
        if start + min > len {
            return false;
        }
        let try_end = |end: usize, caps: &mut Captures| {
            if !self.original.is_char_boundary(end) {
                return false;
            }
            caps[index] = (start, end);
            self.step(seg + 1, end, caps)
        };
        if self.followed_by_capture(seg) {
            (start + min..=len).any(|end| try_end(end, caps))
        } else {
            (start + min..=len).rev().any(|end| try_end(end, caps))
        }
    }
}

/// Normalises a registered pattern: ensures a leading `/` and, unless
/// strict, removes trailing slashes.
fn normalize_pattern(pattern: &str, strict: bool) -> String {
    let mut out = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("/{pattern}")
    };
    if !strict {
        while out.len() > 1 && out.ends_with('/') && !out.ends_with("\\/") {
            out.pop();
        }
    }
    out
}

/// Normalises a request path the same way the dispatcher does.
pub fn normalize_candidate(path: &str, strict: bool) -> String {
    let mut out = if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    };
    if !strict {
        while out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
    }
    out
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn tokenize(
    raw: &str,
    pattern: &str,
    options: PatternOptions,
) -> Result<Vec<Segment>, PatternError> {
    let fold = |ch: char| {
        if options.case_sensitive {
            ch
        } else {
            ch.to_ascii_lowercase()
        }
    };

    let mut segments = Vec::new();
    let mut literal = String::new();
    let chars: Vec<(usize, char)> = pattern.char_indices().collect();
    let mut i = 0;

    let flush = |literal: &mut String, segments: &mut Vec<Segment>| {
        if !literal.is_empty() {
            segments.push(Segment::Const(std::mem::take(literal)));
        }
    };

    while i < chars.len() {
        let (at, ch) = chars[i];
        match ch {
            '\\' => {
                if let Some(&(_, next)) = chars.get(i + 1) {
                    literal.push(fold(next));
                    i += 2;
                } else {
                    literal.push('\\');
                    i += 1;
                }
            }
            ':' if chars.get(i + 1).is_some_and(|&(_, c)| is_name_char(c)) => {
                flush(&mut literal, &mut segments);
                let mut j = i + 1;
                while chars.get(j).is_some_and(|&(_, c)| is_name_char(c)) {
                    j += 1;
                }
                let name_end = chars.get(j).map_or(pattern.len(), |&(p, _)| p);
                let name = pattern[at + 1..name_end].to_string();

                let mut constraints = Vec::new();
                while chars.get(j).is_some_and(|&(_, c)| c == '<') {
                    let open = chars[j].0;
                    let close = find_block_end(pattern, open)
                        .ok_or_else(|| PatternError::invalid(raw, "unterminated constraint block"))?;
                    constraints.extend(Constraint::parse_block(raw, &pattern[open + 1..close])?);
                    while chars.get(j).is_some_and(|&(p, _)| p <= close) {
                        j += 1;
                    }
                }

                let optional = chars.get(j).is_some_and(|&(_, c)| c == '?');
                if optional {
                    j += 1;
                }

                segments.push(Segment::Param {
                    name,
                    index: 0,
                    optional,
                    slash: false,
                    constraints,
                });
                i = j;
            }
            '*' => {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Wildcard {
                    name: String::new(),
                    index: 0,
                    slash: false,
                });
                i += 1;
            }
            '+' => {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Plus {
                    name: String::new(),
                    index: 0,
                });
                i += 1;
            }
            _ => {
                literal.push(fold(ch));
                i += 1;
            }
        }
    }
    flush(&mut literal, &mut segments);

    if segments.is_empty() {
        segments.push(Segment::Const("/".to_string()));
    }
    Ok(segments)
}

/// Finds the `>` closing the block opened at byte `open`, skipping
/// parenthesised arguments and escaped characters.
fn find_block_end(pattern: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut escaped = false;
    for (i, ch) in pattern[open + 1..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return Some(open + 1 + i),
            _ => {}
        }
    }
    None
}

/// Makes the `/` before an optional parameter or a wildcard optional when
/// the capture ends its path segment, so `/api/:p?` and `/api/*` also
/// match `/api`.
fn mark_optional_slashes(segments: &mut Vec<Segment>) {
    let mut i = 1;
    while i < segments.len() {
        let eligible = matches!(
            segments[i],
            Segment::Param { optional: true, .. } | Segment::Wildcard { .. }
        );
        let ends_segment = match segments.get(i + 1) {
            None => true,
            Some(Segment::Const(next)) => next.starts_with('/'),
            Some(_) => false,
        };
        let after_slash = matches!(&segments[i - 1], Segment::Const(prev) if prev.ends_with('/'));

        if eligible && ends_segment && after_slash {
            if let Segment::Const(prev) = &mut segments[i - 1] {
                prev.pop();
            }
            match &mut segments[i] {
                Segment::Param { slash, .. } | Segment::Wildcard { slash, .. } => *slash = true,
                _ => {}
            }
            if matches!(&segments[i - 1], Segment::Const(prev) if prev.is_empty()) {
                segments.remove(i - 1);
                continue;
            }
        }
        i += 1;
    }
}

fn assign_names(raw: &str, segments: &mut [Segment]) -> Result<Vec<String>, PatternError> {
    let count = segments.iter().filter(|s| s.is_capture()).count();
    if count > MAX_PARAMS {
        return Err(PatternError::TooManyParams {
            pattern: raw.to_string(),
            count,
            max: MAX_PARAMS,
        });
    }

    let wildcards = segments
        .iter()
        .filter(|s| matches!(s, Segment::Wildcard { .. }))
        .count();
    let pluses = segments
        .iter()
        .filter(|s| matches!(s, Segment::Plus { .. }))
        .count();

    let mut names: Vec<String> = Vec::new();
    let (mut w, mut p) = (0, 0);
    for segment in segments.iter_mut() {
        let slot = names.len();
        let name = match segment {
            Segment::Const(_) => continue,
            Segment::Param { name, index, .. } => {
                *index = slot;
                name.clone()
            }
            Segment::Wildcard { name, index, .. } => {
                w += 1;
                *name = if wildcards == 1 { "*".to_string() } else { format!("*{w}") };
                *index = slot;
                name.clone()
            }
            Segment::Plus { name, index } => {
                p += 1;
                *name = if pluses == 1 { "+".to_string() } else { format!("+{p}") };
                *index = slot;
                name.clone()
            }
        };
        if names.contains(&name) {
            return Err(PatternError::DuplicateParam {
                pattern: raw.to_string(),
                name,
            });
        }
        names.push(name);
    }
    Ok(names)
}
