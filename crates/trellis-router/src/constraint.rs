//! Parameter constraints (`:id<int>`, `:name<minLen(3);alpha>`).
//!
//! A constraint restricts which values a named parameter accepts. A
//! parameter may carry several constraints; all of them must hold for the
//! route to match. Constraints are checked against the original (not
//! case-folded) path text.

use std::fmt;

use chrono::format::{parse, Parsed, StrftimeItems};
use regex::Regex;

use crate::error::PatternError;

/// A single compiled parameter constraint.
#[derive(Clone)]
pub enum Constraint {
    /// Signed 64-bit integer.
    Int,
    /// Boolean in any of the accepted spellings.
    Bool,
    /// Floating point number.
    Float,
    /// Non-empty run of ASCII letters.
    Alpha,
    /// Hyphenated UUID.
    Guid,
    /// At least `n` characters.
    MinLen(usize),
    /// At most `n` characters.
    MaxLen(usize),
    /// Exactly `n` characters.
    Len(usize),
    /// Between `a` and `b` characters, inclusive.
    BetweenLen(usize, usize),
    /// Integer not below `n`.
    Min(i64),
    /// Integer not above `n`.
    Max(i64),
    /// Integer within `a..=b`.
    Range(i64, i64),
    /// Value conforms to a `strftime` layout.
    Datetime(String),
    /// Value matches the anchored regular expression.
    Regex(Regex),
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Bool => f.write_str("bool"),
            Self::Float => f.write_str("float"),
            Self::Alpha => f.write_str("alpha"),
            Self::Guid => f.write_str("guid"),
            Self::MinLen(n) => write!(f, "minLen({n})"),
            Self::MaxLen(n) => write!(f, "maxLen({n})"),
            Self::Len(n) => write!(f, "len({n})"),
            Self::BetweenLen(a, b) => write!(f, "betweenLen({a},{b})"),
            Self::Min(n) => write!(f, "min({n})"),
            Self::Max(n) => write!(f, "max({n})"),
            Self::Range(a, b) => write!(f, "range({a},{b})"),
            Self::Datetime(layout) => write!(f, "datetime({layout})"),
            Self::Regex(re) => write!(f, "regex({})", re.as_str()),
        }
    }
}

impl Constraint {
    /// Parses the body of a `<...>` block into one or more constraints.
    ///
    /// Constraints inside a single block are separated by `;`. Separators
    /// nested in parentheses belong to the argument list.
    pub(crate) fn parse_block(pattern: &str, body: &str) -> Result<Vec<Self>, PatternError> {
        split_top_level(body)
            .into_iter()
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| Self::parse_one(pattern, item))
            .collect()
    }

    fn parse_one(pattern: &str, text: &str) -> Result<Self, PatternError> {
        let (name, args) = match text.find('(') {
            Some(open) => {
                let Some(inner) = text[open + 1..].strip_suffix(')') else {
                    return Err(PatternError::constraint(pattern, text, "unbalanced parentheses"));
                };
                (&text[..open], Some(inner))
            }
            None => (text, None),
        };

        let int_args = |expected: usize| -> Result<Vec<i64>, PatternError> {
            let raw = args.unwrap_or_default();
            let parsed: Result<Vec<i64>, _> =
                raw.split(',').map(|a| a.trim().parse::<i64>()).collect();
            match parsed {
                Ok(values) if values.len() == expected => Ok(values),
                Ok(_) => Err(PatternError::constraint(
                    pattern,
                    text,
                    format!("expected {expected} argument(s)"),
                )),
                Err(_) => Err(PatternError::constraint(pattern, text, "arguments must be integers")),
            }
        };
        let len_args = |expected: usize| -> Result<Vec<usize>, PatternError> {
            int_args(expected)?
                .into_iter()
                .map(|v| {
                    usize::try_from(v).map_err(|_| {
                        PatternError::constraint(pattern, text, "lengths must not be negative")
                    })
                })
                .collect()
        };
        let no_args = |c: Self| -> Result<Self, PatternError> {
            if args.is_some() {
                Err(PatternError::constraint(pattern, text, "takes no arguments"))
            } else {
                Ok(c)
            }
        };

        match name {
            "int" => no_args(Self::Int),
            "bool" => no_args(Self::Bool),
            "float" => no_args(Self::Float),
            "alpha" => no_args(Self::Alpha),
            "guid" => no_args(Self::Guid),
            "minLen" => Ok(Self::MinLen(len_args(1)?[0])),
            "maxLen" => Ok(Self::MaxLen(len_args(1)?[0])),
            "len" => Ok(Self::Len(len_args(1)?[0])),
            "betweenLen" => {
                let v = len_args(2)?;
                if v[0] > v[1] {
                    return Err(PatternError::constraint(pattern, text, "lower bound above upper bound"));
                }
                Ok(Self::BetweenLen(v[0], v[1]))
            }
            "min" => Ok(Self::Min(int_args(1)?[0])),
            "max" => Ok(Self::Max(int_args(1)?[0])),
            "range" => {
                let v = int_args(2)?;
                if v[0] > v[1] {
                    return Err(PatternError::constraint(pattern, text, "lower bound above upper bound"));
                }
                Ok(Self::Range(v[0], v[1]))
            }
            "datetime" => match args {
                Some(layout) if !layout.is_empty() => Ok(Self::Datetime(layout.to_string())),
                _ => Err(PatternError::constraint(pattern, text, "missing layout")),
            },
            "regex" => {
                let Some(expr) = args.filter(|a| !a.is_empty()) else {
                    return Err(PatternError::constraint(pattern, text, "missing expression"));
                };
                Regex::new(&format!("^(?:{expr})$"))
                    .map(Self::Regex)
                    .map_err(|e| PatternError::constraint(pattern, text, e.to_string()))
            }
            other => Err(PatternError::constraint(
                pattern,
                text,
                format!("unknown constraint {other:?}"),
            )),
        }
    }

    /// Returns true when `value` satisfies the constraint.
    #[must_use]
    pub fn check(&self, value: &str) -> bool {
        match self {
            Self::Int => value.parse::<i64>().is_ok(),
            Self::Bool => matches!(
                value,
                "1" | "t" | "T" | "TRUE" | "true" | "True" | "0" | "f" | "F" | "FALSE" | "false"
                    | "False"
            ),
            Self::Float => value.parse::<f64>().is_ok(),
            Self::Alpha => !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphabetic()),
            Self::Guid => value.len() == 36 && uuid::Uuid::try_parse(value).is_ok(),
            Self::MinLen(n) => value.chars().count() >= *n,
            Self::MaxLen(n) => value.chars().count() <= *n,
            Self::Len(n) => value.chars().count() == *n,
            Self::BetweenLen(a, b) => (*a..=*b).contains(&value.chars().count()),
            Self::Min(n) => value.parse::<i64>().is_ok_and(|v| v >= *n),
            Self::Max(n) => value.parse::<i64>().is_ok_and(|v| v <= *n),
            Self::Range(a, b) => value.parse::<i64>().is_ok_and(|v| (*a..=*b).contains(&v)),
            Self::Datetime(layout) => {
                let mut parsed = Parsed::new();
                parse(&mut parsed, value, StrftimeItems::new(layout)).is_ok()
            }
            Self::Regex(re) => re.is_match(value),
        }
    }
}

/// Splits on `;` outside parentheses, honouring backslash escapes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut escaped = false;
    for (i, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(text: &str) -> Constraint {
        let mut list = Constraint::parse_block("/t", text).unwrap();
        assert_eq!(list.len(), 1);
        list.remove(0)
    }

    #[test]
    fn test_int_and_float() {
        assert!(one("int").check("-42"));
        assert!(!one("int").check("4.2"));
        assert!(one("float").check("4.2"));
        assert!(!one("float").check("abc"));
    }

    #[test]
    fn test_bool_spellings() {
        let c = one("bool");
        for v in ["1", "t", "TRUE", "False", "0"] {
            assert!(c.check(v), "{v}");
        }
        assert!(!c.check("yes"));
    }

    #[test]
    fn test_alpha_and_guid() {
        assert!(one("alpha").check("abcXYZ"));
        assert!(!one("alpha").check("abc1"));
        assert!(!one("alpha").check(""));
        assert!(one("guid").check("9e3f0d7c-2b6a-4f1e-8c55-0a9d3c1b2e4f"));
        assert!(!one("guid").check("9e3f0d7c2b6a4f1e8c550a9d3c1b2e4f"));
    }

    #[test]
    fn test_length_constraints() {
        assert!(one("minLen(3)").check("abc"));
        assert!(!one("minLen(3)").check("ab"));
        assert!(one("maxLen(3)").check("ab"));
        assert!(one("len(2)").check("ab"));
        assert!(one("betweenLen(2,4)").check("abcd"));
        assert!(!one("betweenLen(2,4)").check("abcde"));
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(one("min(5)").check("5"));
        assert!(!one("min(5)").check("4"));
        assert!(one("max(5)").check("-1"));
        assert!(one("range(1, 10)").check("10"));
        assert!(!one("range(1,10)").check("11"));
        assert!(!one("range(1,10)").check("x"));
    }

    #[test]
    fn test_datetime_layout() {
        let c = one("datetime(%Y-%m-%d)");
        assert!(c.check("2024-02-29"));
        assert!(!c.check("29/02/2024"));
    }

    #[test]
    fn test_regex_is_anchored() {
        let c = one(r"regex(\d{3})");
        assert!(c.check("123"));
        assert!(!c.check("1234"));
        assert!(!c.check("a123"));
    }

    #[test]
    fn test_regex_may_contain_separators() {
        let c = one(r"regex(a;b|c,d)");
        assert!(c.check("a;b"));
        assert!(c.check("c,d"));
    }

    #[test]
    fn test_block_with_several_constraints() {
        let list = Constraint::parse_block("/t", "int;min(10)").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|c| c.check("11")));
        assert!(!list.iter().all(|c| c.check("9")));
    }

    #[test]
    fn test_invalid_constraints() {
        assert!(Constraint::parse_block("/t", "nope").is_err());
        assert!(Constraint::parse_block("/t", "int(3)").is_err());
        assert!(Constraint::parse_block("/t", "min(x)").is_err());
        assert!(Constraint::parse_block("/t", "range(5,1)").is_err());
        assert!(Constraint::parse_block("/t", "regex(()").is_err());
        assert!(Constraint::parse_block("/t", "regex(").is_err());
    }
}
