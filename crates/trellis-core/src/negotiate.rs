//! `Accept*` header negotiation.

use crate::media;

/// One entry of a quality-weighted header.
#[derive(Debug, Clone, PartialEq)]
pub struct Weighted {
    /// The value without parameters.
    pub value: String,
    /// The `q` weight, 1.0 when absent.
    pub quality: f32,
}

/// Parses a header such as `text/html, application/json;q=0.8` into
/// entries ordered by descending quality. Ties keep header order;
/// `q=0` entries are dropped.
#[must_use]
pub fn parse(header: &str) -> Vec<Weighted> {
    let mut out: Vec<Weighted> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let value = pieces.next()?.trim();
            if value.is_empty() {
                return None;
            }
            let quality = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then(|| Weighted {
                value: value.to_string(),
                quality,
            })
        })
        .collect();
    out.sort_by(|a, b| b.quality.total_cmp(&a.quality));
    out
}

fn negotiate<'o>(
    header: &str,
    offers: &[&'o str],
    matches: impl Fn(&str, &str) -> bool,
) -> Option<&'o str> {
    let first = offers.first().copied()?;
    if header.trim().is_empty() {
        return Some(first);
    }
    parse(header).iter().find_map(|pref| {
        offers
            .iter()
            .copied()
            .find(|offer| matches(&pref.value, offer))
    })
}

/// Best media type among `offers` (full types or extensions) for an
/// `Accept` header.
#[must_use]
pub fn accepts<'o>(header: &str, offers: &[&'o str]) -> Option<&'o str> {
    negotiate(header, offers, |pref, offer| {
        media::range_matches(pref, &media::resolve(offer))
    })
}

/// Best token (charset or encoding) among `offers`.
#[must_use]
pub fn accepts_token<'o>(header: &str, offers: &[&'o str]) -> Option<&'o str> {
    negotiate(header, offers, |pref, offer| {
        pref == "*" || pref.eq_ignore_ascii_case(offer)
    })
}

/// Best language among `offers`; `en` accepts `en-US`.
#[must_use]
pub fn accepts_language<'o>(header: &str, offers: &[&'o str]) -> Option<&'o str> {
    negotiate(header, offers, |pref, offer| {
        if pref == "*" || pref.eq_ignore_ascii_case(offer) {
            return true;
        }
        offer.len() > pref.len()
            && offer.as_bytes()[pref.len()] == b'-'
            && offer[..pref.len()].eq_ignore_ascii_case(pref)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_quality() {
        let parsed = parse("text/plain;q=0.5, text/html, application/json;q=0.9, x/y;q=0");
        let values: Vec<_> = parsed.iter().map(|w| w.value.as_str()).collect();
        assert_eq!(values, ["text/html", "application/json", "text/plain"]);
    }

    #[test]
    fn test_accepts_media() {
        let header = "text/html;q=0.9, application/json";
        assert_eq!(accepts(header, &["html", "json"]), Some("json"));
        assert_eq!(accepts("image/*", &["json", "png"]), Some("png"));
        assert_eq!(accepts("text/csv", &["json"]), None);
        assert_eq!(accepts("", &["xml", "json"]), Some("xml"));
        assert_eq!(accepts("*/*", &[]), None);
    }

    #[test]
    fn test_accepts_token() {
        assert_eq!(accepts_token("gzip, br;q=0.5", &["br", "gzip"]), Some("gzip"));
        assert_eq!(accepts_token("UTF-8", &["utf-8"]), Some("utf-8"));
        assert_eq!(accepts_token("*", &["deflate"]), Some("deflate"));
    }

    #[test]
    fn test_accepts_language() {
        assert_eq!(accepts_language("en;q=0.8, fr", &["en-US", "fr-CA"]), Some("fr-CA"));
        assert_eq!(accepts_language("de", &["en"]), None);
        assert_eq!(accepts_language("en", &["english"]), None);
    }
}
