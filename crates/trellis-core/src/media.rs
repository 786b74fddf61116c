//! Process-wide media-type table.
//!
//! Maps file extensions to `Content-Type` values and resolves the short
//! forms (`"json"`, `".html"`) accepted by `Ctx::is`, `Ctx::accepts` and
//! `Ctx::content_type`.

use std::path::Path;

/// Fallback type for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Returns the media type for a file extension (without the dot,
/// case-insensitive).
#[must_use]
pub fn by_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let found = match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "xml" => "application/xml",
        "txt" | "text" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "form" | "urlencoded" => "application/x-www-form-urlencoded",
        "multipart" => "multipart/form-data",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wasm" => "application/wasm",
        "webmanifest" => "application/manifest+json",
        "sse" | "event-stream" => "text/event-stream",
        _ => return None,
    };
    Some(found)
}

/// Returns the media type for `path` by extension, or
/// [`OCTET_STREAM`].
#[must_use]
pub fn for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(by_extension)
        .unwrap_or(OCTET_STREAM)
}

/// Expands a short form (`"json"`) into a full media type; full types
/// pass through unchanged.
#[must_use]
pub fn resolve(offer: &str) -> String {
    if offer.contains('/') {
        offer.to_string()
    } else {
        by_extension(offer).unwrap_or(OCTET_STREAM).to_string()
    }
}

/// The `type/subtype` essence of a header value, lower-cased.
#[must_use]
pub fn essence(value: &str) -> String {
    value
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
}

/// Whether the media range `range` (`text/*`, `*/*`, `application/json`)
/// covers `actual`.
#[must_use]
pub fn range_matches(range: &str, actual: &str) -> bool {
    let range = essence(range);
    let actual = essence(actual);
    let (Some((rt, rs)), Some((at, asub))) = (range.split_once('/'), actual.split_once('/'))
    else {
        return false;
    };
    (rt == "*" || rt == at) && (rs == "*" || rs == asub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_extension() {
        assert_eq!(by_extension("JSON"), Some("application/json"));
        assert_eq!(by_extension(".html"), Some("text/html; charset=utf-8"));
        assert_eq!(by_extension("nope"), None);
    }

    #[test]
    fn test_for_path() {
        assert_eq!(for_path(Path::new("a/b/logo.PNG")), "image/png");
        assert_eq!(for_path(Path::new("README")), OCTET_STREAM);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("json"), "application/json");
        assert_eq!(resolve("text/x-custom"), "text/x-custom");
    }

    #[test]
    fn test_essence_and_ranges() {
        assert_eq!(essence("Application/JSON; charset=utf-8"), "application/json");
        assert!(range_matches("*/*", "image/png"));
        assert!(range_matches("text/*", "text/html; charset=utf-8"));
        assert!(!range_matches("text/*", "application/json"));
        assert!(!range_matches("garbage", "text/plain"));
    }
}
