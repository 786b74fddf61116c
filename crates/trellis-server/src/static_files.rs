//! Static file serving.
//!
//! Registered through [`Registrar::static_files`](crate::Registrar::static_files),
//! which binds a [`StaticHandler`] to `GET` and `HEAD` on `{prefix}/*`.
//! Features:
//!
//! - Index file fallback (`index.html`) and optional directory listings
//! - Cache headers (`Cache-Control`, `ETag`, `Last-Modified`) with
//!   conditional `304` responses
//! - Single byte ranges
//! - Directory traversal and hidden file protection
//!
//! A miss is not an error: the handler passes the request on with
//! [`Ctx::next`], so later routes (or the `404` fallback) still apply.
//!
//! ```rust
//! use trellis_server::{App, Registrar, StaticConfig};
//!
//! let app = App::default();
//! app.static_files("/assets", "./public", StaticConfig::new().max_age(3600))
//!     .unwrap();
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use http::{header, Method, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use trellis_core::{media, BoxFuture, Ctx, Error, Handler, Result};

/// Predicate deciding whether a request skips the static handler.
pub type SkipFn = Arc<dyn Fn(&Ctx) -> bool + Send + Sync>;

/// Options for a static file route.
#[derive(Clone)]
pub struct StaticConfig {
    index: Option<String>,
    browse: bool,
    compress: bool,
    byte_range: bool,
    cache_control: Option<String>,
    etag: bool,
    last_modified: bool,
    serve_hidden: bool,
    next: Option<SkipFn>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            index: Some("index.html".to_string()),
            browse: false,
            compress: false,
            byte_range: false,
            cache_control: None,
            etag: true,
            last_modified: true,
            serve_hidden: false,
            next: None,
        }
    }
}

impl fmt::Debug for StaticConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticConfig")
            .field("index", &self.index)
            .field("browse", &self.browse)
            .field("compress", &self.compress)
            .field("byte_range", &self.byte_range)
            .field("cache_control", &self.cache_control)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("serve_hidden", &self.serve_hidden)
            .field("next", &self.next.is_some())
            .finish()
    }
}

impl StaticConfig {
    /// Default options: `index.html`, no listing, validators on.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index file served for directories. `None` disables it.
    #[must_use]
    pub fn index(mut self, index: Option<&str>) -> Self {
        self.index = index.map(str::to_string);
        self
    }

    /// Serve an HTML listing for directories without an index file.
    #[must_use]
    pub fn browse(mut self, enabled: bool) -> Self {
        self.browse = enabled;
        self
    }

    /// Accepted for compatibility; responses are never compressed.
    #[must_use]
    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Honour `Range` requests.
    #[must_use]
    pub fn byte_range(mut self, enabled: bool) -> Self {
        self.byte_range = enabled;
        self
    }

    /// Raw `Cache-Control` value.
    #[must_use]
    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    /// Sets `Cache-Control: public, max-age={seconds}`.
    #[must_use]
    pub fn max_age(self, seconds: u64) -> Self {
        self.cache_control(format!("public, max-age={seconds}"))
    }

    /// Emit weak `ETag`s.
    #[must_use]
    pub fn etag(mut self, enabled: bool) -> Self {
        self.etag = enabled;
        self
    }

    /// Emit `Last-Modified`.
    #[must_use]
    pub fn last_modified(mut self, enabled: bool) -> Self {
        self.last_modified = enabled;
        self
    }

    /// Serve dot files.
    #[must_use]
    pub fn serve_hidden(mut self, enabled: bool) -> Self {
        self.serve_hidden = enabled;
        self
    }

    /// Requests for which `skip` returns `true` bypass the handler.
    #[must_use]
    pub fn next<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Ctx) -> bool + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(skip));
        self
    }
}

enum Resolved {
    File(PathBuf, Metadata),
    Dir(PathBuf),
    Forbidden,
    Missing,
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct StaticHandler {
    root: PathBuf,
    config: StaticConfig,
}

impl StaticHandler {
    /// A handler serving `root` with `config`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: StaticConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// The served directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, requested: &str) -> Resolved {
        let relative = requested.trim_start_matches('/');
        for component in Path::new(relative).components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Resolved::Forbidden;
                }
                Component::Normal(name) => {
                    if !self.config.serve_hidden && name.to_string_lossy().starts_with('.') {
                        return Resolved::Missing;
                    }
                }
                Component::CurDir => {}
            }
        }

        let Ok(root) = tokio::fs::canonicalize(&self.root).await else {
            tracing::warn!(root = %self.root.display(), "static root does not exist");
            return Resolved::Missing;
        };
        let Ok(path) = tokio::fs::canonicalize(root.join(relative)).await else {
            return Resolved::Missing;
        };
        // Symlinks may point anywhere; the resolved target must stay inside.
        if !path.starts_with(&root) {
            return Resolved::Forbidden;
        }

        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            return Resolved::Missing;
        };
        if metadata.is_file() {
            return Resolved::File(path, metadata);
        }
        if let Some(index) = &self.config.index {
            let index_path = path.join(index);
            if let Ok(metadata) = tokio::fs::metadata(&index_path).await {
                if metadata.is_file() {
                    return Resolved::File(index_path, metadata);
                }
            }
        }
        if self.config.browse {
            Resolved::Dir(path)
        } else {
            Resolved::Missing
        }
    }

    async fn serve_file(&self, ctx: &mut Ctx, path: &Path, metadata: &Metadata) -> Result<()> {
        let size = metadata.len();
        let modified = metadata.modified().ok();

        ctx.content_type(media::for_path(path));
        if let Some(cache_control) = &self.config.cache_control {
            ctx.set(header::CACHE_CONTROL.as_str(), cache_control);
        }
        if self.config.etag {
            if let Some(etag) = modified.and_then(|m| weak_etag(size, m)) {
                ctx.set(header::ETAG.as_str(), etag);
            }
        }
        if self.config.last_modified {
            if let Some(modified) = modified {
                ctx.set(header::LAST_MODIFIED.as_str(), httpdate::fmt_http_date(modified));
            }
        }
        if self.config.byte_range {
            ctx.set(header::ACCEPT_RANGES.as_str(), "bytes");
        }

        if ctx.fresh() {
            ctx.status(StatusCode::NOT_MODIFIED);
            return Ok(());
        }

        let range = if self.config.byte_range {
            match ctx.get(header::RANGE).map(|r| parse_range(r, size)) {
                Some(Some(range)) => Some(range),
                Some(None) => {
                    ctx.set(header::CONTENT_RANGE.as_str(), format!("bytes */{size}"));
                    return ctx.send_status(StatusCode::RANGE_NOT_SATISFIABLE);
                }
                None => None,
            }
        } else {
            None
        };

        let (start, end) = range.unwrap_or((0, size.saturating_sub(1)));
        let length = if size == 0 { 0 } else { end - start + 1 };
        if let Some((start, end)) = range {
            ctx.status(StatusCode::PARTIAL_CONTENT);
            ctx.set(header::CONTENT_RANGE.as_str(), format!("bytes {start}-{end}/{size}"));
        }

        if *ctx.method() == Method::HEAD {
            ctx.set(header::CONTENT_LENGTH.as_str(), length.to_string());
            return Ok(());
        }

        let data = read_range(path, start, length).await?;
        ctx.send(data)
    }

    async fn serve_listing(&self, ctx: &mut Ctx, dir: &Path) -> Result<()> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.config.serve_hidden && name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        let base = ctx.path().trim_end_matches('/').to_string();
        let mut html = format!("<html><head><title>{base}/</title></head><body><ul>");
        for entry in entries {
            let _ = write!(html, r#"<li><a href="{base}/{entry}">{entry}</a></li>"#);
        }
        html.push_str("</ul></body></html>");

        ctx.content_type("text/html; charset=utf-8");
        ctx.send_string(html)
    }
}

impl Handler for StaticHandler {
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.config.next.as_ref().is_some_and(|skip| skip(ctx)) {
                return ctx.next().await;
            }

            let unescaped = ctx.app().is_some_and(|s| s.settings.unescape_path);
            let requested = if unescaped {
                ctx.param("*").to_string()
            } else {
                percent_decode_str(ctx.param("*"))
                    .decode_utf8_lossy()
                    .into_owned()
            };

            match self.resolve(&requested).await {
                Resolved::File(path, metadata) => self.serve_file(ctx, &path, &metadata).await,
                Resolved::Dir(dir) => self.serve_listing(ctx, &dir).await,
                Resolved::Forbidden => {
                    tracing::debug!(path = %requested, "static path escapes root");
                    Err(Error::status(StatusCode::FORBIDDEN))
                }
                Resolved::Missing => {
                    ctx.reset_response();
                    ctx.next().await
                }
            }
        })
    }
}

fn weak_etag(size: u64, modified: SystemTime) -> Option<String> {
    let mtime = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    Some(format!("W/\"{size:x}-{:x}\"", mtime.as_secs()))
}

/// Parses a single `bytes=` range against `size`. Returns inclusive
/// bounds, or `None` when the range cannot be satisfied.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') || size == 0 {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = if start.is_empty() {
        let suffix: u64 = end.trim().parse().ok()?;
        if suffix == 0 {
            return None;
        }
        (size.saturating_sub(suffix), size - 1)
    } else {
        let start: u64 = start.trim().parse().ok()?;
        let end = if end.trim().is_empty() {
            size - 1
        } else {
            end.trim().parse::<u64>().ok()?.min(size - 1)
        };
        (start, end)
    };
    (start <= end && start < size).then_some((start, end))
}

async fn read_range(path: &Path, start: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let capacity = usize::try_from(length).map_err(|e| Error::internal_with_source("file too large", e))?;
    let mut data = Vec::with_capacity(capacity);
    file.take(length).read_to_end(&mut data).await?;
    Ok(data)
}
