//! The pooled request context.
//!
//! A [`Ctx`] carries one request through the handler chain: the request
//! head and buffered body, the matched route and its parameter slots,
//! per-request locals, the shutdown signal and the response being built.
//! Contexts are recycled through a pool, so nothing may keep a reference
//! to one after its handler returns.
//!
//! # Chain progression
//!
//! ```text
//!   stack[GET] = [USE /, USE /api, GET /api/:id, GET /api/*]
//!                   │       │          │
//!   next() ─────────┘       │          │
//!     └─ next() ────────────┘          │
//!          └─ next() ──────────────────┘  (terminal; no further next())
//! ```
//!
//! [`Ctx::next`] first advances through the handlers of the current route,
//! then resumes the walk of the method stack at the cursor left by the
//! previous match.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use trellis_router::{normalize_candidate, normalize_host, Candidates, MethodKind, ParamValues, Params};

use crate::body::{Body, ResponseBody};
use crate::conn::{ConnectionHandle, ConnectionKind};
use crate::cookie::{Cookies, SetCookie};
use crate::error::{Error, Result};
use crate::handler::{default_error_handler, BoxFuture, BoxedHandler};
use crate::media;
use crate::multipart::{FileHeader, MultipartConfig, MultipartForm};
use crate::negotiate;
use crate::route::Route;
use crate::signal::{Done, RequestSignal};
use crate::sse::{SseBody, SseSender, DEFAULT_BUFFER};
use crate::state::AppState;

/// Response under construction.
#[derive(Debug, Default)]
struct ResponseParts {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

/// Per-request state handed to every handler.
pub struct Ctx {
    state: Option<Arc<AppState>>,

    method: Method,
    method_kind: Option<MethodKind>,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    request_extensions: Extensions,
    body: Bytes,
    form: Option<MultipartForm>,

    // Routing: `path` is the folded detection path, `original_path` the
    // same path before case folding. Both have the same byte length.
    path: String,
    original_path: String,
    host: String,
    values: ParamValues,
    domain_params: Params,
    route: Option<Arc<Route>>,
    handler_index: usize,
    stack_method: Option<MethodKind>,
    cursor: usize,
    candidates: Candidates,
    indexed: bool,
    domain_hits: SmallVec<[bool; 4]>,

    locals: HashMap<String, Box<dyn Any + Send + Sync>>,
    extensions: Extensions,
    signal: RequestSignal,
    conn: Option<Arc<dyn ConnectionHandle>>,
    remote_addr: Option<SocketAddr>,

    response: ResponseParts,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl Ctx {
    /// An idle context, not bound to any request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: None,
            method: Method::GET,
            method_kind: Some(MethodKind::Get),
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            request_extensions: Extensions::new(),
            body: Bytes::new(),
            form: None,
            path: "/".to_string(),
            original_path: "/".to_string(),
            host: String::new(),
            values: ParamValues::new(),
            domain_params: Params::new(),
            route: None,
            handler_index: 0,
            stack_method: None,
            cursor: 0,
            candidates: Candidates::new(),
            indexed: false,
            domain_hits: SmallVec::new(),
            locals: HashMap::new(),
            extensions: Extensions::new(),
            signal: RequestSignal::default(),
            conn: None,
            remote_addr: None,
            response: ResponseParts::default(),
        }
    }

    /// Binds the context to a new request.
    ///
    /// Caches the canonical path and method, clears the parameter slots
    /// and pre-computes which domain patterns match the request host.
    pub fn reset(
        &mut self,
        state: Arc<AppState>,
        request: Request<Bytes>,
        conn: Option<Arc<dyn ConnectionHandle>>,
        remote_addr: Option<SocketAddr>,
    ) {
        let (parts, body) = request.into_parts();
        self.method = parts.method;
        self.method_kind = MethodKind::from_method(&self.method);
        self.uri = parts.uri;
        self.version = parts.version;
        self.headers = parts.headers;
        self.request_extensions = parts.extensions;
        self.body = body;
        self.form = None;

        let settings = &state.settings;
        let raw = self.uri.path();
        let unescaped = if settings.unescape_path {
            percent_decode_str(raw).decode_utf8_lossy().into_owned()
        } else {
            raw.to_string()
        };
        self.original_path = normalize_candidate(&unescaped, settings.strict_routing);
        self.path = if settings.case_sensitive {
            self.original_path.clone()
        } else {
            self.original_path.to_ascii_lowercase()
        };

        self.values.clear();
        self.domain_params.clear();
        self.route = None;
        self.handler_index = 0;
        self.cursor = 0;
        self.candidates.clear();

        let router = &state.router;
        self.domain_hits.clear();
        self.host.clear();
        if router.has_domains() {
            self.host = normalize_host(self.raw_host().unwrap_or_default());
            let host = &self.host;
            self.domain_hits
                .extend(router.domains().iter().map(|d| d.matches(host)));
        }

        self.stack_method = self.method_kind.map(|kind| {
            router.resolve(
                kind,
                &self.domain_hits,
                &self.path,
                &self.original_path,
                &mut self.values,
            )
        });
        self.indexed = self
            .stack_method
            .is_some_and(|kind| router.lookup(kind, &self.path, &mut self.candidates));

        self.signal.bind(state.notice.clone());
        self.conn = conn;
        self.remote_addr = remote_addr;
        self.reset_response();
        self.state = Some(state);
    }

    /// Drops everything request-specific so the context can be pooled.
    /// Extensions installed by the context factory survive.
    pub fn release(&mut self) {
        self.state = None;
        self.headers.clear();
        self.request_extensions.clear();
        self.body = Bytes::new();
        self.form = None;
        self.values.clear();
        self.domain_params.clear();
        self.route = None;
        self.stack_method = None;
        self.candidates.clear();
        self.domain_hits.clear();
        self.locals.clear();
        self.signal.clear();
        self.conn = None;
        self.remote_addr = None;
        self.reset_response();
    }

    // ----------------------------------------------------------------
    // Chain
    // ----------------------------------------------------------------

    /// Runs the next handler: the next one bound to the current route, or
    /// the first handler of the next matching route in the stack.
    ///
    /// Returns a `404` error once the stack is exhausted.
    pub fn next(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(handler) = self.next_in_route() {
                return handler.call(self).await;
            }
            loop {
                let Some(route) = self.advance()? else {
                    return Err(Error::not_found(format!(
                        "Cannot {} {}",
                        self.method,
                        self.uri.path()
                    )));
                };
                if let Some(handler) = route.handlers().first().cloned() {
                    self.route = Some(route);
                    self.handler_index = 0;
                    return handler.call(self).await;
                }
            }
        })
    }

    /// Hands `err` to the error handler of the sub-application that best
    /// matches the request path.
    pub fn next_with_error(&mut self, err: Error) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handler = self
                .state
                .as_ref()
                .map_or_else(default_error_handler, |s| {
                    s.error_handler_for(&self.original_path)
                });
            handler(self, err).await
        })
    }

    fn next_in_route(&mut self) -> Option<BoxedHandler> {
        let route = self.route.as_ref()?;
        let index = self.handler_index + 1;
        let handler = route.handlers().get(index).cloned()?;
        self.handler_index = index;
        Some(handler)
    }

    fn advance(&mut self) -> Result<Option<Arc<Route>>> {
        let Some(state) = self.state.clone() else {
            return Ok(None);
        };
        let Some(kind) = self.stack_method else {
            return Err(Error::status(StatusCode::NOT_IMPLEMENTED));
        };
        let router = &state.router;
        let stack = router.stack(kind);

        loop {
            let index = if self.indexed {
                match self.candidates.get(self.cursor) {
                    Some(&i) => i as usize,
                    None => return Ok(None),
                }
            } else if self.cursor < stack.len() {
                self.cursor
            } else {
                return Ok(None);
            };
            self.cursor += 1;

            let Some(entry) = stack.get(index) else {
                continue;
            };
            if let Some(d) = entry.domain {
                if !self.domain_hits.get(d).copied().unwrap_or(false) {
                    continue;
                }
            }
            if !entry.matches(&self.path, &self.original_path, &mut self.values) {
                continue;
            }

            self.domain_params.clear();
            if let Some(pattern) = entry.domain.and_then(|d| router.domains().get(d)) {
                pattern.capture(&self.host, &mut self.domain_params);
            }
            return Ok(Some(Arc::clone(&entry.route)));
        }
    }

    // ----------------------------------------------------------------
    // Application
    // ----------------------------------------------------------------

    /// The application state this request runs against.
    #[must_use]
    pub fn app(&self) -> Option<&Arc<AppState>> {
        self.state.as_ref()
    }

    /// The route currently executing.
    #[must_use]
    pub fn route(&self) -> Option<&Route> {
        self.route.as_deref()
    }

    /// Value of route parameter `name`, or `""`.
    #[must_use]
    pub fn param(&self, name: &str) -> &str {
        self.route
            .as_ref()
            .and_then(|r| r.compiled().param_index(name))
            .map_or("", |i| self.values.get(i))
    }

    /// Value of route parameter `name`, or `default` when absent or empty.
    #[must_use]
    pub fn param_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.param(name) {
            "" => default,
            value => value,
        }
    }

    /// Parses route parameter `name`.
    pub fn param_as<T: FromStr>(&self, name: &str) -> Result<T> {
        self.param(name)
            .parse()
            .map_err(|_| Error::bad_request(format!("invalid value for parameter '{name}'")))
    }

    /// All positional parameter values of the current route.
    #[must_use]
    pub fn params(&self) -> &[String] {
        self.values.as_slice()
    }

    /// Value captured by the domain pattern, or `""`.
    #[must_use]
    pub fn domain_param(&self, name: &str) -> &str {
        self.domain_params.get(name).unwrap_or_default()
    }

    /// Value captured by the domain pattern, or `default`.
    #[must_use]
    pub fn domain_param_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.domain_param(name) {
            "" => default,
            value => value,
        }
    }

    // ----------------------------------------------------------------
    // Locals and extensions
    // ----------------------------------------------------------------

    /// Stores a request-scoped value for downstream handlers.
    pub fn set_local<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.locals.insert(key.into(), Box::new(value));
    }

    /// Reads a request-scoped value of type `T`.
    #[must_use]
    pub fn local<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.locals.get(key).and_then(|v| v.downcast_ref())
    }

    /// Removes a request-scoped value. A value of another type is left in
    /// place.
    pub fn remove_local<T: Any + Send + Sync>(&mut self, key: &str) -> Option<T> {
        if !self.locals.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.locals
            .remove(key)
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }

    /// Context-level extension installed by the context factory.
    #[must_use]
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get()
    }

    /// Installs a context-level extension. Extensions survive pooling.
    #[must_use]
    pub fn with_extension<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Mutable access to the context-level extensions.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Extensions the transport attached to the request.
    pub fn request_extensions_mut(&mut self) -> &mut Extensions {
        &mut self.request_extensions
    }

    // ----------------------------------------------------------------
    // Shutdown signal
    // ----------------------------------------------------------------

    /// Completes when the application begins shutting down or the request
    /// is cancelled. Every call on one request observes the same channel.
    pub fn done(&mut self) -> Done {
        self.signal.done()
    }

    /// `None` while the request may proceed; [`Error::RequestShutdown`]
    /// once it is done.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        self.signal.err()
    }

    /// The deadline propagated by the shutdown call, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.signal.deadline()
    }

    /// Whether the application is shutting down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.signal.is_shutting_down()
    }

    /// Cancels this request without affecting others.
    pub fn cancel(&mut self) {
        self.signal.cancel();
    }

    // ----------------------------------------------------------------
    // Connection
    // ----------------------------------------------------------------

    /// The connection the request arrived on.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn ConnectionHandle>> {
        self.conn.as_ref()
    }

    /// Peer address reported by the transport.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Tags the connection as an upgraded WebSocket.
    pub fn mark_websocket(&self) {
        if let Some(conn) = &self.conn {
            conn.set_kind(ConnectionKind::WebSocket);
        }
    }

    /// Tags the connection as an SSE stream.
    pub fn mark_sse(&self) {
        if let Some(conn) = &self.conn {
            conn.set_kind(ConnectionKind::Sse);
        }
    }

    /// Registers the closure run at shutdown instead of the default
    /// WebSocket close frame.
    pub fn on_connection_close<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if let Some(conn) = &self.conn {
            conn.set_cleanup(Arc::new(move || -> BoxFuture<'static, Result<()>> {
                Box::pin(f())
            }));
        }
    }

    /// Takes the pending protocol upgrade, if the transport offered one.
    pub fn take_upgrade(&mut self) -> Option<hyper::upgrade::OnUpgrade> {
        self.request_extensions.remove()
    }

    // ----------------------------------------------------------------
    // Request
    // ----------------------------------------------------------------

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path as sent by the client.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Request path and query.
    #[must_use]
    pub fn original_url(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// The full request URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// HTTP version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Decoded query parameters in order.
    #[must_use]
    pub fn queries(&self) -> Vec<(String, String)> {
        self.uri
            .query()
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default()
    }

    /// First value of query parameter `key`.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<String> {
        self.queries().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Deserializes the query string into `T`.
    pub fn query_parser<T: DeserializeOwned>(&self) -> Result<T> {
        serde_urlencoded::from_str(self.uri.query().unwrap_or_default())
            .map_err(|e| Error::bad_request(format!("invalid query string: {e}")))
    }

    /// Request header `name`, when present and valid UTF-8.
    #[must_use]
    pub fn get(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Every cookie sent with the request.
    #[must_use]
    pub fn cookies(&self) -> Cookies {
        let joined = self
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");
        Cookies::parse(&joined)
    }

    /// Value of cookie `name`.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().get(name).map(str::to_string)
    }

    /// The buffered request body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes a JSON request body.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::bad_request(format!("invalid JSON body: {e}")))
    }

    fn trusted(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.settings.trusts(self.remote_addr.map(|a| a.ip())))
    }

    fn raw_host(&self) -> Option<&str> {
        self.get(header::HOST).or_else(|| self.uri.authority().map(|a| a.as_str()))
    }

    /// Host as sent by the client, port included. `X-Forwarded-Host` wins
    /// when the peer is trusted.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        if self.trusted() {
            if let Some(forwarded) = self.get("x-forwarded-host") {
                return forwarded.split(',').next().map(str::trim);
            }
        }
        self.raw_host()
    }

    /// Host without port or trailing dot, lower-cased.
    #[must_use]
    pub fn hostname(&self) -> String {
        normalize_host(self.host().unwrap_or_default())
    }

    /// Client address: the configured proxy header when trusted, otherwise
    /// the peer address.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        let proxied = self
            .state
            .as_ref()
            .and_then(|s| s.settings.proxy_header.as_deref())
            .filter(|_| self.trusted())
            .and_then(|name| self.get(name))
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        proxied.or_else(|| self.remote_addr.map(|a| a.ip()))
    }

    /// Addresses listed in `X-Forwarded-For`, client first.
    #[must_use]
    pub fn ips(&self) -> Vec<String> {
        self.get("x-forwarded-for")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `"https"` or `"http"`.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        let forwarded = self
            .get("x-forwarded-proto")
            .filter(|_| self.trusted())
            .is_some_and(|p| p.eq_ignore_ascii_case("https"));
        if forwarded || self.uri.scheme_str() == Some("https") {
            "https"
        } else {
            "http"
        }
    }

    /// Whether the request arrived over TLS.
    #[must_use]
    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// Host labels left of the last `offset` labels, most specific last.
    /// With `offset = 2`, `tobi.ferrets.example.com` yields
    /// `["tobi", "ferrets"]`.
    #[must_use]
    pub fn subdomains(&self, offset: usize) -> Vec<String> {
        let host = self.hostname();
        if host.parse::<IpAddr>().is_ok() {
            return Vec::new();
        }
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        let keep = labels.len().saturating_sub(offset);
        labels[..keep].iter().map(|l| (*l).to_string()).collect()
    }

    /// Whether the request `Content-Type` matches `ext` (`"json"`,
    /// `"text/html"`).
    #[must_use]
    pub fn is(&self, ext: &str) -> bool {
        self.get(header::CONTENT_TYPE).is_some_and(|ct| {
            media::essence(ct) == media::essence(&media::resolve(ext.trim_start_matches('.')))
        })
    }

    /// Best offer for the `Accept` header.
    #[must_use]
    pub fn accepts<'o>(&self, offers: &[&'o str]) -> Option<&'o str> {
        negotiate::accepts(self.get(header::ACCEPT).unwrap_or_default(), offers)
    }

    /// Best offer for `Accept-Charset`.
    #[must_use]
    pub fn accepts_charsets<'o>(&self, offers: &[&'o str]) -> Option<&'o str> {
        negotiate::accepts_token(self.get(header::ACCEPT_CHARSET).unwrap_or_default(), offers)
    }

    /// Best offer for `Accept-Encoding`.
    #[must_use]
    pub fn accepts_encodings<'o>(&self, offers: &[&'o str]) -> Option<&'o str> {
        negotiate::accepts_token(self.get(header::ACCEPT_ENCODING).unwrap_or_default(), offers)
    }

    /// Best offer for `Accept-Language`.
    #[must_use]
    pub fn accepts_languages<'o>(&self, offers: &[&'o str]) -> Option<&'o str> {
        negotiate::accepts_language(self.get(header::ACCEPT_LANGUAGE).unwrap_or_default(), offers)
    }

    /// Whether the client's cached copy is still valid given the response
    /// headers set so far (`ETag`, `Last-Modified`).
    #[must_use]
    pub fn fresh(&self) -> bool {
        if !matches!(self.method, Method::GET | Method::HEAD) {
            return false;
        }
        let status = self.response.status;
        if !(status.is_success() || status == StatusCode::NOT_MODIFIED) {
            return false;
        }
        let none_match = self.get(header::IF_NONE_MATCH);
        let modified_since = self.get(header::IF_MODIFIED_SINCE);
        if none_match.is_none() && modified_since.is_none() {
            return false;
        }
        if self
            .get(header::CACHE_CONTROL)
            .is_some_and(|cc| cc.contains("no-cache"))
        {
            return false;
        }

        if let Some(none_match) = none_match.filter(|v| v.trim() != "*") {
            let Some(etag) = self.response_header(header::ETAG) else {
                return false;
            };
            if !etag_matches(none_match, etag) {
                return false;
            }
        }

        if let Some(since) = modified_since {
            let Some(last) = self.response_header(header::LAST_MODIFIED) else {
                return false;
            };
            match (httpdate::parse_http_date(last), httpdate::parse_http_date(since)) {
                (Ok(last), Ok(since)) if last <= since => {}
                _ => return false,
            }
        }
        true
    }

    /// Opposite of [`Ctx::fresh`].
    #[must_use]
    pub fn stale(&self) -> bool {
        !self.fresh()
    }

    /// Whether the request was issued by `XMLHttpRequest`.
    #[must_use]
    pub fn xhr(&self) -> bool {
        self.get("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
    }

    /// First value of form field `key`, from a URL-encoded body or an
    /// already parsed multipart form.
    #[must_use]
    pub fn form_value(&self, key: &str) -> Option<String> {
        if self.is("application/x-www-form-urlencoded") {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(&self.body).unwrap_or_default();
            return pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v);
        }
        self.form
            .as_ref()
            .and_then(|f| f.value(key))
            .map(str::to_string)
    }

    /// Parses the multipart body once and returns the form.
    pub async fn multipart(&mut self) -> Result<&MultipartForm> {
        if self.form.is_none() {
            let config = self
                .state
                .as_ref()
                .map_or_else(MultipartConfig::default, |s| s.settings.multipart);
            let form = MultipartForm::parse(&self.headers, self.body.clone(), config).await?;
            self.form = Some(form);
        }
        self.form
            .as_ref()
            .ok_or_else(|| Error::internal("multipart form unavailable"))
    }

    /// First file uploaded under `name`.
    pub async fn form_file(&mut self, name: &str) -> Result<FileHeader> {
        self.multipart()
            .await?
            .file(name)
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("missing file field '{name}'")))
    }

    // ----------------------------------------------------------------
    // Response
    // ----------------------------------------------------------------

    /// Sets the response status.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.response.status = status;
        self
    }

    /// Current response status.
    #[must_use]
    pub fn response_status(&self) -> StatusCode {
        self.response.status
    }

    /// Response headers set so far.
    #[must_use]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    /// Response header `name`, when present and valid UTF-8.
    #[must_use]
    pub fn response_header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.response.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Buffered response body, `None` when empty or streaming.
    #[must_use]
    pub fn response_body_bytes(&self) -> Option<Bytes> {
        self.response.body.as_bytes().cloned()
    }

    fn header_pair(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        if parsed.is_none() {
            tracing::debug!(header = %name, "ignoring invalid response header");
        }
        parsed
    }

    /// Sets response header `name`, replacing earlier values. Invalid names
    /// or values are ignored.
    pub fn set(&mut self, name: &str, value: impl AsRef<str>) -> &mut Self {
        if let Some((name, value)) = Self::header_pair(name, value.as_ref()) {
            self.response.headers.insert(name, value);
        }
        self
    }

    /// Appends a value to response header `name`.
    pub fn append(&mut self, name: &str, value: impl AsRef<str>) -> &mut Self {
        if let Some((name, value)) = Self::header_pair(name, value.as_ref()) {
            self.response.headers.append(name, value);
        }
        self
    }

    /// Sets `Content-Type`; short forms such as `"json"` are expanded.
    pub fn content_type(&mut self, value: &str) -> &mut Self {
        let resolved = media::resolve(value.trim_start_matches('.'));
        self.set(header::CONTENT_TYPE.as_str(), resolved)
    }

    fn default_content_type(&mut self, value: &'static str) {
        if !self.response.headers.contains_key(header::CONTENT_TYPE) {
            self.response
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
        }
    }

    /// Adds a `Set-Cookie` header.
    pub fn set_cookie(&mut self, cookie: &SetCookie) -> &mut Self {
        self.append(header::SET_COOKIE.as_str(), cookie.to_header_value())
    }

    /// Expires the named cookies, or every request cookie when `names` is
    /// empty.
    pub fn clear_cookie(&mut self, names: &[&str]) -> &mut Self {
        let names: Vec<String> = if names.is_empty() {
            self.cookies().iter().map(|(name, _)| name.to_string()).collect()
        } else {
            names.iter().map(|n| (*n).to_string()).collect()
        };
        for name in names {
            self.set_cookie(&SetCookie::expired(name));
        }
        self
    }

    /// Sets `Location`.
    pub fn location(&mut self, url: &str) -> &mut Self {
        self.set(header::LOCATION.as_str(), url)
    }

    /// Adds fields to `Vary`, skipping ones already listed.
    pub fn vary(&mut self, fields: &[&str]) -> &mut Self {
        let mut current: Vec<String> = self
            .response_header(header::VARY)
            .map(|v| v.split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect())
            .unwrap_or_default();
        for field in fields {
            if !current.iter().any(|f| f.eq_ignore_ascii_case(field)) {
                current.push((*field).to_string());
            }
        }
        self.set(header::VARY.as_str(), current.join(", "))
    }

    /// Adds `Link` entries as `(url, rel)` pairs.
    pub fn links(&mut self, links: &[(&str, &str)]) -> &mut Self {
        let mut value = self.response_header(header::LINK).unwrap_or_default().to_string();
        for (url, rel) in links {
            if !value.is_empty() {
                value.push_str(", ");
            }
            value.push_str(&format!("<{url}>; rel=\"{rel}\""));
        }
        self.set(header::LINK.as_str(), value)
    }

    /// Marks the response as an attachment, optionally named.
    pub fn attachment(&mut self, filename: Option<&str>) -> &mut Self {
        match filename {
            Some(name) => {
                let base = Path::new(name)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(name)
                    .replace('"', "\\\"");
                let ct = media::for_path(Path::new(name));
                self.set(header::CONTENT_TYPE.as_str(), ct);
                self.set(
                    header::CONTENT_DISPOSITION.as_str(),
                    format!("attachment; filename=\"{base}\""),
                )
            }
            None => self.set(header::CONTENT_DISPOSITION.as_str(), "attachment"),
        }
    }

    /// Sets a raw body.
    pub fn send(&mut self, body: impl Into<Bytes>) -> Result<()> {
        self.response.body = ResponseBody::Bytes(body.into());
        Ok(())
    }

    /// Sets a text body, defaulting the content type to plain text.
    pub fn send_string(&mut self, body: impl Into<String>) -> Result<()> {
        self.default_content_type("text/plain; charset=utf-8");
        self.send(body.into())
    }

    /// Sets the status and, if nothing was written yet, its reason phrase
    /// as the body.
    pub fn send_status(&mut self, status: StatusCode) -> Result<()> {
        self.status(status);
        if self.response.body.is_empty() {
            return self.send_string(status.canonical_reason().unwrap_or_default());
        }
        Ok(())
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.set(header::CONTENT_TYPE.as_str(), "application/json");
        self.send(body)
    }

    /// JSON wrapped in a callback call; `callback` defaults to
    /// `"callback"`.
    pub fn jsonp<T: Serialize + ?Sized>(&mut self, value: &T, callback: Option<&str>) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let callback = callback.unwrap_or("callback");
        self.set(header::CONTENT_TYPE.as_str(), "text/javascript; charset=utf-8");
        self.send(format!("{callback}({json});"))
    }

    /// Sends pre-serialized XML.
    pub fn xml(&mut self, xml: impl Into<String>) -> Result<()> {
        self.set(header::CONTENT_TYPE.as_str(), "application/xml");
        self.send(xml.into())
    }

    /// Streams `body` as the response.
    pub fn send_stream(&mut self, body: Body) -> Result<()> {
        self.response.body = ResponseBody::Stream(body);
        Ok(())
    }

    /// Starts a Server-Sent Events response and tags the connection so
    /// shutdown can close it with an event.
    pub fn sse(&mut self) -> SseSender {
        let (sender, body) = SseBody::channel(DEFAULT_BUFFER);
        self.set(header::CONTENT_TYPE.as_str(), "text/event-stream");
        self.set(header::CACHE_CONTROL.as_str(), "no-cache");
        self.response.body = ResponseBody::Stream(body.boxed());
        if let Some(conn) = &self.conn {
            conn.set_kind(ConnectionKind::Sse);
            conn.set_sse_sink(sender.sink());
        }
        sender
    }

    /// Redirects with `302 Found`.
    pub fn redirect(&mut self, location: &str) -> Result<()> {
        self.redirect_with_status(location, StatusCode::FOUND)
    }

    /// Redirects with an explicit status.
    pub fn redirect_with_status(&mut self, location: &str, status: StatusCode) -> Result<()> {
        if !status.is_redirection() {
            return Err(Error::internal(format!("{status} is not a redirect status")));
        }
        self.location(location);
        self.status(status);
        Ok(())
    }

    /// Renders template `name` with the view engine of the best matching
    /// sub-application.
    pub fn render<T: Serialize + ?Sized>(
        &mut self,
        name: &str,
        data: &T,
        layout: Option<&str>,
    ) -> Result<()> {
        let state = self
            .state
            .clone()
            .ok_or_else(|| Error::internal("render called outside a request"))?;
        let views = state
            .views_for(&self.original_path)
            .ok_or_else(|| Error::internal("no view engine configured"))?;
        let data = serde_json::to_value(data)?;
        let mut out = Vec::new();
        views.render(&mut out, name, &data, layout)?;
        self.default_content_type("text/html; charset=utf-8");
        self.send(out)
    }

    /// Sends the file at `path` with a content type guessed from its
    /// extension.
    pub async fn send_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::status(StatusCode::NOT_FOUND));
            }
            Err(e) => return Err(e.into()),
        };
        if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            self.set(header::LAST_MODIFIED.as_str(), httpdate::fmt_http_date(modified));
        }
        self.default_content_type(media::for_path(path));
        self.send(data)
    }

    /// Sends the file at `path` as an attachment.
    pub async fn download(&mut self, path: impl AsRef<Path>, filename: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        let name = filename
            .map(str::to_string)
            .or_else(|| path.file_name().and_then(|n| n.to_str()).map(str::to_string));
        self.attachment(name.as_deref());
        self.send_file(path).await
    }

    /// Discards the response written so far.
    pub fn reset_response(&mut self) {
        self.response.status = StatusCode::OK;
        self.response.headers.clear();
        self.response.body = ResponseBody::Empty;
    }

    /// Moves the response out, leaving an empty `200` behind.
    pub fn take_response(&mut self) -> Response<Body> {
        let parts = std::mem::take(&mut self.response);
        let mut response = Response::new(parts.body.into_body());
        *response.status_mut() = parts.status;
        *response.headers_mut() = parts.headers;
        response
    }
}

fn etag_matches(none_match: &str, etag: &str) -> bool {
    let weak = |t: &str| t.trim().trim_start_matches("W/").to_string();
    let etag = weak(etag);
    none_match.split(',').any(|t| weak(t) == etag)
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("route", &self.route.as_ref().map(|r| r.path()))
            .field("handler_index", &self.handler_index)
            .field("status", &self.response.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{error_handler, handler};
    use crate::signal::{notice_channel, ShutdownNotice};
    use crate::state::Settings;
    use std::time::Duration;
    use trellis_router::{DomainPattern, RouterBuilder, Slot};

    struct Reg {
        slot: Slot,
        path: &'static str,
        domain: Option<&'static str>,
        handlers: Vec<BoxedHandler>,
    }

    fn get(path: &'static str, h: BoxedHandler) -> Reg {
        Reg {
            slot: MethodKind::Get.into(),
            path,
            domain: None,
            handlers: vec![h],
        }
    }

    fn mw(path: &'static str, h: BoxedHandler) -> Reg {
        Reg {
            slot: Slot::Use,
            path,
            domain: None,
            handlers: vec![h],
        }
    }

    fn app(regs: Vec<Reg>, settings: Settings) -> Arc<AppState> {
        let mut builder = RouterBuilder::new();
        for reg in regs {
            let route = Route::new(reg.slot, reg.path, reg.handlers, settings.pattern_options())
                .unwrap()
                .with_domain(reg.domain.map(|d| DomainPattern::parse(d).unwrap()));
            builder.push(reg.slot, Arc::new(route));
        }
        Arc::new(AppState::new(builder.build(false), settings))
    }

    fn request(method: Method, uri: &str) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    fn ctx_for(state: &Arc<AppState>, req: Request<Bytes>) -> Ctx {
        let mut ctx = Ctx::new();
        ctx.reset(Arc::clone(state), req, None, None);
        ctx
    }

    async fn run(ctx: &mut Ctx) {
        if let Err(err) = ctx.next().await {
            ctx.next_with_error(err).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_middleware_then_route() {
        let state = app(
            vec![
                mw(
                    "/",
                    handler(|c| {
                        Box::pin(async move {
                            c.set_local("trace", vec!["root".to_string()]);
                            c.next().await
                        })
                    }),
                ),
                mw(
                    "/api",
                    handler(|c| {
                        Box::pin(async move {
                            c.set("x-api", "1");
                            c.next().await
                        })
                    }),
                ),
                get(
                    "/api/:id",
                    handler(|c| {
                        Box::pin(async move {
                            let trace = c.local::<Vec<String>>("trace").cloned().unwrap_or_default();
                            let body = format!("{}:{}", trace.join(","), c.param("id"));
                            c.send_string(body)
                        })
                    }),
                ),
            ],
            Settings::default(),
        );

        let mut ctx = ctx_for(&state, request(Method::GET, "/api/42"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::OK);
        assert_eq!(ctx.response_header("x-api"), Some("1"));
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"root:42"[..]));
    }

    #[tokio::test]
    async fn test_earliest_registration_wins_and_next_falls_through() {
        let state = app(
            vec![
                get(
                    "/items/:id",
                    handler(|c| Box::pin(async move {
                        if c.param("id") == "skip" {
                            return c.next().await;
                        }
                        c.send_string("first")
                    })),
                ),
                get("/items/*", handler(|c| Box::pin(async move { c.send_string("second") }))),
            ],
            Settings::default(),
        );

        let mut ctx = ctx_for(&state, request(Method::GET, "/items/1"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"first"[..]));

        let mut ctx = ctx_for(&state, request(Method::GET, "/items/skip"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_not_found_goes_through_error_handler() {
        let state = app(
            vec![get("/api/v1/:p/*", handler(|c| Box::pin(async move { c.send_string("ok") })))],
            Settings::default(),
        );
        let mut ctx = ctx_for(&state, request(Method::GET, "/api/v1"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ctx.response_body_bytes().as_deref(),
            Some(&b"Cannot GET /api/v1"[..])
        );
    }

    #[tokio::test]
    async fn test_custom_error_handler() {
        let mut state = Arc::try_unwrap(app(
            vec![get("/boom", handler(|_c| Box::pin(async move {
                Err(Error::new(StatusCode::CONFLICT, "taken"))
            })))],
            Settings::default(),
        ))
        .unwrap();
        state.error_handlers = vec![(
            String::new(),
            error_handler(|c, err| Box::pin(async move {
                c.status(err.status_code());
                c.json(&serde_json::json!({"error": err.message()}))
            })),
        )];
        let state = Arc::new(state);

        let mut ctx = ctx_for(&state, request(Method::GET, "/boom"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::CONFLICT);
        assert_eq!(ctx.response_header("content-type"), Some("application/json"));
        assert_eq!(
            ctx.response_body_bytes().as_deref(),
            Some(&br#"{"error":"taken"}"#[..])
        );
    }

    #[tokio::test]
    async fn test_head_falls_back_to_get() {
        let state = app(
            vec![get("/", handler(|c| Box::pin(async move { c.send_string("index") })))],
            Settings::default(),
        );
        let mut ctx = ctx_for(&state, request(Method::HEAD, "/"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let state = app(vec![], Settings::default());
        let method = Method::from_bytes(b"PURGE").unwrap();
        let mut ctx = ctx_for(&state, request(method, "/"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_case_folding_keeps_original_capture() {
        let state = app(
            vec![get("/Users/:name", handler(|c| Box::pin(async move {
                let name = c.param("name").to_string();
                c.send_string(name)
            })))],
            Settings::default(),
        );
        let mut ctx = ctx_for(&state, request(Method::GET, "/USERS/Alice/"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"Alice"[..]));

        let strict = app(
            vec![get("/users", handler(|c| Box::pin(async move { c.send_string("x") })))],
            Settings {
                case_sensitive: true,
                strict_routing: true,
                ..Settings::default()
            },
        );
        for uri in ["/Users", "/users/"] {
            let mut ctx = ctx_for(&strict, request(Method::GET, uri));
            run(&mut ctx).await;
            assert_eq!(ctx.response_status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_unescape_path() {
        let state = app(
            vec![get("/files/:name", handler(|c| Box::pin(async move {
                let name = c.param("name").to_string();
                c.send_string(name)
            })))],
            Settings {
                unescape_path: true,
                ..Settings::default()
            },
        );
        let mut ctx = ctx_for(&state, request(Method::GET, "/files/a%20b"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"a b"[..]));
    }

    #[tokio::test]
    async fn test_domain_params() {
        let state = app(
            vec![Reg {
                slot: MethodKind::Get.into(),
                path: "/",
                domain: Some(":user.blog.example.com"),
                handlers: vec![handler(|c| Box::pin(async move {
                    let body = format!("blog of {}", c.domain_param("user"));
                    c.send_string(body)
                }))],
            }],
            Settings::default(),
        );

        let req = Request::builder()
            .uri("/")
            .header("host", "John.Blog.Example.com:8080")
            .body(Bytes::new())
            .unwrap();
        let mut ctx = ctx_for(&state, req);
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"blog of john"[..]));
        assert_eq!(ctx.domain_param_or("missing", "none"), "none");

        let req = Request::builder()
            .uri("/")
            .header("host", "example.com")
            .body(Bytes::new())
            .unwrap();
        let mut ctx = ctx_for(&state, req);
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_param_helpers() {
        let state = app(
            vec![get("/page/:n/:opt?", handler(|c| Box::pin(async move {
                let n: u32 = c.param_as("n")?;
                let opt = c.param_or("opt", "none").to_string();
                c.send_string(format!("{n}-{opt}-{}", c.param("missing").len()))
            })))],
            Settings::default(),
        );
        let mut ctx = ctx_for(&state, request(Method::GET, "/page/7"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"7-none-0"[..]));

        let mut ctx = ctx_for(&state, request(Method::GET, "/page/x"));
        run(&mut ctx).await;
        assert_eq!(ctx.response_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_locals() {
        let mut ctx = Ctx::new();
        ctx.set_local("user", 42_u64);
        assert_eq!(ctx.local::<u64>("user"), Some(&42));
        assert_eq!(ctx.local::<String>("user"), None);
        assert_eq!(ctx.remove_local::<String>("user"), None);
        assert_eq!(ctx.remove_local::<u64>("user"), Some(42));
        assert!(ctx.local::<u64>("user").is_none());
    }

    #[test]
    fn test_release_clears_request_state_but_keeps_extensions() {
        #[derive(Clone, PartialEq, Debug)]
        struct Tenant(&'static str);

        let state = app(vec![], Settings::default());
        let mut ctx = Ctx::new().with_extension(Tenant("acme"));
        ctx.reset(Arc::clone(&state), request(Method::POST, "/x?y=1"), None, None);
        ctx.set_local("k", 1_i32);
        ctx.send_string("body").unwrap();

        ctx.release();
        assert!(ctx.app().is_none());
        assert!(ctx.local::<i32>("k").is_none());
        assert!(ctx.response_body_bytes().is_none());
        assert_eq!(ctx.extension::<Tenant>(), Some(&Tenant("acme")));
    }

    #[test]
    fn test_query_and_cookies() {
        let state = app(vec![], Settings::default());
        let req = Request::builder()
            .uri("/search?q=rust+lang&page=2&q=again")
            .header("cookie", "session=abc; theme=dark")
            .header("cookie", "extra=1")
            .body(Bytes::new())
            .unwrap();
        let ctx = ctx_for(&state, req);
        assert_eq!(ctx.query("q").as_deref(), Some("rust lang"));
        assert_eq!(ctx.queries().len(), 3);
        assert_eq!(ctx.original_url(), "/search?q=rust+lang&page=2&q=again");

        #[derive(serde::Deserialize)]
        struct Page {
            page: u32,
        }
        let parsed: Page = ctx.query_parser().unwrap();
        assert_eq!(parsed.page, 2);

        assert_eq!(ctx.cookie("session").as_deref(), Some("abc"));
        assert_eq!(ctx.cookie("extra").as_deref(), Some("1"));
        assert_eq!(ctx.cookies().len(), 3);
    }

    #[test]
    fn test_request_inspection() {
        let state = app(vec![], Settings::default());
        let req = Request::builder()
            .uri("/")
            .header("host", "tobi.ferrets.example.com")
            .header("content-type", "application/json; charset=utf-8")
            .header("accept", "text/html;q=0.5, application/json")
            .header("accept-language", "fr-CA, en;q=0.8")
            .header("x-requested-with", "XMLHttpRequest")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Bytes::from(r#"{"a":1}"#))
            .unwrap();
        let ctx = ctx_for(&state, req);
        assert!(ctx.is("json"));
        assert!(!ctx.is("html"));
        assert_eq!(ctx.accepts(&["html", "json"]), Some("json"));
        assert_eq!(ctx.accepts_languages(&["en", "fr-CA"]), Some("fr-CA"));
        assert!(ctx.xhr());
        assert_eq!(ctx.subdomains(2), ["tobi", "ferrets"]);
        assert_eq!(ctx.hostname(), "tobi.ferrets.example.com");
        assert_eq!(ctx.ips(), ["203.0.113.9", "10.0.0.1"]);
        assert_eq!(ctx.protocol(), "http");

        let value: serde_json::Value = ctx.body_json().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_ip_uses_proxy_header_only_when_trusted() {
        let state = app(
            vec![],
            Settings {
                proxy_header: Some("x-real-ip".into()),
                enable_trusted_proxy_check: true,
                trusted_proxies: vec!["10.0.0.1".parse().unwrap()],
                ..Settings::default()
            },
        );
        let req = || {
            Request::builder()
                .uri("/")
                .header("x-real-ip", "198.51.100.7")
                .body(Bytes::new())
                .unwrap()
        };

        let mut ctx = Ctx::new();
        ctx.reset(Arc::clone(&state), req(), None, Some("10.0.0.1:4000".parse().unwrap()));
        assert_eq!(ctx.ip(), Some("198.51.100.7".parse().unwrap()));

        ctx.reset(Arc::clone(&state), req(), None, Some("10.0.0.2:4000".parse().unwrap()));
        assert_eq!(ctx.ip(), Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_form_value_urlencoded() {
        let state = app(vec![], Settings::default());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from("name=Ada+Lovelace&lang=en"))
            .unwrap();
        let ctx = ctx_for(&state, req);
        assert_eq!(ctx.form_value("name").as_deref(), Some("Ada Lovelace"));
        assert!(ctx.form_value("missing").is_none());
    }

    #[test]
    fn test_fresh() {
        let state = app(vec![], Settings::default());
        let req = Request::builder()
            .uri("/")
            .header("if-none-match", "W/\"abc\", \"def\"")
            .body(Bytes::new())
            .unwrap();
        let mut ctx = ctx_for(&state, req);
        assert!(!ctx.fresh());
        ctx.set("etag", "\"abc\"");
        assert!(ctx.fresh());
        ctx.set("etag", "\"zzz\"");
        assert!(ctx.stale());

        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header("if-none-match", "*")
            .body(Bytes::new())
            .unwrap();
        let ctx = ctx_for(&state, req);
        assert!(!ctx.fresh());
    }

    #[test]
    fn test_response_helpers() {
        let mut ctx = Ctx::new();
        ctx.status(StatusCode::CREATED)
            .set("x-one", "1")
            .append("x-multi", "a")
            .append("x-multi", "b")
            .vary(&["Accept"])
            .vary(&["accept", "Origin"])
            .links(&[("/p/2", "next"), ("/p/9", "last")])
            .set("bad header", "ignored");
        assert_eq!(ctx.response_header("vary"), Some("Accept, Origin"));
        assert_eq!(
            ctx.response_header("link"),
            Some("</p/2>; rel=\"next\", </p/9>; rel=\"last\"")
        );
        assert_eq!(ctx.response_headers().get_all("x-multi").iter().count(), 2);

        ctx.jsonp(&serde_json::json!({"a": 1}), Some("cb")).unwrap();
        let response = ctx.take_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()["content-type"],
            "text/javascript; charset=utf-8"
        );
        assert_eq!(ctx.response_status(), StatusCode::OK);
        assert!(ctx.response_headers().is_empty());
    }

    #[test]
    fn test_redirect_and_cookies() {
        let mut ctx = Ctx::new();
        ctx.redirect("/login").unwrap();
        assert_eq!(ctx.response_status(), StatusCode::FOUND);
        assert_eq!(ctx.response_header("location"), Some("/login"));
        assert!(ctx.redirect_with_status("/x", StatusCode::OK).is_err());

        ctx.set_cookie(&SetCookie::new("a", "1").path("/"));
        ctx.clear_cookie(&["b"]);
        let cookies: Vec<_> = ctx
            .response_headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], "a=1; Path=/");
        assert!(cookies[1].starts_with("b=; "));
    }

    #[test]
    fn test_attachment_and_content_type() {
        let mut ctx = Ctx::new();
        ctx.attachment(Some("reports/q1.pdf"));
        assert_eq!(
            ctx.response_header("content-disposition"),
            Some("attachment; filename=\"q1.pdf\"")
        );
        assert_eq!(ctx.response_header("content-type"), Some("application/pdf"));

        ctx.content_type("json");
        assert_eq!(ctx.response_header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_send_file_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, "hi there").unwrap();

        let mut ctx = Ctx::new();
        ctx.send_file(&file).await.unwrap();
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"hi there"[..]));
        assert!(ctx.response_header("last-modified").is_some());

        let mut ctx = Ctx::new();
        ctx.download(&file, Some("greeting.txt")).await.unwrap();
        assert_eq!(
            ctx.response_header("content-disposition"),
            Some("attachment; filename=\"greeting.txt\"")
        );

        let mut ctx = Ctx::new();
        let err = ctx.send_file(dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sse_streams_events() {
        let mut ctx = Ctx::new();
        let sender = ctx.sse();
        assert_eq!(ctx.response_header("content-type"), Some("text/event-stream"));

        let response = ctx.take_response();
        let producer = tokio::spawn(async move {
            sender.send("hello").await.unwrap();
            sender.close().await;
        });
        let body = response.into_body().collect().await.unwrap().to_bytes();
        producer.await.unwrap();
        assert_eq!(&body[..], b"data: hello\n\n");
    }

    #[tokio::test]
    async fn test_shutdown_signal_and_deadline() {
        let (tx, rx) = notice_channel();
        let mut state = Arc::try_unwrap(app(vec![], Settings::default())).unwrap();
        state.notice = Some(rx);
        let state = Arc::new(state);

        let mut ctx = ctx_for(&state, request(Method::GET, "/"));
        let done = ctx.done();
        assert!(done.same_channel(&ctx.done()));
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());

        let deadline = Instant::now() + Duration::from_secs(3);
        tx.send_replace(ShutdownNotice {
            fired: true,
            deadline: Some(deadline),
        });
        tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .expect("done should fire");
        assert!(matches!(ctx.err(), Some(Error::RequestShutdown)));
        assert_eq!(ctx.deadline(), Some(deadline));
        assert!(ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn test_render_without_views_fails() {
        let state = app(vec![], Settings::default());
        let mut ctx = ctx_for(&state, request(Method::GET, "/"));
        assert!(ctx.render("index", &serde_json::json!({}), None).is_err());
    }
}
