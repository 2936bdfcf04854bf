//! Reverse proxy to the single backend origin
//!
//! Requests are forwarded verbatim apart from hop-by-hop headers, `Host`
//! (set to the backend's authority) and the `X-Forwarded-*` family.
//! Responses stream back unbuffered. A `Location` header that points at the
//! backend origin is rewritten to the gateway's external origin so clients
//! never learn where the backend actually lives.

use crate::error::{full_body, json_error_response, GatewayBody, GatewayErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use http_body_util::BodyExt;
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST,
    LOCATION,
};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, Instrument, Span};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and must not be relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid origin {input:?}: {reason}")]
pub struct OriginError {
    input: String,
    reason: &'static str,
}

impl OriginError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Scheme, host and optional port of a network endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        }
    }

    /// Parse `scheme://host[:port]`; any path must be empty or `/`
    pub fn parse(url: &str) -> Result<Self, OriginError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| OriginError::new(url, "not a valid URI"))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| OriginError::new(url, "missing scheme"))?;
        let authority = uri
            .authority()
            .ok_or_else(|| OriginError::new(url, "missing host"))?;
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(OriginError::new(url, "origin must not carry a path or query"));
        }

        Ok(Self::new(scheme, authority.host(), authority.port_u16()))
    }

    /// Derive the client-facing origin from a listen address such as
    /// `":9090"` or `"0.0.0.0:9090"`. An empty host becomes `localhost`.
    pub fn from_listen_addr(addr: &str) -> Result<Self, OriginError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| OriginError::new(addr, "expected host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| OriginError::new(addr, "port is not a number"))?;
        let host = if host.is_empty() { "localhost" } else { host };

        Ok(Self::new("http", host, Some(port)))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host[:port]`, as used in the `Host` header
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Where traffic goes and how the gateway presents itself to clients.
///
/// Built once at startup and shared read-only by every request.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    backend: Origin,
    external: Origin,
    backend_prefix: String,
    external_prefix: String,
}

impl ProxyRoute {
    pub fn new(backend: Origin, external: Origin) -> Self {
        Self {
            backend_prefix: backend.to_string(),
            external_prefix: external.to_string(),
            backend,
            external,
        }
    }

    pub fn backend(&self) -> &Origin {
        &self.backend
    }

    pub fn external(&self) -> &Origin {
        &self.external
    }

    /// Replace a leading backend origin with the external origin.
    ///
    /// Returns `None` when `location` does not start with the backend origin
    /// (relative paths, other hosts, other ports); those must pass through
    /// untouched.
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        let rest = location.strip_prefix(&self.backend_prefix)?;
        match rest.as_bytes().first() {
            None | Some(b'/') | Some(b'?') | Some(b'#') => {
                Some(format!("{}{}", self.external_prefix, rest))
            }
            Some(_) => None,
        }
    }
}

/// Whether backend redirects are handed to the client or followed here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Pass 3xx responses through, rewriting `Location` when it names the backend
    Rewrite,
    /// Follow redirects inside the gateway, replaying the buffered request body.
    /// `max_hops` bounds the backend requests per client request, the first
    /// one included, so at most `max_hops - 1` redirects are followed.
    Follow { max_hops: usize },
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        RedirectPolicy::Rewrite
    }
}

/// Failures while forwarding a single request
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Upstream(#[from] PoolError),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("redirect chain exceeded {0} backend requests")]
    TooManyRedirects(usize),
    #[error("invalid redirect target {0:?}")]
    InvalidRedirect(String),
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] hyper::Error),
    #[error("invalid backend URI: {0}")]
    InvalidUri(String),
}

/// Extension points around each proxied exchange
pub trait ProxyHooks: Send + Sync {
    /// Build the client response when the backend exchange failed
    fn on_transport_error(&self, path: &str, error: &ProxyError) -> Response<GatewayBody> {
        error!(path, error = %error, "Proxy request failed");
        json_error_response(GatewayErrorCode::UpstreamUnavailable, "upstream unavailable")
    }

    /// Adjust a backend response before it is returned to the client
    fn on_response(&self, route: &ProxyRoute, response: &mut Response<GatewayBody>) {
        rewrite_redirect(route, response);
    }
}

/// The standard 502 error body and `Location` rewrite
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ProxyHooks for DefaultHooks {}

/// Rewrite the response's `Location` header if it points at the backend.
///
/// Applied whatever the status code; a stray `Location` on a 200 is matched
/// the same way and the status is never touched.
pub fn rewrite_redirect(route: &ProxyRoute, response: &mut Response<GatewayBody>) {
    let location = match response.headers().get(LOCATION).map(|v| v.to_str()) {
        Some(Ok(location)) => location.to_string(),
        _ => return,
    };

    if let Some(rewritten) = route.rewrite_location(&location) {
        match HeaderValue::from_str(&rewritten) {
            Ok(value) => {
                debug!(from = %location, to = %rewritten, "Rewrote backend redirect");
                response.headers_mut().insert(LOCATION, value);
            }
            Err(e) => {
                debug!(location = %location, error = %e, "Rewritten Location is not a valid header");
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Resolve a `Location` value against the URI that produced it
fn resolve_redirect(base: &Uri, location: &str) -> Result<Uri, ProxyError> {
    let invalid = || ProxyError::InvalidRedirect(location.to_string());

    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri);
        }
    }

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().ok_or_else(invalid)?;

    let target = if location.starts_with("//") {
        format!("{}:{}", scheme, location)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else {
        let path = base.path();
        let dir = &path[..path.rfind('/').map(|i| i + 1).unwrap_or(0)];
        let dir = if dir.is_empty() { "/" } else { dir };
        format!("{}://{}{}{}", scheme, authority, dir, location)
    };

    target.parse().map_err(|_| invalid())
}

/// Forwards requests to the backend origin
pub struct ProxyGateway {
    route: Arc<ProxyRoute>,
    pool: Arc<ConnectionPool>,
    hooks: Arc<dyn ProxyHooks>,
    redirect_policy: RedirectPolicy,
    request_timeout: Option<Duration>,
    span: Span,
}

impl ProxyGateway {
    pub fn new(route: ProxyRoute, pool: Arc<ConnectionPool>) -> Self {
        let span = tracing::info_span!("proxy", backend = %route.backend());
        Self {
            route: Arc::new(route),
            pool,
            hooks: Arc::new(DefaultHooks),
            redirect_policy: RedirectPolicy::default(),
            request_timeout: None,
            span,
        }
    }

    pub fn with_hooks(mut self, hooks: impl ProxyHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = policy;
        self
    }

    /// Bound each backend exchange; expiry is reported like a transport failure
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Forward one request and produce the client response.
    ///
    /// Never fails: transport errors become the `on_transport_error` response.
    pub async fn forward(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
    ) -> Response<GatewayBody> {
        let path = req.uri().path().to_string();

        async {
            let outbound = match self.prepare(req, client_addr) {
                Ok(outbound) => outbound,
                Err(e) => return self.hooks.on_transport_error(&path, &e),
            };

            let exchange = async {
                match self.redirect_policy {
                    RedirectPolicy::Rewrite => {
                        self.pool.send(outbound).await.map_err(ProxyError::from)
                    }
                    RedirectPolicy::Follow { max_hops } => {
                        self.follow_redirects(outbound, max_hops).await
                    }
                }
            };

            let result = match self.request_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::Timeout(timeout)),
                },
                None => exchange.await,
            };

            match result {
                Ok(mut response) => {
                    strip_hop_by_hop(response.headers_mut());
                    self.hooks.on_response(&self.route, &mut response);
                    response
                }
                Err(e) => self.hooks.on_transport_error(&path, &e),
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Re-address the request at the backend and fix up its headers
    fn prepare(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
    ) -> Result<Request<GatewayBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let original_host = parts.headers.get(HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("{}{}", self.route.backend(), path_and_query)
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidUri(e.to_string()))?;

        // The pooled client speaks HTTP/1.1 to the backend whatever the client used
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);

        if !headers.contains_key(X_REQUEST_ID) {
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                headers.insert(X_REQUEST_ID, value);
            }
        }

        // Overwritten rather than appended: this gateway is the first trusted hop
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        let backend_host = HeaderValue::from_str(&self.route.backend().authority())
            .map_err(|e| ProxyError::InvalidUri(e.to_string()))?;
        headers.insert(HOST, backend_host);

        Ok(Request::from_parts(parts, body))
    }

    /// Follow backend redirects here instead of returning them to the client.
    ///
    /// The body is buffered once so 307/308 hops can resend it.
    async fn follow_redirects(
        &self,
        req: Request<GatewayBody>,
        max_hops: usize,
    ) -> Result<Response<GatewayBody>, ProxyError> {
        let (parts, body) = req.into_parts();
        let mut body = Some(
            body.collect()
                .await
                .map_err(ProxyError::RequestBody)?
                .to_bytes(),
        );
        let mut method = parts.method;
        let mut uri = parts.uri;
        let mut headers = parts.headers;
        let mut sent = 0;

        loop {
            let mut outbound = Request::new(full_body(body.clone().unwrap_or_default()));
            *outbound.method_mut() = method.clone();
            *outbound.uri_mut() = uri.clone();
            *outbound.headers_mut() = headers.clone();

            let response = self.pool.send(outbound).await?;
            sent += 1;
            let status = response.status();

            let redirect = matches!(
                status,
                StatusCode::MOVED_PERMANENTLY
                    | StatusCode::FOUND
                    | StatusCode::SEE_OTHER
                    | StatusCode::TEMPORARY_REDIRECT
                    | StatusCode::PERMANENT_REDIRECT
            );
            if !redirect {
                return Ok(response);
            }

            let location = match response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
                Some(location) => location.to_string(),
                None => return Ok(response),
            };

            if sent >= max_hops {
                return Err(ProxyError::TooManyRedirects(max_hops));
            }

            let next = resolve_redirect(&uri, &location)?;

            if matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
            ) && method != Method::HEAD
            {
                method = Method::GET;
                body = None;
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_TYPE);
            }

            if next.authority() != uri.authority() {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }
            if let Some(authority) = next.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(HOST, value);
                }
            }

            debug!(hop = sent, status = status.as_u16(), to = %next, "Following backend redirect");
            uri = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn route() -> ProxyRoute {
        ProxyRoute::new(
            Origin::parse("http://127.0.0.1:8080").unwrap(),
            Origin::from_listen_addr(":9090").unwrap(),
        )
    }

    fn gateway() -> ProxyGateway {
        ProxyGateway::new(route(), Arc::new(ConnectionPool::new(PoolConfig::default())))
    }

    fn response_with_location(status: StatusCode, location: &str) -> Response<GatewayBody> {
        Response::builder()
            .status(status)
            .header(LOCATION, location)
            .body(full_body(""))
            .unwrap()
    }

    #[test]
    fn test_origin_parse_and_display() {
        let origin = Origin::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(origin.scheme(), "http");
        assert_eq!(origin.host(), "127.0.0.1");
        assert_eq!(origin.port(), Some(8080));
        assert_eq!(origin.to_string(), "http://127.0.0.1:8080");

        let origin = Origin::parse("https://gateway.example.com/").unwrap();
        assert_eq!(origin.port(), None);
        assert_eq!(origin.to_string(), "https://gateway.example.com");

        assert!(Origin::parse("127.0.0.1:8080").is_err());
        assert!(Origin::parse("http://host/path").is_err());
        assert!(Origin::parse("not a url").is_err());
    }

    #[test]
    fn test_origin_from_listen_addr() {
        assert_eq!(
            Origin::from_listen_addr(":9090").unwrap().to_string(),
            "http://localhost:9090"
        );
        assert_eq!(
            Origin::from_listen_addr("0.0.0.0:9090").unwrap().to_string(),
            "http://0.0.0.0:9090"
        );
        assert_eq!(
            Origin::from_listen_addr("gateway.local:80").unwrap().to_string(),
            "http://gateway.local:80"
        );
        assert!(Origin::from_listen_addr("9090").is_err());
        assert!(Origin::from_listen_addr(":http").is_err());
    }

    #[test]
    fn test_rewrite_location_matching_origin() {
        let route = route();
        assert_eq!(
            route.rewrite_location("http://127.0.0.1:8080/new").as_deref(),
            Some("http://localhost:9090/new")
        );
        assert_eq!(
            route
                .rewrite_location("http://127.0.0.1:8080/a/b?x=1&y=2#frag")
                .as_deref(),
            Some("http://localhost:9090/a/b?x=1&y=2#frag")
        );
        assert_eq!(
            route.rewrite_location("http://127.0.0.1:8080").as_deref(),
            Some("http://localhost:9090")
        );
        assert_eq!(
            route.rewrite_location("http://127.0.0.1:8080?q").as_deref(),
            Some("http://localhost:9090?q")
        );
    }

    #[test]
    fn test_rewrite_location_leaves_others_alone() {
        let route = route();
        for location in [
            "https://example.com/x",
            "/relative",
            "relative/path",
            "//127.0.0.1:8080/scheme-relative",
            "http://127.0.0.1:8081/other-port",
            "http://127.0.0.1:80801/longer-port",
            "https://127.0.0.1:8080/other-scheme",
            "http://localhost:8080/other-host",
        ] {
            assert_eq!(route.rewrite_location(location), None, "{}", location);
        }
    }

    #[test]
    fn test_rewrite_redirect_preserves_status() {
        let route = route();

        let mut resp = response_with_location(StatusCode::TEMPORARY_REDIRECT, "http://127.0.0.1:8080/new");
        rewrite_redirect(&route, &mut resp);
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers()[LOCATION], "http://localhost:9090/new");

        let mut resp = response_with_location(StatusCode::OK, "http://127.0.0.1:8080/stray");
        rewrite_redirect(&route, &mut resp);
        assert_eq!(resp.status(), StatusCode::OK);

        let mut resp = response_with_location(StatusCode::FOUND, "https://example.com/x");
        rewrite_redirect(&route, &mut resp);
        assert_eq!(resp.headers()[LOCATION], "https://example.com/x");
    }

    #[test]
    fn test_rewrite_redirect_ignores_non_utf8_location() {
        let route = route();
        let mut resp = Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, HeaderValue::from_bytes(b"http://127.0.0.1:8080/\xff").unwrap())
            .body(full_body(""))
            .unwrap();

        rewrite_redirect(&route, &mut resp);
        assert_eq!(resp.headers()[LOCATION].as_bytes(), b"http://127.0.0.1:8080/\xff");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Session-Hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-custom", HeaderValue::from_static("yes"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-custom"], "yes");
        assert_eq!(headers[CONTENT_TYPE], "image/png");
    }

    #[test]
    fn test_resolve_redirect() {
        let base: Uri = "http://127.0.0.1:8080/a/b?x=1".parse().unwrap();

        assert_eq!(
            resolve_redirect(&base, "https://example.com/x").unwrap().to_string(),
            "https://example.com/x"
        );
        assert_eq!(
            resolve_redirect(&base, "/new").unwrap().to_string(),
            "http://127.0.0.1:8080/new"
        );
        assert_eq!(
            resolve_redirect(&base, "c?y=2").unwrap().to_string(),
            "http://127.0.0.1:8080/a/c?y=2"
        );
        assert_eq!(
            resolve_redirect(&base, "//other.host/p").unwrap().to_string(),
            "http://other.host/p"
        );
    }

    #[test]
    fn test_prepare_rewrites_host_and_keeps_custom_headers() {
        let gateway = gateway();
        let req = Request::builder()
            .method("POST")
            .uri("/generate?kind=png")
            .header(HOST, "localhost:9090")
            .header("x-custom", "yes")
            .header(CONNECTION, "keep-alive")
            .header(X_FORWARDED_FOR, "6.6.6.6")
            .body(full_body("{}"))
            .unwrap();

        let client: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let prepared = gateway.prepare(req, client).unwrap();

        assert_eq!(prepared.method(), Method::POST);
        assert_eq!(prepared.uri().to_string(), "http://127.0.0.1:8080/generate?kind=png");
        assert_eq!(prepared.version(), Version::HTTP_11);

        let headers = prepared.headers();
        assert_eq!(headers[HOST], "127.0.0.1:8080");
        assert_eq!(headers["x-custom"], "yes");
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.2.3");
        assert_eq!(headers[X_FORWARDED_HOST], "localhost:9090");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert!(headers.contains_key(X_REQUEST_ID));
        assert!(!headers.contains_key(CONNECTION));
    }

    #[test]
    fn test_prepare_keeps_client_request_id() {
        let gateway = gateway();
        let req = Request::builder()
            .uri("/")
            .header(X_REQUEST_ID, "req-42")
            .body(full_body(""))
            .unwrap();

        let prepared = gateway.prepare(req, "127.0.0.1:1".parse().unwrap()).unwrap();
        assert_eq!(prepared.headers()[X_REQUEST_ID], "req-42");
    }

    #[tokio::test]
    async fn test_forward_to_closed_port_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let route = ProxyRoute::new(
            Origin::new("http", "127.0.0.1", Some(port)),
            Origin::from_listen_addr(":9090").unwrap(),
        );
        let gateway = ProxyGateway::new(route, Arc::new(ConnectionPool::new(PoolConfig::default())));

        let req = Request::builder()
            .method("POST")
            .uri("/generate")
            .body(full_body("{}"))
            .unwrap();
        let resp = gateway.forward(req, "127.0.0.1:1".parse().unwrap()).await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"error":"upstream unavailable"}"#);
    }

    struct TeapotHooks;

    impl ProxyHooks for TeapotHooks {
        fn on_transport_error(&self, _path: &str, _error: &ProxyError) -> Response<GatewayBody> {
            Response::builder()
                .status(StatusCode::IM_A_TEAPOT)
                .body(full_body(""))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_custom_transport_error_hook() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let route = ProxyRoute::new(
            Origin::new("http", "127.0.0.1", Some(port)),
            Origin::from_listen_addr(":9090").unwrap(),
        );
        let gateway = ProxyGateway::new(route, Arc::new(ConnectionPool::new(PoolConfig::default())))
            .with_hooks(TeapotHooks);

        let req = Request::builder().uri("/").body(full_body("")).unwrap();
        let resp = gateway.forward(req, "127.0.0.1:1".parse().unwrap()).await;
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }
}
