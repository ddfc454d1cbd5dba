use crate::cache::SharedResolverCache;
use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::mirror::{build_mirror_request, MirrorDispatcher, MirrorPolicy};
use crate::pool::{BoxError, ConnectionPool, OutboundBody, PoolConfig};
use crate::target::BackendTarget;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, USER_AGENT};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe the client connection and are never forwarded
pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "upgrade"
            | "transfer-encoding"
    )
}

/// Headers the client scoped to this hop by naming them in `Connection`
pub(crate) fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

/// Strip hop-by-hop headers, including any named by `Connection`
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_listed(headers) {
        headers.remove(&name);
    }

    let hop: Vec<HeaderName> = headers.keys().filter(|n| is_hop_by_hop(n)).cloned().collect();
    for name in hop {
        headers.remove(&name);
    }
}

/// `X-Forwarded-For` with the client IP appended to any chain it already carries
fn forwarded_for(headers: &HeaderMap, client_addr: SocketAddr) -> Option<HeaderValue> {
    let ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    HeaderValue::from_str(&chain).ok()
}

/// Join two URL paths with exactly one slash between them
pub(crate) fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Merge the target's query with the request's, target first
pub(crate) fn join_query(target: Option<&str>, request: Option<&str>) -> Option<String> {
    let target = target.unwrap_or("");
    let request = request.unwrap_or("");
    match (target.is_empty(), request.is_empty()) {
        (true, true) => None,
        (false, false) => Some(format!("{}&{}", target, request)),
        _ => Some(format!("{}{}", target, request)),
    }
}

struct MirrorLeg {
    target: BackendTarget,
    dispatcher: MirrorDispatcher,
}

/// Everything a request needs: where the primary and mirror live, what to
/// copy onto the mirror, and how to resolve the primary host
pub struct ProxyContext {
    primary: BackendTarget,
    mirror: Option<MirrorLeg>,
    policy: MirrorPolicy,
    resolver: Option<SharedResolverCache>,
    pool: Arc<ConnectionPool>,
}

impl ProxyContext {
    /// Build from a validated config. `resolver` enables dynamic resolution
    /// of the primary host.
    pub fn from_config(config: &Config, resolver: Option<SharedResolverCache>) -> anyhow::Result<Self> {
        let primary = config.primary_target()?;
        let mirror = match config.mirror_target()? {
            Some(target) => Some(MirrorLeg {
                target,
                dispatcher: MirrorDispatcher::new()?,
            }),
            None => None,
        };
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };

        Ok(Self {
            primary,
            mirror,
            policy: MirrorPolicy::from_config(config)?,
            resolver,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        })
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// `host[:port]` to connect to for the primary backend
    fn resolve_authority(&self) -> String {
        let hostname = self.primary.host();
        let address = match &self.resolver {
            None => hostname.to_string(),
            Some(cache) => match cache.address(hostname) {
                Some(address) => {
                    debug!(hostname, address, "Resolved primary host from containers");
                    address
                }
                None => {
                    warn!(hostname, "No container found for host, falling back to system DNS");
                    hostname.to_string()
                }
            },
        };
        self.primary.authority_for(&address)
    }

    /// Point an inbound request URI at the primary backend
    fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, hyper::http::uri::InvalidUri> {
        let path = single_joining_slash(self.primary.path_prefix(), uri.path());
        let mut rewritten = format!(
            "{}://{}{}",
            self.primary.scheme(),
            self.resolve_authority(),
            path
        );
        if let Some(query) = join_query(self.primary.query(), uri.query()) {
            rewritten.push('?');
            rewritten.push_str(&query);
        }
        rewritten.parse()
    }
}

/// The shadowing reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, ctx: ProxyContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx: Arc::new(ctx),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            primary = %self.ctx.primary.base_url(),
            mirror = self.ctx.mirror.as_ref().map(|m| m.target.base_url()),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Forward one request to the primary and shadow it to the mirror.
///
/// The mirror copy is taken from the request as received, before any
/// primary-side header changes. Only the primary's response (or a proxy
/// error) reaches the client.
pub async fn handle_request<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut parts, body) = req.into_parts();

    debug!(method = %parts.method, uri = %parts.uri, request_id, "Incoming request");

    // The body can only be read once, so buffer it when both legs need it
    let buffer_body = ctx.mirror.is_some() && ctx.policy.mirror_body;
    let (primary_body, mirror_body): (OutboundBody, Option<Bytes>) = if buffer_body {
        match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                let primary = Full::new(bytes.clone())
                    .map_err(|never| match never {})
                    .boxed();
                (primary, Some(bytes))
            }
            Err(e) => {
                let e: BoxError = e.into();
                error!(request_id, error = %e, "Failed to read request body");
                return Ok(json_error_response(
                    ProxyErrorCode::BodyReadFailed,
                    "Failed to read request body",
                ));
            }
        }
    } else {
        (body.map_err(Into::into).boxed(), None)
    };

    if let Some(mirror) = &ctx.mirror {
        let mirror_req = build_mirror_request(&parts, mirror_body, &mirror.target, &ctx.policy);
        mirror.dispatcher.dispatch(mirror_req, &request_id);
    }

    ctx.policy.apply_primary_headers(&mut parts.headers);
    remove_hop_by_hop(&mut parts.headers);

    let headers = &mut parts.headers;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Some(value) = forwarded_for(headers, client_addr) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }

    parts.uri = match ctx.rewrite_uri(&parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            error!(request_id, error = %e, "Failed to build primary request URI");
            return Ok(json_error_response(
                ProxyErrorCode::RequestBuildFailed,
                "Failed to build backend request",
            ));
        }
    };

    let primary_url = parts.uri.to_string();
    match ctx.pool.send_request(Request::from_parts(parts, primary_body)).await {
        Ok(mut response) => {
            debug!(request_id, primary_url, status = response.status().as_u16(), "Primary responded");
            remove_hop_by_hop(response.headers_mut());
            Ok(response)
        }
        Err(e) => {
            error!(request_id, primary_url, error = %e, "Failed to forward request to primary");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolverCache;
    use http_body_util::Empty;
    use hyper::body::Frame;
    use hyper::StatusCode;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn context(primary: &str, mirror: Option<&str>, resolver: Option<SharedResolverCache>) -> ProxyContext {
        let mut config = Config::default();
        config.primary.url = primary.to_string();
        config.mirror.url = mirror.map(String::from);
        ProxyContext::from_config(&config, resolver).unwrap()
    }

    fn client_addr() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    struct FailingBody;

    impl Body for FailingBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            ))))
        }
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/mirror/", "/primary"), "/mirror/primary");
        assert_eq!(single_joining_slash("/mirror", "primary"), "/mirror/primary");
        assert_eq!(single_joining_slash("/mirror", "/primary"), "/mirror/primary");
        assert_eq!(single_joining_slash("/", "/primary"), "/primary");
        assert_eq!(single_joining_slash("", "/primary"), "/primary");
    }

    #[test]
    fn test_join_query() {
        assert_eq!(join_query(None, None), None);
        assert_eq!(join_query(Some("a=1"), None).as_deref(), Some("a=1"));
        assert_eq!(join_query(None, Some("b=2")).as_deref(), Some("b=2"));
        assert_eq!(join_query(Some("a=1"), Some("b=2")).as_deref(), Some("a=1&b=2"));
        assert_eq!(join_query(Some(""), Some("b=2")).as_deref(), Some("b=2"));
    }

    #[test]
    fn test_forwarded_for_appends_to_chain() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers, client_addr()).unwrap(), "10.0.0.1");

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        assert_eq!(
            forwarded_for(&headers, client_addr()).unwrap(),
            "1.2.3.4, 10.0.0.1"
        );

        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("5.6.7.8"));
        assert_eq!(
            forwarded_for(&headers, client_addr()).unwrap(),
            "1.2.3.4, 5.6.7.8, 10.0.0.1"
        );
    }

    #[test]
    fn test_remove_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-keep", HeaderValue::from_static("1"));

        remove_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-keep").unwrap(), "1");
    }

    #[test]
    fn test_rewrite_uri_static() {
        let ctx = context("http://backend.local:8002/api?key=1", None, None);
        let uri: Uri = "/users?page=2".parse().unwrap();
        assert_eq!(
            ctx.rewrite_uri(&uri).unwrap().to_string(),
            "http://backend.local:8002/api/users?key=1&page=2"
        );

        let ctx = context("http://backend.local", None, None);
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(ctx.rewrite_uri(&uri).unwrap().to_string(), "http://backend.local/");
    }

    #[test]
    fn test_rewrite_uri_dynamic() {
        let cache = Arc::new(ResolverCache::new());
        cache.insert("testing-app.com", "172.17.0.5");
        let ctx = context("http://testing-app.com:8000", None, Some(Arc::clone(&cache)));

        let uri: Uri = "/primary?testing=123".parse().unwrap();
        assert_eq!(
            ctx.rewrite_uri(&uri).unwrap().to_string(),
            "http://172.17.0.5:8000/primary?testing=123"
        );

        // A later rescan moves the host
        cache.insert("testing-app.com", "172.17.0.9");
        assert_eq!(
            ctx.rewrite_uri(&uri).unwrap().to_string(),
            "http://172.17.0.9:8000/primary?testing=123"
        );
    }

    #[test]
    fn test_rewrite_uri_dynamic_miss_uses_literal_host() {
        let cache = Arc::new(ResolverCache::new());
        let ctx = context("http://unknown.local:8000", None, Some(cache));
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(ctx.rewrite_uri(&uri).unwrap().to_string(), "http://unknown.local:8000/");
    }

    #[test]
    fn test_context_from_config() {
        let ctx = context("http://127.0.0.1:8000", Some("http://127.0.0.1:9000/mirror"), None);
        assert!(ctx.mirror.is_some());
        assert_eq!(ctx.primary.host(), "127.0.0.1");

        let ctx = context("http://127.0.0.1:8000", None, None);
        assert!(ctx.mirror.is_none());
    }

    #[tokio::test]
    async fn test_body_read_failure_returns_500() {
        let mut config = Config::default();
        config.primary.url = "http://127.0.0.1:1".to_string();
        config.mirror.url = Some("http://127.0.0.1:1".to_string());
        config.primary.do_mirror_body = true;
        let ctx = Arc::new(ProxyContext::from_config(&config, None).unwrap());

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(FailingBody)
            .unwrap();

        let response = handle_request(req, Arc::clone(&ctx), client_addr()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "BODY_READ_FAILED");
        // Nothing was forwarded
        assert_eq!(ctx.pool().stats().get_total_requests(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_primary_returns_502() {
        let ctx = Arc::new(context("http://127.0.0.1:1", None, None));
        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = handle_request(req, Arc::clone(&ctx), client_addr()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");
        assert_eq!(ctx.pool().stats().get_failed_requests(), 1);
    }
}
