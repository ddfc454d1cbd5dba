//! Request duplication and fire-and-forget mirroring
//!
//! Each inbound request is split into the request forwarded to the primary
//! backend and a [`MirrorRequest`] that is sent to the mirror backend on its
//! own task. Nothing about the mirror leg (errors, status, latency) is ever
//! visible to the client.

use crate::config::{Config, Header};
use crate::proxy::{connection_listed, is_hop_by_hop};
use crate::target::BackendTarget;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use hyper::http::request::Parts;
use hyper::Method;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Overall timeout for a mirrored request, including reading its response
pub const MIRROR_TIMEOUT: Duration = Duration::from_secs(60);

/// What gets copied onto each leg. Static headers are always applied; the
/// flags only decide whether the client's own body and headers are copied.
#[derive(Debug, Clone, Default)]
pub struct MirrorPolicy {
    pub mirror_body: bool,
    pub mirror_headers: bool,
    pub mirror_static_headers: Vec<(HeaderName, HeaderValue)>,
    pub primary_static_headers: Vec<(HeaderName, HeaderValue)>,
}

fn to_header_pairs(headers: &[Header]) -> anyhow::Result<Vec<(HeaderName, HeaderValue)>> {
    headers
        .iter()
        .map(|h| {
            let name = HeaderName::from_bytes(h.key.as_bytes())
                .map_err(|e| anyhow::anyhow!("Invalid header name '{}': {}", h.key, e))?;
            let value = HeaderValue::from_str(&h.value)
                .map_err(|e| anyhow::anyhow!("Invalid value for header '{}': {}", h.key, e))?;
            Ok((name, value))
        })
        .collect()
}

impl MirrorPolicy {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            mirror_body: config.primary.do_mirror_body,
            mirror_headers: config.primary.do_mirror_headers,
            mirror_static_headers: to_header_pairs(&config.mirror.headers)?,
            primary_static_headers: to_header_pairs(&config.primary.headers)?,
        })
    }

    /// Overwrite the primary request's headers with the configured statics
    pub fn apply_primary_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.primary_static_headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Mirror-bound copy of an inbound request
#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Headers the mirror client derives from its own connection
fn is_connection_specific(name: &HeaderName) -> bool {
    name == HOST || name == CONTENT_LENGTH || is_hop_by_hop(name)
}

/// Build the mirror copy of an inbound request.
///
/// `body` is the buffered inbound body, present only when the policy mirrors
/// bodies. With `mirror_headers`, each client header is copied with its first
/// value only. Mirror static headers are applied last and win.
pub fn build_mirror_request(
    parts: &Parts,
    body: Option<Bytes>,
    target: &BackendTarget,
    policy: &MirrorPolicy,
) -> MirrorRequest {
    let url = target.request_url(parts.uri.path(), parts.uri.query());

    let mut headers = HeaderMap::new();
    if policy.mirror_headers {
        let hop_scoped = connection_listed(&parts.headers);
        for name in parts.headers.keys() {
            if is_connection_specific(name) || hop_scoped.contains(name) {
                continue;
            }
            if let Some(value) = parts.headers.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    for (name, value) in &policy.mirror_static_headers {
        headers.insert(name.clone(), value.clone());
    }

    MirrorRequest {
        method: parts.method.clone(),
        url,
        headers,
        body: if policy.mirror_body { body } else { None },
    }
}

/// Sends mirror requests on detached tasks
#[derive(Clone)]
pub struct MirrorDispatcher {
    client: reqwest::Client,
}

impl MirrorDispatcher {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(MIRROR_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build mirror HTTP client: {}", e))?;
        Ok(Self { client })
    }

    /// Spawn the mirror request. Returns `None` (after logging) when the
    /// request cannot be built. The handle is only useful for tests; the
    /// proxy never waits on it.
    pub fn dispatch(&self, request: MirrorRequest, request_id: &str) -> Option<JoinHandle<()>> {
        let mirror_url = request.url.clone();

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let built = match builder.build() {
            Ok(req) => req,
            Err(e) => {
                error!(mirror_url, request_id, error = %e, "Error creating mirroring request");
                return None;
            }
        };

        let client = self.client.clone();
        let request_id = request_id.to_string();
        Some(tokio::spawn(async move {
            send_mirror(client, built, mirror_url, request_id).await;
        }))
    }
}

async fn send_mirror(
    client: reqwest::Client,
    request: reqwest::Request,
    mirror_url: String,
    request_id: String,
) {
    debug!(mirror_url, request_id, method = %request.method(), "Mirroring request");

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            error!(mirror_url, request_id, error = %e, "Error in mirrored request");
            return;
        }
    };

    let status = response.status();
    match response.bytes().await {
        Ok(body) => debug!(
            mirror_url,
            request_id,
            status = status.as_u16(),
            body_bytes = body.len(),
            "Mirrored response"
        ),
        Err(e) => error!(mirror_url, request_id, error = %e, "Error reading mirrored response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn policy(mirror_body: bool, mirror_headers: bool) -> MirrorPolicy {
        MirrorPolicy {
            mirror_body,
            mirror_headers,
            mirror_static_headers: vec![(
                HeaderName::from_static("x-my-header"),
                HeaderValue::from_static("my-special-header"),
            )],
            primary_static_headers: vec![(
                HeaderName::from_static("x-primary-header"),
                HeaderValue::from_static("example-header"),
            )],
        }
    }

    #[test]
    fn test_mirror_url_composition() {
        let target = BackendTarget::parse("http://127.0.0.1:9000/mirror").unwrap();
        let p = parts(Method::GET, "/primary?testing=123", &[]);
        let req = build_mirror_request(&p, None, &target, &policy(false, false));
        assert_eq!(req.url, "http://127.0.0.1:9000/mirror/primary?testing=123");
        assert_eq!(req.method, Method::GET);
    }

    #[test]
    fn test_headers_not_copied_when_disabled() {
        let target = BackendTarget::parse("http://127.0.0.1:9000").unwrap();
        let p = parts(Method::GET, "/", &[("x-client", "1"), ("authorization", "secret")]);
        let req = build_mirror_request(&p, None, &target, &policy(false, false));

        assert!(req.headers.get("x-client").is_none());
        assert!(req.headers.get("authorization").is_none());
        assert_eq!(req.headers.get("x-my-header").unwrap(), "my-special-header");
        assert!(req.headers.get("x-primary-header").is_none());
    }

    #[test]
    fn test_headers_copied_first_value_only() {
        let target = BackendTarget::parse("http://127.0.0.1:9000").unwrap();
        let p = parts(
            Method::GET,
            "/",
            &[
                ("x-multi", "first"),
                ("x-multi", "second"),
                ("x-client", "1"),
                ("host", "proxy.local"),
                ("connection", "keep-alive"),
                ("content-length", "5"),
            ],
        );
        let req = build_mirror_request(&p, None, &target, &policy(false, true));

        let multi: Vec<&str> = req
            .headers
            .get_all("x-multi")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(multi, vec!["first"]);
        assert_eq!(req.headers.get("x-client").unwrap(), "1");
        assert!(req.headers.get("host").is_none());
        assert!(req.headers.get("connection").is_none());
        assert!(req.headers.get("content-length").is_none());
    }

    #[test]
    fn test_connection_listed_headers_not_copied() {
        let target = BackendTarget::parse("http://127.0.0.1:9000").unwrap();
        let p = parts(
            Method::GET,
            "/",
            &[
                ("connection", "x-hop-secret, X-Other-Hop"),
                ("x-hop-secret", "s3cr3t"),
                ("x-other-hop", "1"),
                ("x-client", "1"),
            ],
        );
        let req = build_mirror_request(&p, None, &target, &policy(false, true));

        assert!(req.headers.get("x-hop-secret").is_none());
        assert!(req.headers.get("x-other-hop").is_none());
        assert_eq!(req.headers.get("x-client").unwrap(), "1");
    }

    #[test]
    fn test_static_headers_override_copied() {
        let target = BackendTarget::parse("http://127.0.0.1:9000").unwrap();
        let p = parts(Method::GET, "/", &[("x-my-header", "from-client")]);
        let req = build_mirror_request(&p, None, &target, &policy(false, true));
        assert_eq!(req.headers.get("x-my-header").unwrap(), "my-special-header");
    }

    #[test]
    fn test_body_only_when_enabled() {
        let target = BackendTarget::parse("http://127.0.0.1:9000").unwrap();
        let p = parts(Method::POST, "/", &[]);

        let with = build_mirror_request(&p, Some(Bytes::from("hello")), &target, &policy(true, false));
        assert_eq!(with.body.as_deref(), Some(&b"hello"[..]));

        let without = build_mirror_request(&p, Some(Bytes::from("hello")), &target, &policy(false, false));
        assert!(without.body.is_none());
    }

    #[test]
    fn test_apply_primary_headers_overwrites() {
        let mut headers = HeaderMap::new();
        headers.insert("x-primary-header", HeaderValue::from_static("client"));
        headers.append("x-primary-header", HeaderValue::from_static("client-2"));
        policy(false, false).apply_primary_headers(&mut headers);

        let values: Vec<&str> = headers
            .get_all("x-primary-header")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["example-header"]);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = Config::default();
        config.primary.do_mirror_body = true;
        config.primary.headers = vec![Header::new("X-Primary-Header", "example-header")];
        config.mirror.headers = vec![Header::new("X-Mirror-Header", "example-header")];

        let policy = MirrorPolicy::from_config(&config).unwrap();
        assert!(policy.mirror_body);
        assert!(!policy.mirror_headers);
        assert_eq!(policy.primary_static_headers[0].0, "x-primary-header");
        assert_eq!(policy.mirror_static_headers[0].0, "x-mirror-header");

        config.mirror.headers = vec![Header::new("bad header", "x")];
        assert!(MirrorPolicy::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_skips_unbuildable_request() {
        let dispatcher = MirrorDispatcher::new().unwrap();
        let request = MirrorRequest {
            method: Method::GET,
            url: "not a url".to_string(),
            headers: HeaderMap::new(),
            body: None,
        };
        assert!(dispatcher.dispatch(request, "req-1").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_to_unreachable_mirror_completes_quietly() {
        let dispatcher = MirrorDispatcher::with_timeout(Duration::from_secs(5)).unwrap();
        let request = MirrorRequest {
            method: Method::POST,
            url: "http://127.0.0.1:1/mirror".to_string(),
            headers: HeaderMap::new(),
            body: Some(Bytes::from("hello")),
        };

        let handle = dispatcher.dispatch(request, "req-2").unwrap();
        // The task swallows the connection error
        handle.await.unwrap();
    }
}
