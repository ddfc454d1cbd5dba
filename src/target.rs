//! Backend targets parsed from configured URLs
//!
//! A [`BackendTarget`] is the primary or mirror destination: scheme, host,
//! optional port, a path prefix and an optional query that is merged into
//! every outbound request.

use hyper::Uri;

/// Error returned when a backend URL cannot be used as a target
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid URL '{url}': {reason}")]
    Invalid { url: String, reason: String },
    #[error("URL '{0}' has no scheme (expected http:// or https://)")]
    MissingScheme(String),
    #[error("URL '{url}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("URL '{0}' has no host")]
    MissingHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    scheme: String,
    host: String,
    port: Option<u16>,
    path_prefix: String,
    query: Option<String>,
}

impl BackendTarget {
    pub fn parse(url: &str) -> Result<Self, TargetError> {
        let uri: Uri = url.trim().parse().map_err(|e: hyper::http::uri::InvalidUri| {
            TargetError::Invalid {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| TargetError::MissingScheme(url.to_string()))?
            .to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(TargetError::UnsupportedScheme {
                url: url.to_string(),
                scheme,
            });
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TargetError::MissingHost(url.to_string()))?
            .to_string();

        Ok(Self {
            scheme,
            host,
            port: uri.port_u16(),
            path_prefix: uri.path().to_string(),
            query: uri.query().filter(|q| !q.is_empty()).map(String::from),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Hostname without port, as it appears in the configured URL
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `scheme://host[:port]` with `host` replaced by `address`
    pub fn authority_for(&self, address: &str) -> String {
        match self.port {
            Some(port) => format!("{}:{}", address, port),
            None => address.to_string(),
        }
    }

    /// `scheme://host[:port]` of the configured URL
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority_for(&self.host))
    }

    /// Per-request URL on this target: base + prefix (trailing slash trimmed)
    /// + inbound path + `?query` when the inbound request carries one.
    ///
    /// The target's own query is not part of the result.
    pub fn request_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = self.base_url();
        url.push_str(self.path_prefix.trim_end_matches('/'));
        url.push_str(path);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}
