//! HTTP requests through the daemon's SOCKS proxy.
//!
//! Requests resolve names on the far side of the proxy (`socks5h`), so
//! `.onion` hosts work and no DNS leaks locally. There is no clearnet
//! fallback: with the service down, requests fail before any I/O.

use crate::error::{Error, Result};
use crate::status::{LifecycleState, StatusReporter};
use reqwest::redirect::Policy;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect timeout for the proxy hop; circuits are slow to build.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// PATCH
    Patch,
    /// HEAD
    Head,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(Error::Http(format!("unsupported method {}", other))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header pairs, sent in order.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Vec<u8>>,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Request with no headers or body and the default timeout.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Shorthand for a GET.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A completed response. Non-2xx statuses are responses, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status_code: u16,
    /// Response headers with valid UTF-8 values.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client bound to the running service's SOCKS endpoint.
#[derive(Clone)]
pub struct ProxyHttpClient {
    status: StatusReporter,
    cached: Arc<Mutex<Option<(SocketAddr, reqwest::Client)>>>,
}

impl ProxyHttpClient {
    /// Client that follows the given service status.
    pub fn new(status: StatusReporter) -> Self {
        Self {
            status,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    fn client_for(&self, socks: SocketAddr) -> Result<reqwest::Client> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((addr, client)) = cached.as_ref() {
            if *addr == socks {
                return Ok(client.clone());
            }
        }

        let socks_url = format!("socks5h://{}", socks);
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .proxy(
                reqwest::Proxy::all(&socks_url)
                    .map_err(|e| Error::Http(format!("failed to configure SOCKS proxy: {}", e)))?,
            )
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;

        tracing::debug!(proxy = %socks_url, "HTTP client configured");
        *cached = Some((socks, client.clone()));
        Ok(client)
    }

    /// Send `request` through the proxy.
    ///
    /// [`Error::ServiceNotReady`] unless running; [`Error::Timeout`] when
    /// the request's deadline passes (the transfer is abandoned).
    pub async fn request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let status = self.status.status();
        if status.state != LifecycleState::Running {
            return Err(Error::ServiceNotReady(status.state.name().to_string()));
        }
        let socks = status
            .socks_endpoint
            .ok_or_else(|| Error::ServiceNotReady("no socks endpoint".into()))?;

        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| Error::Http(format!("invalid url {:?}: {}", request.url, e)))?;
        if request.timeout.is_zero() {
            return Err(Error::Http("timeout must be greater than zero".into()));
        }

        let client = self.client_for(socks)?;
        let mut builder = client
            .request(request.method.as_reqwest(), url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        tracing::debug!(method = %request.method, host = ?host_of(&request.url), "Proxied request");

        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();

        tracing::debug!(status = status_code, bytes = body.len(), "Proxied response");
        Ok(HttpResponse {
            status_code,
            headers,
            body,
        })
    }
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url).ok()?.host_str().map(|h| {
        if h.ends_with(".onion") {
            crate::logging::RedactedOnion(h).to_string()
        } else {
            h.to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("DELETE".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert_eq!(HttpMethod::Post.to_string(), "POST");
    }

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::new(HttpMethod::Post, "http://example.onion/x")
            .header("Content-Type", "application/json")
            .body("{}")
            .timeout(Duration::from_secs(5));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(req.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_not_running_fails_without_io() {
        let client = ProxyHttpClient::new(StatusReporter::new());
        let err = client
            .request(&HttpRequest::get("http://example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotReady(state) if state == "not_started"));
        assert!(client.cached.lock().unwrap().is_none());
    }

    #[test]
    fn test_host_redacts_onion() {
        assert_eq!(host_of("http://example.com/a").as_deref(), Some("example.com"));
        let onion = host_of("http://abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx.onion/").unwrap();
        assert!(onion.starts_with("abcd..."));
    }
}
