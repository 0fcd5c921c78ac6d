//! Host-side upstream client
//!
//! The mediator never connects anywhere itself; it hands a fully-policed
//! [`UpstreamRequest`] to an [`UpstreamClient`]. The production
//! implementation wraps reqwest (rustls, streaming bodies, redirects
//! followed host-side) with the flow's pinned address injected into the
//! client's resolver so the connection goes exactly where policy checked.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use super::headers::HeaderMap;
use super::response::ResponseHead;
use crate::config::TrustRoots;
use crate::policy::Scheme;
use crate::{Error, Result};

/// A policed request, ready to issue upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub scheme: Scheme,
    /// Destination host as the guest named it (post-normalization)
    pub host: String,
    /// Destination port (the flow's real TCP destination port)
    pub port: u16,
    /// Origin-form path and query
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Pinned address policy was evaluated against; the connection MUST go here
    pub resolved_ip: Ipv4Addr,
}

impl UpstreamRequest {
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.target
        )
    }
}

/// Streaming response body.
#[async_trait]
pub trait UpstreamBody: Send {
    /// Next chunk, or `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Response head plus a streaming body.
pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: Box<dyn UpstreamBody>,
}

/// The seam between the mediator and the real network.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issue the request; resolves only through `req.resolved_ip`, follows
    /// redirects host-side, and returns the final response.
    async fn send(&self, req: &UpstreamRequest) -> Result<UpstreamResponse>;
}

/// reqwest-backed production client.
pub struct ReqwestClient {
    trust: TrustRoots,
    connect_timeout: Duration,
}

impl ReqwestClient {
    pub fn new(trust: TrustRoots) -> Self {
        Self {
            trust,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// A client pinned to one (host, addr) pair. Built per request because
    /// the pin differs per flow; connection reuse would cross pins.
    fn build(&self, host: &str, addr: Ipv4Addr) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .resolve(host, SocketAddr::new(IpAddr::V4(addr), 0));
        if let TrustRoots::PemBundle(pem) = &self.trust {
            builder = builder.tls_built_in_root_certs(false);
            let certs = reqwest::Certificate::from_pem_bundle(pem)
                .map_err(|e| Error::Config(format!("trust bundle unreadable: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        builder
            .build()
            .map_err(|e| Error::UpstreamHttp(format!("client build: {e}")))
    }
}

#[async_trait]
impl UpstreamClient for ReqwestClient {
    async fn send(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
        let client = self.build(&req.host, req.resolved_ip)?;
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| Error::UpstreamHttp(format!("method {:?}", req.method)))?;

        let mut builder = client.request(method, req.url());
        for (name, value) in req.headers.iter() {
            if super::response::is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::UpstreamHttp(classify_reqwest(&e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            headers.push(name.as_str(), value.as_bytes());
        }
        let status = response.status();
        Ok(UpstreamResponse {
            head: ResponseHead {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
                headers,
            },
            body: Box::new(ReqwestBody(response)),
        })
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl UpstreamBody for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.0
            .chunk()
            .await
            .map(|opt| opt.map(|b| b.to_vec()))
            .map_err(|e| Error::UpstreamHttp(format!("body stream: {e}")))
    }
}

/// Collapse reqwest's error surface into a short cause for logs; the guest
/// only ever sees a generic 502.
fn classify_reqwest(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout".to_string()
    } else if e.is_connect() {
        "connect failed".to_string()
    } else if e.is_redirect() {
        "redirect loop".to_string()
    } else {
        "request failed".to_string()
    }
}
