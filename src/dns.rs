//! DNS gate and host-side resolution
//!
//! Guest queries are never forwarded to any upstream server. The name is
//! resolved on the host, one address is chosen deterministically, and a
//! synthesized answer with a clamped TTL goes back to the guest. The same
//! cache feeds connect-time resolution, so the address a guest learns over
//! DNS and the address the host actually connects to cannot diverge within
//! the cache window (rebind defense).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Host-side name resolution seam. The production implementation uses the
/// system resolver; tests substitute a fixed map.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// All IPv4 addresses for `host`. An empty vec means the name exists
    /// but has no A records; an error means resolution failed.
    async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// System-configured resolver (reads the host's resolv.conf).
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Config(format!("system resolver unavailable: {e}")))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| Error::UpstreamHttp(format!("resolve {host}: {e}")))?;
        Ok(lookup
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

struct CacheEntry {
    ip: Ipv4Addr,
    expires: Instant,
}

/// Caching resolver shared by the DNS gate and connect-time pinning.
///
/// The cached address is chosen deterministically (numeric minimum) so the
/// answer handed to the guest and the address used for the host connection
/// agree even when the upstream resolver shuffles its answer set.
pub struct HostResolver {
    resolver: std::sync::Arc<dyn NameResolver>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl HostResolver {
    pub fn new(resolver: std::sync::Arc<dyn NameResolver>, ttl_cap_secs: u32) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_cap_secs as u64),
        }
    }

    /// Resolve `host` to the one pinned IPv4 address.
    pub async fn lookup(&self, host: &str) -> Result<Ipv4Addr> {
        let key = normalize(host);
        if let Some(ip) = self.cached(&key) {
            trace!("dns: cache hit {key} -> {ip}");
            return Ok(ip);
        }
        let mut ips = self.resolver.resolve_v4(&key).await?;
        ips.sort_unstable();
        let ip = *ips
            .first()
            .ok_or_else(|| Error::UpstreamHttp(format!("no A records for {key}")))?;
        debug!("dns: resolved {key} -> {ip} ({} candidates)", ips.len());
        self.cache.lock().unwrap().insert(
            key,
            CacheEntry {
                ip,
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(ip)
    }

    fn cached(&self, key: &str) -> Option<Ipv4Addr> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.ip),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Lowercase, strip the trailing dot.
pub fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Answer one guest query. Returns the wire-format response, or `None` for
/// datagrams that are not well-formed queries (dropped silently).
pub async fn answer_query(
    query_bytes: &[u8],
    resolver: &HostResolver,
    ttl_cap: u32,
) -> Option<Vec<u8>> {
    let query = Message::from_vec(query_bytes).ok()?;
    if query.message_type() != MessageType::Query || query.op_code() != OpCode::Query {
        return None;
    }
    let question = query.queries().first()?.clone();

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .add_query(question.clone());

    match question.query_type() {
        RecordType::A => {
            let host = normalize(&question.name().to_utf8());
            match resolver.lookup(&host).await {
                Ok(ip) => {
                    response.set_response_code(ResponseCode::NoError);
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        ttl_cap,
                        RData::A(A(ip)),
                    ));
                }
                Err(e) => {
                    warn!("dns: lookup {host} failed: {e}");
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }
        }
        // No IPv6 path through the stack: an empty NoError answer steers
        // clients to the A record.
        RecordType::AAAA => {
            response.set_response_code(ResponseCode::NoError);
        }
        other => {
            trace!("dns: refusing query type {other}");
            response.set_response_code(ResponseCode::NotImp);
        }
    }

    response.to_vec().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::Name;
    use std::str::FromStr;
    use std::sync::Arc;

    struct FixedResolver {
        map: HashMap<String, Vec<Ipv4Addr>>,
    }

    #[async_trait]
    impl NameResolver for FixedResolver {
        async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
            self.map
                .get(host)
                .cloned()
                .ok_or_else(|| Error::UpstreamHttp(format!("NXDOMAIN {host}")))
        }
    }

    fn resolver_with(host: &str, ips: &[Ipv4Addr]) -> HostResolver {
        let mut map = HashMap::new();
        map.insert(host.to_string(), ips.to_vec());
        HostResolver::new(Arc::new(FixedResolver { map }), 60)
    }

    fn a_query(name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(hickory_proto::op::Query::query(
                Name::from_str(name).unwrap(),
                rtype,
            ));
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn test_answer_pins_minimum_address() {
        let resolver = resolver_with(
            "example.com",
            &[
                Ipv4Addr::new(93, 184, 216, 34),
                Ipv4Addr::new(5, 6, 7, 8),
                Ipv4Addr::new(200, 1, 1, 1),
            ],
        );
        let wire = answer_query(&a_query("example.com.", RecordType::A), &resolver, 60)
            .await
            .expect("answer");
        let response = Message::from_vec(&wire).unwrap();
        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        let answers = response.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ttl(), 60);
        match answers[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(5, 6, 7, 8)),
            other => panic!("expected A record, got {other:?}"),
        }
        // connect-time lookup agrees with the answer the guest saw
        assert_eq!(
            resolver.lookup("example.com").await.unwrap(),
            Ipv4Addr::new(5, 6, 7, 8)
        );
    }

    #[tokio::test]
    async fn test_ttl_clamped() {
        let resolver = resolver_with("long-ttl.test", &[Ipv4Addr::new(1, 2, 3, 4)]);
        let wire = answer_query(&a_query("long-ttl.test.", RecordType::A), &resolver, 60)
            .await
            .unwrap();
        let response = Message::from_vec(&wire).unwrap();
        assert!(response.answers().iter().all(|r| r.ttl() <= 60));
    }

    #[tokio::test]
    async fn test_unknown_name_nxdomain() {
        let resolver = resolver_with("known.test", &[Ipv4Addr::new(1, 2, 3, 4)]);
        let wire = answer_query(&a_query("unknown.test.", RecordType::A), &resolver, 60)
            .await
            .unwrap();
        let response = Message::from_vec(&wire).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_aaaa_gets_empty_noerror() {
        let resolver = resolver_with("example.com", &[Ipv4Addr::new(1, 2, 3, 4)]);
        let wire = answer_query(&a_query("example.com.", RecordType::AAAA), &resolver, 60)
            .await
            .unwrap();
        let response = Message::from_vec(&wire).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let resolver = resolver_with("example.com", &[Ipv4Addr::new(1, 2, 3, 4)]);
        assert!(answer_query(b"\x00\x01junk", &resolver, 60).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_expiry_re_resolves() {
        let resolver = resolver_with("example.com", &[Ipv4Addr::new(9, 9, 9, 9)]);
        let first = resolver.lookup("example.com").await.unwrap();
        // hit again immediately: served from cache
        let second = resolver.lookup("EXAMPLE.COM.").await.unwrap();
        assert_eq!(first, second);
    }
}
