//! Stack configuration
//!
//! The stack exposes no CLI and reads no files of its own: the embedding VM
//! manager hands it a fully-formed [`NetConfig`]. Defaults follow the SLIRP
//! network layout (guest 10.0.2.15, gateway 10.0.2.2, DNS 10.0.2.3).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::http::client::UpstreamRequest;
use crate::http::response::ResponseHead;

/// Guest-visible IP of the sandbox VM
pub const DEFAULT_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
/// Host-side gateway the guest routes through
pub const DEFAULT_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
/// Host-side DNS responder address
pub const DEFAULT_DNS_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);
/// Network prefix length advertised over DHCP
pub const DEFAULT_NETMASK: u8 = 24;
/// Link MTU; egress IP datagrams never exceed this
pub const DEFAULT_MTU: usize = 1500;

/// Hook invoked before an allowed request is issued upstream.
///
/// A hook may rewrite the outgoing request in place. Returning `Err` aborts
/// the exchange; the guest sees a synthetic 500 and the message is elided.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, req: &mut UpstreamRequest) -> std::result::Result<(), String>;
}

/// Hook invoked after upstream response headers arrive, before the body is
/// streamed back to the guest.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response(
        &self,
        req: &UpstreamRequest,
        head: &mut ResponseHead,
    ) -> std::result::Result<(), String>;
}

/// A secret registered with the policy engine.
///
/// The guest only ever sees the placeholder (`$NAME`); the real value is
/// substituted on the host, and only toward hosts matching `hosts`.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    /// Binding name; the guest-visible placeholder is `$` + name
    pub name: String,
    /// Real secret value, substituted at egress
    pub value: SecretString,
    /// Host patterns the secret may be sent to
    pub hosts: Vec<String>,
}

impl SecretSpec {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            value: SecretString::from(value.into()),
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ports admitted per scheme. Flows to other ports are blocked by policy.
#[derive(Debug, Clone)]
pub struct PortPolicy {
    /// Ports admitted for plaintext HTTP flows
    pub http: Vec<u16>,
    /// Ports admitted for TLS flows
    pub tls: Vec<u16>,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            http: vec![80],
            tls: vec![443],
        }
    }
}

/// Trust anchors used when the host client verifies upstream origins.
#[derive(Debug, Clone, Default)]
pub enum TrustRoots {
    /// Platform trust store (default)
    #[default]
    System,
    /// A PEM bundle supplied by the embedder, used instead of the system store
    PemBundle(Vec<u8>),
}

/// Configuration for one mediated guest link.
#[derive(Clone)]
pub struct NetConfig {
    /// Host allowlist patterns; empty means deny-all
    pub allowed_hosts: Vec<String>,
    /// Reject upstream targets resolving into private/loopback/etc. ranges
    pub block_internal_ranges: bool,
    /// Registered secret bindings
    pub secrets: Vec<SecretSpec>,
    /// Directory where CA and leaf material persists
    pub mitm_dir: PathBuf,
    /// Ports admitted per scheme
    pub ports: PortPolicy,
    /// Trust anchors for upstream verification
    pub trust_roots: TrustRoots,
    /// Before-request hook
    pub on_request: Option<Arc<dyn RequestHook>>,
    /// After-response hook
    pub on_response: Option<Arc<dyn ResponseHook>>,

    /// Guest IP leased over DHCP
    pub guest_ip: Ipv4Addr,
    /// Gateway (host) IP
    pub gateway_ip: Ipv4Addr,
    /// DNS responder IP
    pub dns_ip: Ipv4Addr,
    /// Prefix length advertised over DHCP
    pub netmask: u8,
    /// Link MTU
    pub mtu: usize,
    /// DHCP lease duration in seconds
    pub lease_secs: u32,

    /// Active flow cap; additional SYNs are answered with RST
    pub max_flows: usize,
    /// Per-flow receive window in bytes (never scaled)
    pub recv_window: usize,
    /// In-memory leaf certificate cache capacity
    pub leaf_cache_size: usize,
    /// Maximum TTL placed in DNS answers returned to the guest, seconds
    pub dns_ttl_cap: u32,
}

impl NetConfig {
    /// Configuration with spec defaults and an empty (deny-all) allowlist.
    pub fn new() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            block_internal_ranges: true,
            secrets: Vec::new(),
            mitm_dir: PathBuf::from("var/mitm"),
            ports: PortPolicy::default(),
            trust_roots: TrustRoots::System,
            on_request: None,
            on_response: None,
            guest_ip: DEFAULT_GUEST_IP,
            gateway_ip: DEFAULT_GATEWAY_IP,
            dns_ip: DEFAULT_DNS_IP,
            netmask: DEFAULT_NETMASK,
            mtu: DEFAULT_MTU,
            lease_secs: 3600,
            max_flows: 1024,
            recv_window: 64 * 1024,
            leaf_cache_size: 256,
            dns_ttl_cap: 60,
        }
    }

    /// Add one allowlist pattern (literal or wildcard, e.g. `*.example.com`)
    pub fn allow_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts.push(pattern.into());
        self
    }

    /// Register a secret binding
    pub fn secret(mut self, spec: SecretSpec) -> Self {
        self.secrets.push(spec);
        self
    }

    /// Toggle internal-range blocking (on by default)
    pub fn block_internal_ranges(mut self, on: bool) -> Self {
        self.block_internal_ranges = on;
        self
    }

    /// Set the MITM persistence directory
    pub fn mitm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mitm_dir = dir.into();
        self
    }

    /// Replace the admitted port lists
    pub fn ports(mut self, ports: PortPolicy) -> Self {
        self.ports = ports;
        self
    }

    /// Install a before-request hook
    pub fn on_request(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.on_request = Some(hook);
        self
    }

    /// Install an after-response hook
    pub fn on_response(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.on_response = Some(hook);
        self
    }

    /// Override the upstream trust anchors
    pub fn trust_roots(mut self, roots: TrustRoots) -> Self {
        self.trust_roots = roots;
        self
    }

    /// Cap the number of simultaneously active flows
    pub fn max_flows(mut self, n: usize) -> Self {
        self.max_flows = n;
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConfig")
            .field("allowed_hosts", &self.allowed_hosts)
            .field("block_internal_ranges", &self.block_internal_ranges)
            .field("secrets", &self.secrets.len())
            .field("mitm_dir", &self.mitm_dir)
            .field("ports", &self.ports)
            .field("guest_ip", &self.guest_ip)
            .field("gateway_ip", &self.gateway_ip)
            .field("dns_ip", &self.dns_ip)
            .field("mtu", &self.mtu)
            .field("max_flows", &self.max_flows)
            .finish_non_exhaustive()
    }
}
