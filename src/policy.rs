//! Policy engine
//!
//! Decides whether an egress request may proceed: host allowlist with
//! single-label wildcards, internal-address blocking, per-scheme port
//! policy, and secret-placeholder substitution bound to host patterns.
//! Default posture is deny-all (empty allowlist) with internal ranges
//! blocked.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::{NetConfig, PortPolicy, SecretSpec};
use crate::dns::normalize;
use crate::error::BlockReason;

/// Scheme of a mediated flow, fixed by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Outcome of a policy consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Blocked(BlockReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternLabel {
    Literal(String),
    Wildcard,
}

/// One allowlist pattern. `*` matches exactly one DNS label, anywhere in
/// the pattern: `*.example.com` admits `a.example.com` but not
/// `a.b.example.com`; `api.*.net` admits `api.eu.net`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    labels: Vec<PatternLabel>,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        let labels = normalize(pattern)
            .split('.')
            .map(|label| {
                if label == "*" {
                    PatternLabel::Wildcard
                } else {
                    PatternLabel::Literal(label.to_string())
                }
            })
            .collect();
        Self { labels }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = normalize(host);
        let host_labels: Vec<&str> = host.split('.').collect();
        if host_labels.len() != self.labels.len() {
            return false;
        }
        self.labels
            .iter()
            .zip(host_labels)
            .all(|(pattern, label)| match pattern {
                PatternLabel::Wildcard => !label.is_empty(),
                PatternLabel::Literal(expected) => expected == label,
            })
    }
}

struct SecretBinding {
    name: String,
    /// Guest-visible stand-in: `$` + name
    placeholder: Vec<u8>,
    hosts: Vec<HostPattern>,
    value: SecretString,
}

/// The policy engine built from one [`NetConfig`].
pub struct PolicyEngine {
    allowlist: Vec<HostPattern>,
    block_internal: bool,
    internal_ranges: Vec<Ipv4Net>,
    ports: PortPolicy,
    secrets: Vec<SecretBinding>,
}

impl PolicyEngine {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            allowlist: config.allowed_hosts.iter().map(|p| HostPattern::parse(p)).collect(),
            block_internal: config.block_internal_ranges,
            internal_ranges: internal_ranges(),
            ports: config.ports.clone(),
            secrets: config.secrets.iter().map(SecretBinding::from_spec).collect(),
        }
    }

    /// Evaluate one prospective upstream exchange.
    pub fn evaluate(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
        resolved: Ipv4Addr,
    ) -> PolicyDecision {
        if !self.host_allowed(host) {
            debug!("policy: {host} not in allowlist");
            return PolicyDecision::Blocked(BlockReason::HostNotAllowed);
        }
        if self.block_internal && self.internal_ranges.iter().any(|net| net.contains(&resolved)) {
            debug!("policy: {host} resolved to internal address {resolved}");
            return PolicyDecision::Blocked(BlockReason::InternalAddress);
        }
        let admitted = match scheme {
            Scheme::Http => &self.ports.http,
            Scheme::Https => &self.ports.tls,
        };
        if !admitted.contains(&port) {
            debug!("policy: port {port} not admitted for {}", scheme.as_str());
            return PolicyDecision::Blocked(BlockReason::PortNotAllowed);
        }
        PolicyDecision::Allowed
    }

    /// True when `host` matches at least one allowlist pattern.
    pub fn host_allowed(&self, host: &str) -> bool {
        self.allowlist.iter().any(|p| p.matches(host))
    }

    /// Substitute secret placeholders in `input` for a request destined to
    /// `host`. A placeholder aimed at a host outside the binding's patterns
    /// blocks the request instead of leaking the placeholder upstream.
    ///
    /// This is the crate's only secret exposure point.
    pub fn substitute_secrets(
        &self,
        host: &str,
        input: &[u8],
    ) -> Result<Vec<u8>, BlockReason> {
        let mut out = input.to_vec();
        for binding in &self.secrets {
            if !contains(&out, &binding.placeholder) {
                continue;
            }
            if !binding.hosts.iter().any(|p| p.matches(host)) {
                debug!(
                    "policy: secret {} used toward disallowed host {host}",
                    binding.name
                );
                return Err(BlockReason::SecretOnDisallowedHost);
            }
            out = replace_all(
                &out,
                &binding.placeholder,
                binding.value.expose_secret().as_bytes(),
            );
        }
        Ok(out)
    }

}

impl SecretBinding {
    fn from_spec(spec: &SecretSpec) -> Self {
        let mut placeholder = Vec::with_capacity(spec.name.len() + 1);
        placeholder.push(b'$');
        placeholder.extend_from_slice(spec.name.as_bytes());
        Self {
            name: spec.name.clone(),
            placeholder,
            hosts: spec.hosts.iter().map(|p| HostPattern::parse(p)).collect(),
            value: spec.value.clone(),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn replace_all(input: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

/// RFC1918, loopback, link-local, CGNAT, multicast, broadcast, "this network".
fn internal_ranges() -> Vec<Ipv4Net> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "100.64.0.0/10",
        "224.0.0.0/4",
        "255.255.255.255/32",
        "0.0.0.0/8",
    ]
    .iter()
    .map(|s| s.parse().expect("static range"))
    .collect()
}
