//! Error types for gatebox

use thiserror::Error;

/// Result type alias using gatebox Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable reason codes attached to a blocked policy decision.
///
/// These strings are part of the synthetic-response surface the guest sees,
/// so they must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Destination host does not match any allowlist pattern
    HostNotAllowed,
    /// Resolved address falls in a blocked internal range
    InternalAddress,
    /// Destination port not admitted for the flow's scheme
    PortNotAllowed,
    /// A secret placeholder was used toward a host outside the binding's patterns
    SecretOnDisallowedHost,
}

impl BlockReason {
    /// Stable wire-visible reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::HostNotAllowed => "host_not_allowed",
            BlockReason::InternalAddress => "internal_address",
            BlockReason::PortNotAllowed => "port_not_allowed",
            BlockReason::SecretOnDisallowedHost => "secret_on_disallowed_host",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in gatebox operations
#[derive(Error, Debug)]
pub enum Error {
    /// Frame malformed, unsupported EtherType, or framing violation on the VM socket
    #[error("link error: {0}")]
    Link(String),

    /// The VM frame socket closed; the whole stack tears down
    #[error("link closed")]
    LinkClosed,

    /// IP header invalid, fragmentation violation, or TTL exhausted
    #[error("L3 error: {0}")]
    L3(String),

    /// TCP checksum failure, unexpected segment, or peer reset
    #[error("transport error: {0}")]
    Transport(String),

    /// Flow carried a protocol the classifier does not admit
    #[error("classifier rejected flow: {0}")]
    ClassifierReject(String),

    /// Policy engine refused the request
    #[error("policy blocked: {0}")]
    PolicyBlocked(BlockReason),

    /// TLS handshake failed on either side of the interposition
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Host-side request failed before headers, or origin unreachable
    #[error("upstream HTTP error: {0}")]
    UpstreamHttp(String),

    /// Flow cap, buffer cap, or cache capacity exceeded
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// User-provided request/response hook raised
    #[error("hook error: {0}")]
    Hook(String),

    /// CA or leaf certificate material could not be created or loaded
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error tears down the whole stack rather than one flow.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LinkClosed)
    }
}
