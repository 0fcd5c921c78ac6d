//! gatebox: Mediated Userspace Networking for Sandbox VMs
//!
//! A complete userspace network stack for the guest side of a QEMU-launched
//! sandbox. The VM's NIC backend is a stream socket carrying whole Ethernet
//! frames; gatebox terminates everything the guest sends — ARP, DHCP, ICMP,
//! DNS, TCP — and lets exactly two things out, both re-issued by the host
//! under policy:
//!
//! - **HTTP/1.x**: parsed, policed (allowlist, secret placeholders, hooks),
//!   re-sent with a real host HTTP client, response streamed back
//! - **TLS**: interposed with a locally-generated CA and per-SNI leaves,
//!   then mediated as HTTP on the decrypted inside
//!
//! Everything else is answered synthetically or refused: ICMP echo gets
//! local replies, DNS is resolved on the host with rebind defense, unknown
//! TCP protocols are reset, and non-DNS UDP is dropped.
//!
//! # Example
//!
//! ```no_run
//! use gatebox::{NetConfig, NetStack, SecretSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NetConfig::new()
//!         .allow_host("api.github.com")
//!         .secret(SecretSpec::new("TOKEN", "ghp_real", ["api.github.com"]))
//!         .mitm_dir("var/mitm");
//!
//!     let stack = NetStack::new(config)?;
//!     // the VM manager connects the QEMU netdev socket and hands it over
//!     let socket = tokio::net::UnixStream::connect("/run/vm/net.sock").await?;
//!     stack.run(socket).await?;
//!     Ok(())
//! }
//! ```

// Link and packet layers
pub mod dhcp;
pub mod eth;
pub mod icmp;
pub mod ipv4;
pub mod link;
pub mod udp;

// Naming and transport
pub mod dns;
pub mod tcp;

// Flow mediation
pub mod classify;
pub mod http;
pub mod policy;
pub mod tls;

// Wiring
pub mod config;
pub mod error;
pub mod stack;

mod flow;
mod rewind;

// Re-exports for convenience
pub use config::{NetConfig, PortPolicy, RequestHook, ResponseHook, SecretSpec, TrustRoots};
pub use error::{BlockReason, Error, Result};
pub use stack::{NetStack, StatsSnapshot};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{NetConfig, PortPolicy, SecretSpec, TrustRoots};
    pub use crate::dns::NameResolver;
    pub use crate::error::{BlockReason, Error, Result};
    pub use crate::http::client::{UpstreamClient, UpstreamRequest, UpstreamResponse};
    pub use crate::stack::{NetStack, StatsSnapshot};
}
