//! HTTP termination and mediation
//!
//! Guest connections never reach the network: each HTTP/1.x request is
//! parsed off the flow, rewritten under policy (allowlist, secret
//! substitution, hooks), re-issued through the host-side client, and the
//! final response is serialized back. The same machinery runs over
//! plaintext flows and over the decrypted inside of TLS flows.

pub mod client;
pub mod headers;
pub mod mediator;
pub mod parse;
pub mod response;

pub use client::{ReqwestClient, UpstreamClient, UpstreamRequest, UpstreamResponse};
pub use headers::HeaderMap;
pub use response::ResponseHead;
