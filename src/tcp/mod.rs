//! TCP engine
//!
//! A fully owned per-flow TCP implementation: the stack is the only peer the
//! guest ever talks to, so every connection the guest opens terminates here.
//! smoltcp provides wire parsing/emission and checksums; all connection
//! state, retransmission, ordering, and window logic is in this module.
//!
//! Layout:
//! - [`wire`]: segment parse/build on top of smoltcp reprs
//! - [`stream`]: the `AsyncRead`/`AsyncWrite` adapter handed to per-flow tasks
//! - [`conn`]: the per-connection state machine
//! - [`engine`]: flow demux, accept/reset policy, timers

mod conn;
mod engine;
mod stream;
mod wire;

pub use engine::{FlowKey, NewFlow, TcpEngine};
pub use stream::FlowStream;

/// MSS advertised to the guest and used for egress segmentation.
pub const MSS: usize = 1460;
/// Initial retransmission timeout; doubled per retry.
pub const RTO_INITIAL: std::time::Duration = std::time::Duration::from_millis(1000);
/// Retransmissions before the flow is reset.
pub const MAX_RETRIES: u32 = 5;
/// Delayed-ACK holdback.
pub const ACK_DELAY: std::time::Duration = std::time::Duration::from_millis(40);
/// 2 x MSL; how long a closed flow absorbs stragglers.
pub const TIME_WAIT: std::time::Duration = std::time::Duration::from_secs(30);
