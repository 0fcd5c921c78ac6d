//! Per-flow driver
//!
//! Spawned once a TCP handshake completes. Classifies the flow from its
//! first bytes, then hands it to the HTTP mediator or the TLS interposer.
//! A rejected classification resets the flow; so does any error path, since
//! dropping the stream without a clean shutdown sends RST structurally.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::classify::{classify_stream, Classification};
use crate::config::{RequestHook, ResponseHook};
use crate::dns::HostResolver;
use crate::http::client::UpstreamClient;
use crate::http::mediator;
use crate::policy::{PolicyEngine, Scheme};
use crate::rewind::Rewind;
use crate::stack::StackStats;
use crate::tcp::FlowStream;
use crate::tls::MitmStore;
use crate::Error;

/// Everything a flow task needs, shared read-mostly across flows.
pub(crate) struct FlowContext {
    pub policy: Arc<PolicyEngine>,
    pub resolver: Arc<HostResolver>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub mitm: Arc<MitmStore>,
    pub on_request: Option<Arc<dyn RequestHook>>,
    pub on_response: Option<Arc<dyn ResponseHook>>,
    /// The flow's original TCP destination
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub stats: Arc<StackStats>,
}

/// Drive one flow to completion.
pub(crate) async fn drive(mut stream: FlowStream, ctx: Arc<FlowContext>) {
    let (classification, consumed) = classify_stream(&mut stream).await;
    let peer = format!("{}:{}", ctx.remote_ip, ctx.remote_port);

    match classification {
        Classification::Rejected(reason) => {
            debug!("flow {peer}: rejected ({reason})");
            ctx.stats.reject_flow();
            stream.reset();
        }
        Classification::Http => {
            ctx.stats.http_flow();
            let stream = Rewind::new(consumed, stream);
            match mediator::mediate(stream, Scheme::Http, &ctx).await {
                Ok(()) => debug!("flow {peer}: http mediation finished"),
                Err(e) => warn!("flow {peer}: http mediation aborted: {e}"),
            }
        }
        Classification::Tls => {
            match crate::tls::interpose(consumed, stream, &ctx).await {
                Ok(()) => debug!("flow {peer}: tls mediation finished"),
                Err(Error::ClassifierReject(reason)) => {
                    debug!("flow {peer}: tls rejected ({reason})");
                    ctx.stats.reject_flow();
                }
                Err(e) => warn!("flow {peer}: tls mediation aborted: {e}"),
            }
        }
    }
}
