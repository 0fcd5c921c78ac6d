//! HTTP mediator
//!
//! Runs one request/response loop per accepted flow, over plaintext or over
//! the decrypted inside of a TLS interposition. Each guest request is
//! policed (secrets, allowlist, address range, port), issued upstream
//! through the pinned-resolution client, and streamed back. Policy blocks
//! and upstream failures become synthetic responses on the same connection,
//! which stays open for further requests.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::client::{UpstreamRequest, UpstreamResponse};
use super::headers::HeaderMap;
use super::parse::{GuestRequest, RequestReader};
use super::response::{self, BodyMode};
use crate::flow::FlowContext;
use crate::policy::{PolicyDecision, Scheme};
use crate::{Error, Result};

/// Mediate one guest connection until it closes.
///
/// A clean return means the connection ended in an orderly way (EOF or
/// `Connection: close`); an error means the flow should die by RST, which
/// happens structurally when the stream drops without shutdown.
pub(crate) async fn mediate<S>(stream: S, scheme: Scheme, ctx: &FlowContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = RequestReader::new(read_half);
    // host -> address pins held for the lifetime of this flow
    let mut pins: HashMap<String, Ipv4Addr> = HashMap::new();

    loop {
        let request = match reader.next().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(Error::Transport(reason)) => {
                debug!("mediator: malformed request ({reason}), answering 400");
                writer.write_all(&response::bad_request()).await?;
                break;
            }
            Err(e) => return Err(e),
        };
        let keep_alive = request.keep_alive();
        exchange(request, scheme, ctx, &mut pins, &mut writer).await?;
        if !keep_alive {
            break;
        }
    }

    writer.shutdown().await.ok();
    Ok(())
}

/// One request/response exchange. Synthetic responses are written here and
/// return `Ok`; only failures that must reset the flow return `Err`.
async fn exchange<W>(
    request: GuestRequest,
    scheme: Scheme,
    ctx: &FlowContext,
    pins: &mut HashMap<String, Ipv4Addr>,
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let Some((host, target)) = effective_target(&request) else {
        writer.write_all(&response::bad_request()).await?;
        return Ok(());
    };

    // Secret substitution happens before anything leaves the host, and a
    // placeholder aimed at the wrong host kills the request outright.
    let substituted = match substitute(&request, &host, ctx) {
        Ok(s) => s,
        Err(reason) => {
            ctx.stats.block(reason);
            writer.write_all(&response::blocked(reason)).await?;
            return Ok(());
        }
    };

    let resolved = match pins.get(&host) {
        Some(ip) => *ip,
        None => match ctx.resolver.lookup(&host).await {
            Ok(ip) => {
                pins.insert(host.clone(), ip);
                ip
            }
            Err(e) => {
                warn!("mediator: resolving {host} failed: {e}");
                writer.write_all(&response::bad_gateway("resolution")).await?;
                return Ok(());
            }
        },
    };

    match ctx.policy.evaluate(scheme, &host, ctx.remote_port, resolved) {
        PolicyDecision::Allowed => {}
        PolicyDecision::Blocked(reason) => {
            debug!("mediator: {} {host} blocked ({reason})", request.method);
            ctx.stats.block(reason);
            writer.write_all(&response::blocked(reason)).await?;
            return Ok(());
        }
    }

    let mut upstream_request = UpstreamRequest {
        method: request.method.clone(),
        scheme,
        host,
        port: ctx.remote_port,
        target,
        headers: substituted.headers,
        body: substituted.body,
        resolved_ip: resolved,
    };

    if let Some(hook) = &ctx.on_request {
        if let Err(message) = hook.on_request(&mut upstream_request).await {
            warn!("mediator: request hook failed: {message}");
            writer.write_all(&response::hook_failed()).await?;
            return Ok(());
        }
    }

    let mut upstream_response = match ctx.upstream.send(&upstream_request).await {
        Ok(r) => r,
        Err(e) => {
            warn!("mediator: upstream {} failed: {e}", upstream_request.url());
            writer.write_all(&response::bad_gateway("unreachable")).await?;
            return Ok(());
        }
    };

    if let Some(hook) = &ctx.on_response {
        if let Err(message) = hook
            .on_response(&upstream_request, &mut upstream_response.head)
            .await
        {
            warn!("mediator: response hook failed: {message}");
            writer.write_all(&response::hook_failed()).await?;
            return Ok(());
        }
    }

    ctx.stats.mediated();
    relay_response(&request.method, upstream_response, writer).await
}

struct Substituted {
    headers: HeaderMap,
    body: Vec<u8>,
}

fn substitute(
    request: &GuestRequest,
    host: &str,
    ctx: &FlowContext,
) -> std::result::Result<Substituted, crate::error::BlockReason> {
    let mut headers = HeaderMap::new();
    for (name, value) in request.headers.iter() {
        let value = ctx.policy.substitute_secrets(host, value)?;
        headers.push(name, value);
    }
    let body = ctx.policy.substitute_secrets(host, &request.body)?;
    Ok(Substituted { headers, body })
}

/// Effective (host, origin-form target) from absolute-form or Host header.
fn effective_target(request: &GuestRequest) -> Option<(String, String)> {
    for scheme_prefix in ["http://", "https://"] {
        if let Some(rest) = request.target.strip_prefix(scheme_prefix) {
            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            let host = authority.split(':').next()?.trim();
            if host.is_empty() {
                return None;
            }
            return Some((crate::dns::normalize(host), path.to_string()));
        }
    }
    let host = request.headers.get_str("host")?;
    let host = host.split(':').next()?.trim();
    if host.is_empty() {
        return None;
    }
    Some((crate::dns::normalize(host), request.target.clone()))
}

/// Serialize the upstream head and stream the body onto the guest
/// connection. Mid-body failures return `Err`: the committed response
/// cannot be completed, so the flow resets.
async fn relay_response<W>(
    method: &str,
    mut upstream: UpstreamResponse,
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let head = &upstream.head;
    let bodyless =
        method.eq_ignore_ascii_case("HEAD") || head.status / 100 == 1 || matches!(head.status, 204 | 304);
    let mode = if bodyless {
        BodyMode::None
    } else {
        head.headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(BodyMode::Length)
            .unwrap_or(BodyMode::Chunked)
    };

    response::write_head(writer, head, mode).await?;

    match mode {
        BodyMode::None => Ok(()),
        BodyMode::Length(expected) => {
            let mut written: u64 = 0;
            while let Some(chunk) = upstream.body.next_chunk().await? {
                written += chunk.len() as u64;
                writer.write_all(&chunk).await?;
            }
            if written != expected {
                return Err(Error::UpstreamHttp(format!(
                    "body ended at {written} of {expected} bytes"
                )));
            }
            Ok(())
        }
        BodyMode::Chunked => {
            while let Some(chunk) = upstream.body.next_chunk().await? {
                response::write_chunk(writer, &chunk).await?;
            }
            response::finish_chunked(writer).await?;
            Ok(())
        }
    }
}
