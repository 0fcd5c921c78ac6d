//! TLS interposition
//!
//! TLS flows terminate here twice: the stack accepts the guest's handshake
//! with a leaf minted for the ClientHello's SNI, and the upstream side is
//! re-encrypted by the host HTTP client against real trust anchors. In
//! between, the decrypted byte streams run through the same HTTP mediator
//! as plaintext flows. A ClientHello without SNI rejects the flow.

pub mod ca;
pub mod sni;

pub use ca::MitmStore;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::classify::CLASSIFY_TIMEOUT;
use crate::flow::FlowContext;
use crate::http::mediator;
use crate::policy::Scheme;
use crate::rewind::Rewind;
use crate::{Error, Result};

use sni::SniResult;

/// ClientHello larger than this is nonsense; reject rather than buffer on.
const MAX_HELLO: usize = 16 * 1024;

/// Interpose one TLS flow: peek SNI, accept the guest handshake with a
/// minted leaf, then mediate HTTP over the decrypted stream.
///
/// `initial` holds the bytes the classifier already consumed; they are
/// replayed in front of `stream` for the real handshake.
pub(crate) async fn interpose<S>(initial: Vec<u8>, mut stream: S, ctx: &FlowContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = initial;
    let deadline = tokio::time::Instant::now() + CLASSIFY_TIMEOUT;
    let sni = loop {
        match sni::parse_client_hello_sni(&buf) {
            SniResult::Found(name) => break name,
            SniResult::Absent => {
                return Err(Error::ClassifierReject("client hello without SNI".into()));
            }
            SniResult::NeedMore => {
                if buf.len() > MAX_HELLO {
                    return Err(Error::ClassifierReject("oversized client hello".into()));
                }
                let mut chunk = [0u8; 4096];
                let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
                    .await
                    .map_err(|_| Error::ClassifierReject("client hello timeout".into()))?
                    .map_err(|e| Error::TlsHandshake(format!("reading hello: {e}")))?;
                if n == 0 {
                    return Err(Error::ClassifierReject("closed during hello".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    };

    debug!("tls: interposing flow for sni {sni}");
    let config = ctx.mitm.server_config_for(&sni)?;
    let acceptor = TlsAcceptor::from(config);
    let tls_stream = acceptor
        .accept(Rewind::new(buf, stream))
        .await
        .map_err(|e| {
            warn!("tls: guest handshake for {sni} failed: {e}");
            Error::TlsHandshake(format!("guest handshake: {e}"))
        })?;

    ctx.stats.tls_flow();
    mediator::mediate(tls_stream, Scheme::Https, ctx).await
}
