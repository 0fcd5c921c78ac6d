//! Frame transport on the VM socket
//!
//! The VM presents the guest NIC as a stream socket carrying whole Ethernet
//! frames. Frame boundaries are preserved with a 4-byte big-endian length
//! prefix (the QEMU stream-netdev convention):
//!
//! - 4 bytes: frame length, big endian
//! - N bytes: one DIX Ethernet II frame (14-byte header + payload)
//!
//! A closed socket surfaces as [`Error::LinkClosed`]; the stack resets every
//! flow locally when that happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::{Error, Result};

/// Minimum valid Ethernet frame: destination + source MAC + EtherType
pub const MIN_FRAME: usize = 14;
/// Maximum frame accepted or emitted: 1500-byte MTU + Ethernet header
pub const MAX_FRAME: usize = 1514;

/// Reads length-delimited Ethernet frames from the guest socket.
pub struct FrameReader<S> {
    inner: ReadHalf<S>,
}

/// Writes length-delimited Ethernet frames to the guest socket.
pub struct FrameWriter<S> {
    inner: WriteHalf<S>,
}

/// Split a connected VM socket into framed halves.
pub fn split<S>(socket: S) -> (FrameReader<S>, FrameWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(socket);
    (FrameReader { inner: r }, FrameWriter { inner: w })
}

impl<S: AsyncRead> FrameReader<S> {
    /// Read one whole frame. Returns [`Error::LinkClosed`] on EOF and
    /// [`Error::Link`] on framing violations.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::LinkClosed,
                _ => Error::Link(format!("frame header read failed: {e}")),
            });
        }
        let len = u32::from_be_bytes(header) as usize;
        if len < MIN_FRAME || len > MAX_FRAME {
            return Err(Error::Link(format!("frame length {len} out of range")));
        }

        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::LinkClosed,
            _ => Error::Link(format!("frame body read failed: {e}")),
        })?;
        trace!("link: rx frame {} bytes", len);
        Ok(frame)
    }
}

impl<S: AsyncWrite> FrameWriter<S> {
    /// Write one whole frame, waiting for the socket to drain.
    ///
    /// Awaiting here is the stack's link-level backpressure: while the socket
    /// is full no further segments are emitted, so flow send windows stall.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() < MIN_FRAME || frame.len() > MAX_FRAME {
            return Err(Error::Link(format!(
                "refusing to emit frame of {} bytes",
                frame.len()
            )));
        }
        let header = (frame.len() as u32).to_be_bytes();
        let map_err = |e: std::io::Error| match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                Error::LinkClosed
            }
            _ => Error::Link(format!("frame write failed: {e}")),
        };
        self.inner.write_all(&header).await.map_err(map_err)?;
        self.inner.write_all(frame).await.map_err(map_err)?;
        trace!("link: tx frame {} bytes", frame.len());
        Ok(())
    }
}
