//! Flow stream adapter
//!
//! Bridges the engine's per-connection buffers to the per-flow task
//! (classifier, HTTP mediator, TLS handshake) as an ordinary
//! `AsyncRead + AsyncWrite`. Shared state is a small mutex-guarded struct;
//! the engine drains/fills it from the event loop and wakes the stored
//! wakers, the flow task wakes the engine through a `Notify`.
//!
//! Backpressure is structural: the receive buffer's free space IS the
//! advertised TCP window, and a full send buffer parks the writer until the
//! guest's window lets segments drain.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

/// Cap on bytes the flow task may queue ahead of guest acknowledgment.
const SEND_BUFFER_MAX: usize = 64 * 1024;

/// State shared between one [`super::Connection`] and its [`FlowStream`].
#[derive(Default)]
pub(crate) struct StreamShared {
    /// In-order bytes from the guest, not yet read by the flow task
    pub recv: VecDeque<u8>,
    /// Guest sent FIN; EOF after `recv` drains
    pub recv_fin: bool,
    /// Bytes written by the flow task, not yet packetized
    pub send: VecDeque<u8>,
    /// Flow task finished writing; engine sends FIN once `send` drains
    pub send_fin: bool,
    /// Connection reset (either direction); all operations fail
    pub reset: bool,
    /// Flow task dropped its stream handle
    pub task_gone: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamShared {
    /// Free receive-buffer space, i.e. the window to advertise.
    pub fn recv_space(&self, window_max: usize) -> usize {
        window_max.saturating_sub(self.recv.len())
    }

    /// Engine: append in-order guest bytes and wake the reader.
    pub fn push_recv(&mut self, data: &[u8]) {
        self.recv.extend(data);
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    /// Engine: guest FIN arrived in order.
    pub fn push_fin(&mut self) {
        self.recv_fin = true;
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    /// Engine: take up to `max` bytes queued for the guest.
    pub fn take_send(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.send.len());
        let taken: Vec<u8> = self.send.drain(..n).collect();
        if !taken.is_empty() {
            if let Some(w) = self.write_waker.take() {
                w.wake();
            }
        }
        taken
    }

    /// Engine: tear the stream down; pending and future operations fail.
    pub fn mark_reset(&mut self) {
        self.reset = true;
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// The flow-task half of a TCP connection.
///
/// Reads yield the guest's bytes in strict order; writes are packetized by
/// the engine under the guest's advertised window. Dropping the stream
/// without `shutdown()` resets the connection.
pub struct FlowStream {
    shared: Arc<Mutex<StreamShared>>,
    engine_wake: Arc<Notify>,
}

impl FlowStream {
    pub(crate) fn new(shared: Arc<Mutex<StreamShared>>, engine_wake: Arc<Notify>) -> Self {
        Self {
            shared,
            engine_wake,
        }
    }

    /// Abort the connection: the engine sends RST and discards buffers.
    pub fn reset(&self) {
        self.shared.lock().unwrap().mark_reset();
        self.engine_wake.notify_one();
    }

    /// True once the guest closed its sending half.
    pub fn guest_closed(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.recv_fin && shared.recv.is_empty()
    }
}

impl AsyncRead for FlowStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.recv.is_empty() {
            let n = buf.remaining().min(shared.recv.len());
            let drained: Vec<u8> = shared.recv.drain(..n).collect();
            buf.put_slice(&drained);
            drop(shared);
            // reading opened receive window; let the engine advertise it
            self.engine_wake.notify_one();
            return Poll::Ready(Ok(()));
        }
        if shared.recv_fin {
            return Poll::Ready(Ok(())); // clean EOF
        }
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        shared.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if shared.send_fin {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let space = SEND_BUFFER_MAX.saturating_sub(shared.send.len());
        if space == 0 {
            shared.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = space.min(data.len());
        shared.send.extend(&data[..n]);
        drop(shared);
        self.engine_wake.notify_one();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the engine drains continuously; buffered bytes are already "flushed"
        // as far as this adapter can observe
        let shared = self.shared.lock().unwrap();
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock().unwrap();
        shared.send_fin = true;
        drop(shared);
        self.engine_wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for FlowStream {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.task_gone = true;
        if !shared.send_fin {
            // task abandoned the flow without a clean close
            shared.mark_reset();
        }
        drop(shared);
        self.engine_wake.notify_one();
    }
}
