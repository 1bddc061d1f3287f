//! A single logical stream of a multiplexed session.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::frame::{Command, Frame, MAX_PAYLOAD};

/// Send credit for one stream: how many bytes we may still push before
/// the peer replenishes the window with `Upd` frames.
#[derive(Debug)]
pub(super) struct Credit {
    available: AtomicU32,
    closed: AtomicBool,
    waker: AtomicWaker,
}

impl Credit {
    pub(super) fn new(initial: u32) -> Self {
        Self {
            available: AtomicU32::new(initial),
            closed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    pub(super) fn add(&self, n: u32) {
        self.available.fetch_add(n, Ordering::Release);
        self.waker.wake();
    }

    /// Mark the stream unwritable and wake any blocked writer.
    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One multiplexed byte stream.
///
/// Reads and writes behave like a plain TCP stream; deadlines are the
/// caller's business (`tokio::time::timeout`). Dropping the stream sends
/// a `Fin` if one was not sent by `shutdown` already.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    frame_tx: mpsc::UnboundedSender<Frame>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    dropped_tx: mpsc::UnboundedSender<u32>,
    credit: Arc<Credit>,
    /// Bytes received but not yet consumed by the reader, shared with the
    /// session's receive loop which enforces the window on it.
    inflight: Arc<AtomicU32>,
    recv_window: u32,
    /// Window credit consumed since the last `Upd` we sent.
    consumed: u32,
    read_buf: Bytes,
    eof: bool,
    fin_sent: bool,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: u32,
        frame_tx: mpsc::UnboundedSender<Frame>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        dropped_tx: mpsc::UnboundedSender<u32>,
        credit: Arc<Credit>,
        inflight: Arc<AtomicU32>,
        recv_window: u32,
    ) -> Self {
        Self {
            id,
            frame_tx,
            data_rx,
            dropped_tx,
            credit,
            inflight,
            recv_window,
            consumed: 0,
            read_buf: Bytes::new(),
            eof: false,
            fin_sent: false,
        }
    }

    /// Stream id within the session.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Account consumed bytes and replenish the peer's view of our
    /// window once half of it has been eaten.
    fn account_consumed(&mut self, n: usize) {
        self.inflight.fetch_sub(n as u32, Ordering::AcqRel);
        self.consumed += n as u32;

        if self.consumed >= self.recv_window / 2 {
            let _ = self
                .frame_tx
                .send(Frame::window_update(self.id, self.consumed));
            self.consumed = 0;
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf.split_to(n));
                self.account_consumed(n);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }

            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    self.read_buf = bytes;
                }
                // Fin received or session torn down.
                Poll::Ready(None) => {
                    self.eof = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fin_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        // Register before checking state so a concurrent `add` or
        // `close` cannot slip between the check and the registration.
        self.credit.waker.register(cx.waker());
        if self.credit.is_closed() {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        let available = self.credit.available.load(Ordering::Acquire);
        if available == 0 {
            return Poll::Pending;
        }

        let n = buf.len().min(available as usize).min(MAX_PAYLOAD);
        self.credit
            .available
            .fetch_sub(n as u32, Ordering::AcqRel);

        let frame = Frame::new(Command::Psh, self.id, Bytes::copy_from_slice(&buf[..n]));
        if self.frame_tx.send(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session's send loop.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.fin_sent {
            self.fin_sent = true;
            let _ = self.frame_tx.send(Frame::control(Command::Fin, self.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let _ = self.frame_tx.send(Frame::control(Command::Fin, self.id));
        }
        let _ = self.dropped_tx.send(self.id);
    }
}
