//! Session bookkeeping: frame routing, stream registry, keepalives.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{Command, Frame, Header, HEADER_LEN};
use super::stream::{Credit, Stream};
use super::Error;

/// Session tuning. Both endpoints of a connection must agree on
/// `recv_window`, since the initial send credit for a new stream is
/// assumed to equal the peer's receive window.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-stream receive window, in bytes.
    pub recv_window: u32,
    /// How often a `Nop` keepalive frame is sent, if at all.
    pub keepalive_interval: Option<Duration>,
    /// How many accepted-but-unclaimed streams may queue up before new
    /// `Syn` frames are refused.
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_window: 256 * 1024,
            keepalive_interval: Some(Duration::from_secs(30)),
            accept_backlog: 64,
        }
    }
}

struct StreamHandle {
    data_tx: mpsc::UnboundedSender<Bytes>,
    credit: Arc<Credit>,
    inflight: Arc<std::sync::atomic::AtomicU32>,
}

struct Shared {
    config: Config,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    next_id: AtomicU32,
    frame_tx: mpsc::UnboundedSender<Frame>,
    dropped_tx: mpsc::UnboundedSender<u32>,
    closed: CancellationToken,
}

impl Shared {
    fn create_stream(self: &Arc<Self>, id: u32) -> Stream {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Credit::new(self.config.recv_window));
        let inflight = Arc::new(AtomicU32::new(0));

        self.streams.lock().expect("mux stream registry poisoned").insert(
            id,
            StreamHandle {
                data_tx,
                credit: credit.clone(),
                inflight: inflight.clone(),
            },
        );

        Stream::new(
            id,
            self.frame_tx.clone(),
            data_rx,
            self.dropped_tx.clone(),
            credit,
            inflight,
            self.config.recv_window,
        )
    }

    fn remove_stream(&self, id: u32) {
        self.streams
            .lock()
            .expect("mux stream registry poisoned")
            .remove(&id);
    }

    /// Invalidate every child stream and mark the session closed.
    fn teardown(&self) {
        self.closed.cancel();

        let mut streams = self.streams.lock().expect("mux stream registry poisoned");
        for (_, handle) in streams.drain() {
            handle.credit.close();
        }
    }
}

/// A multiplexed session over one reliable transport.
///
/// Cheap to clone; all clones refer to the same underlying connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: flume::Receiver<Stream>,
}

impl Session {
    /// Run the client side of a session. The client allocates odd stream
    /// ids; use [`Session::server`] on the other end.
    pub fn client<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, config, 1)
    }

    /// Run the server side of a session, allocating even stream ids.
    pub fn server<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, config, 2)
    }

    fn start<T>(io: T, config: Config, first_id: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);

        let keepalive = config.keepalive_interval;
        let shared = Arc::new(Shared {
            config,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
            frame_tx,
            dropped_tx,
            closed: CancellationToken::new(),
        });

        tokio::spawn(run_send_loop(
            write_half,
            frame_rx,
            shared.closed.clone(),
        ));
        tokio::spawn(run_recv_loop(
            read_half,
            shared.clone(),
            accept_tx,
            // Remote ids have the opposite parity of ours.
            (first_id + 1) % 2,
        ));
        tokio::spawn(run_dropped_loop(shared.clone(), dropped_rx));

        if let Some(every) = keepalive {
            tokio::spawn(run_keepalive_loop(shared.clone(), every));
        }

        Self { shared, accept_rx }
    }

    /// Open a new outgoing stream.
    pub fn open_stream(&self) -> Result<Stream, Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.create_stream(id);

        if self
            .shared
            .frame_tx
            .send(Frame::control(Command::Syn, id))
            .is_err()
        {
            self.shared.remove_stream(id);
            return Err(Error::SessionClosed);
        }

        Ok(stream)
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<Stream, Error> {
        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(Error::SessionClosed),
            res = self.accept_rx.recv_async() => res.map_err(|_| Error::SessionClosed),
        }
    }

    /// Close the session, invalidating all child streams.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

async fn run_send_loop<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            maybe = frame_rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(err) = writer.write_all(&frame.encode()).await {
            debug!("mux send loop failed: {err}");
            closed.cancel();
            break;
        }
        if let Err(err) = writer.flush().await {
            debug!("mux send loop failed to flush: {err}");
            closed.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn run_recv_loop<R>(
    mut reader: tokio::io::ReadHalf<R>,
    shared: Arc<Shared>,
    accept_tx: flume::Sender<Stream>,
    remote_parity: u32,
) where
    R: AsyncRead + Send + 'static,
{
    tokio::select! {
        _ = shared.closed.cancelled() => {}
        res = recv_frames(&mut reader, &shared, &accept_tx, remote_parity) => {
            match res {
                Ok(()) => trace!("mux transport reached end of stream"),
                Err(Error::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!("mux transport closed by peer");
                }
                Err(err) => debug!("mux receive loop failed: {err}"),
            }
        }
    }

    shared.teardown();
}

async fn recv_frames<R>(
    reader: &mut tokio::io::ReadHalf<R>,
    shared: &Arc<Shared>,
    accept_tx: &flume::Sender<Stream>,
    remote_parity: u32,
) -> Result<(), Error>
where
    R: AsyncRead + Send + 'static,
{
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        reader.read_exact(&mut header_buf).await?;
        let header = Header::decode(&header_buf)?;

        let payload = if header.length > 0 {
            let mut buf = vec![0u8; header.length as usize];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };
        let frame = Frame { header, payload };

        match header.command {
            Command::Syn => {
                if header.stream_id % 2 != remote_parity {
                    return Err(Error::Protocol("syn with local stream id parity"));
                }
                let exists = shared
                    .streams
                    .lock()
                    .expect("mux stream registry poisoned")
                    .contains_key(&header.stream_id);
                if exists {
                    return Err(Error::Protocol("syn for an already open stream"));
                }

                let stream = shared.create_stream(header.stream_id);
                if accept_tx.try_send(stream).is_err() {
                    // Dropping the rejected stream sends the Fin.
                    warn!(
                        stream_id = header.stream_id,
                        "mux accept backlog full, refusing stream"
                    );
                }
            }
            Command::Psh => {
                let mut overran = false;
                {
                    let streams =
                        shared.streams.lock().expect("mux stream registry poisoned");
                    if let Some(handle) = streams.get(&header.stream_id) {
                        let inflight = handle
                            .inflight
                            .fetch_add(frame.payload.len() as u32, Ordering::AcqRel)
                            + frame.payload.len() as u32;

                        if inflight > shared.config.recv_window {
                            overran = true;
                        } else {
                            // A send failure means the stream was just
                            // dropped locally; the payload is discarded.
                            let _ = handle.data_tx.send(frame.payload);
                        }
                    }
                }

                if overran {
                    warn!(
                        stream_id = header.stream_id,
                        "peer overran the receive window, resetting stream"
                    );
                    shared.remove_stream(header.stream_id);
                    let _ = shared
                        .frame_tx
                        .send(Frame::control(Command::Fin, header.stream_id));
                }
            }
            Command::Fin => {
                // Dropping the handle closes the reader's channel, which
                // reads as EOF once buffered data is drained. The local
                // write half stays usable.
                shared.remove_stream(header.stream_id);
            }
            Command::Upd => {
                let credit = frame.credit()?;
                let streams = shared.streams.lock().expect("mux stream registry poisoned");
                if let Some(handle) = streams.get(&header.stream_id) {
                    handle.credit.add(credit);
                }
            }
            Command::Nop => {}
        }
    }
}

async fn run_dropped_loop(shared: Arc<Shared>, mut dropped_rx: mpsc::UnboundedReceiver<u32>) {
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            maybe = dropped_rx.recv() => match maybe {
                Some(id) => shared.remove_stream(id),
                None => break,
            },
        }
    }
}

async fn run_keepalive_loop(shared: Arc<Shared>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = interval.tick() => {
                if shared.frame_tx.send(Frame::control(Command::Nop, 0)).is_err() {
                    break;
                }
            }
        }
    }
}
