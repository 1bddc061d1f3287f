//! Client transports: newline-delimited TCP and WebSocket text frames.
//!
//! A transport splits into a message source, drained by a reader task
//! into the connection's request channel, and a message sink owned by
//! the serve loop, which keeps all writes serialised.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::Error;

pub(crate) trait Transport: Send + 'static {
    type Source: MessageSource;
    type Sink: MessageSink;

    fn split(self) -> (Self::Source, Self::Sink);
}

#[async_trait]
pub(crate) trait MessageSource: Send + 'static {
    /// The next inbound message, or `None` once the client hung up.
    async fn next_message(&mut self) -> Result<Option<String>, Error>;
}

#[async_trait]
pub(crate) trait MessageSink: Send + 'static {
    async fn send_message(&mut self, text: String) -> Result<(), Error>;
}

/// Plain TCP carrying one JSON-RPC message per line.
pub(crate) struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    type Source = LineSource;
    type Sink = LineSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (read_half, write_half) = self.stream.into_split();
        (
            LineSource {
                reader: BufReader::new(read_half),
                line: String::new(),
            },
            LineSink { writer: write_half },
        )
    }
}

pub(crate) struct LineSource {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

#[async_trait]
impl MessageSource for LineSource {
    async fn next_message(&mut self) -> Result<Option<String>, Error> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }

            let message = self.line.trim_end_matches(['\r', '\n']);
            if !message.is_empty() {
                return Ok(Some(message.to_owned()));
            }
        }
    }
}

pub(crate) struct LineSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl MessageSink for LineSink {
    async fn send_message(&mut self, text: String) -> Result<(), Error> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// WebSocket transport; each text frame carries one JSON-RPC message.
pub(crate) struct WsTransport {
    ws: WebSocketStream<TcpStream>,
}

impl WsTransport {
    pub(crate) fn new(ws: WebSocketStream<TcpStream>) -> Self {
        Self { ws }
    }
}

impl Transport for WsTransport {
    type Source = WsSource;
    type Sink = WsSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (sink, stream) = self.ws.split();
        (WsSource { stream }, WsSink { sink })
    }
}

pub(crate) struct WsSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next_message(&mut self) -> Result<Option<String>, Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                // Control frames are answered by the protocol layer;
                // binary frames are not part of this protocol.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

pub(crate) struct WsSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_message(&mut self, text: String) -> Result<(), Error> {
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }
}
