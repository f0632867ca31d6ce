//! Minimal RFC 6455 client used as the only transport to the control server.

mod frame;
mod handshake;

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tracing::{debug, warn};

pub use frame::{encode, read_frame, OpCode};
pub use handshake::{build_request, generate_key, open_transport, read_response, WsUrl};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid websocket url `{0}`")]
    InvalidUrl(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("payload of {0} bytes exceeds the message limit")]
    TooLarge(u64),
    #[error("text message is not valid utf-8")]
    InvalidUtf8,
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("websocket is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

pub struct WebSocketClient<S> {
    sender: WsSender<S>,
    receiver: WsReceiver<S>,
}

impl WebSocketClient<BoxedTransport> {
    pub async fn connect(
        url: &str,
        headers: &[(String, String)],
        max_message: usize,
    ) -> Result<Self, WsError> {
        let url: WsUrl = url.parse()?;
        debug!(%url, "websocket connecting");
        let transport = open_transport(&url).await?;
        Self::handshake(transport, &url, headers, max_message).await
    }
}

impl<S> WebSocketClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn handshake(
        mut stream: S,
        url: &WsUrl,
        headers: &[(String, String)],
        max_message: usize,
    ) -> Result<Self, WsError> {
        let request = build_request(url, &generate_key(), headers);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        read_response(&mut reader).await?;
        debug!(%url, "websocket upgraded");
        Ok(Self::from_upgraded(reader, max_message))
    }

    /// Wraps a stream whose HTTP upgrade has already completed. Bytes still
    /// buffered in `reader` are treated as frame data.
    pub fn from_upgraded(reader: BufReader<S>, max_message: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(reader);
        let sender = WsSender {
            writer: Arc::new(Mutex::new(write_half)),
            open: Arc::new(AtomicBool::new(true)),
        };
        let receiver = WsReceiver {
            reader: read_half,
            sender: sender.clone(),
            max_message,
            partial: None,
        };
        Self { sender, receiver }
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub async fn send(&self, message: Message) -> Result<(), WsError> {
        self.sender.send(message).await
    }

    pub async fn receive(&mut self) -> Result<Option<Message>, WsError> {
        self.receiver.receive().await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        self.sender.close(code, reason).await
    }

    pub fn split(self) -> (WsSender<S>, WsReceiver<S>) {
        (self.sender, self.receiver)
    }
}

/// Write side of a client. Cloneable so the receive loop can answer pings
/// while another task sends data.
pub struct WsSender<S> {
    writer: Arc<Mutex<WriteHalf<BufReader<S>>>>,
    open: Arc<AtomicBool>,
}

impl<S> Clone for WsSender<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            open: Arc::clone(&self.open),
        }
    }
}

impl<S> WsSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn send(&self, message: Message) -> Result<(), WsError> {
        match message {
            Message::Text(text) => self.send_frame(OpCode::Text, text.as_bytes()).await,
            Message::Binary(bytes) => self.send_frame(OpCode::Binary, &bytes).await,
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    async fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        if !self.is_open() {
            return Err(WsError::Closed);
        }
        let bytes = encode(true, opcode, payload, Some(rand::random()));
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sends a close frame once and shuts the write side down. Later calls
    /// are no-ops.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        let bytes = encode(true, OpCode::Close, &payload, Some(rand::random()));

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        if let Err(err) = writer.shutdown().await {
            debug!("websocket shutdown: {err}");
        }
        Ok(())
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

pub struct WsReceiver<S> {
    reader: ReadHalf<BufReader<S>>,
    sender: WsSender<S>,
    max_message: usize,
    partial: Option<(OpCode, Vec<u8>)>,
}

impl<S> WsReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Next complete data message. `Ok(None)` means the connection closed,
    /// either by a close frame, end of stream, or an over-limit message.
    /// Pings are answered here and never surface.
    pub async fn receive(&mut self) -> Result<Option<Message>, WsError> {
        loop {
            let frame = match read_frame(&mut self.reader, self.max_message).await {
                Ok(frame) => frame,
                Err(WsError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("websocket stream ended");
                    self.sender.mark_closed();
                    return Ok(None);
                }
                Err(WsError::TooLarge(length)) => return self.close_too_big(length).await,
                Err(err) => return Err(err),
            };

            match frame.opcode {
                OpCode::Ping => {
                    self.sender.send_frame(OpCode::Pong, &frame.payload).await?;
                    continue;
                }
                OpCode::Pong => continue,
                OpCode::Close => {
                    debug!("websocket close frame received");
                    self.sender.close(CLOSE_NORMAL, "").await?;
                    return Ok(None);
                }
                OpCode::Continuation => {
                    let Some((_, buffer)) = self.partial.as_mut() else {
                        return Err(WsError::Malformed("continuation without a first frame"));
                    };
                    if buffer.len() + frame.payload.len() > self.max_message {
                        let length = (buffer.len() + frame.payload.len()) as u64;
                        self.partial = None;
                        return self.close_too_big(length).await;
                    }
                    buffer.extend_from_slice(&frame.payload);
                }
                OpCode::Text | OpCode::Binary => {
                    self.partial = Some((frame.opcode, frame.payload));
                }
            }

            if frame.fin {
                if let Some((opcode, buffer)) = self.partial.take() {
                    return decode_message(opcode, buffer).map(Some);
                }
            }
        }
    }

    async fn close_too_big(&mut self, length: u64) -> Result<Option<Message>, WsError> {
        warn!(length, limit = self.max_message, "websocket message too big");
        self.sender.close(CLOSE_TOO_BIG, "message too big").await?;
        Ok(None)
    }
}

fn decode_message(opcode: OpCode, buffer: Vec<u8>) -> Result<Message, WsError> {
    match opcode {
        OpCode::Text => String::from_utf8(buffer)
            .map(Message::Text)
            .map_err(|_| WsError::InvalidUtf8),
        _ => Ok(Message::Binary(buffer)),
    }
}
