//! Per-connection protocol state machine.
//!
//! [`ConnectionState`] is the synchronous core: it takes the bytes of one
//! socket read, decodes them, reassembles fragmented messages, answers
//! control frames and appends every reply to an output buffer. [`Session`]
//! wraps it around an async stream and owns the read/write loop.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::Timer;
use tracing::{debug, trace, warn};

use crate::frame::{self, Frame, OpCode};
use crate::handshake::server_handshake;
use crate::{Config, Error, ProtocolError, Result};

const PROTOCOL_ERROR_REASON: &str = "protocol error";

/// A complete, reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text payload. The bytes are passed through without UTF-8 validation.
    Text(Vec<u8>),
    /// Binary payload.
    Binary(Vec<u8>),
}

impl Message {
    /// The opcode this message is sent with.
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// The message bytes, reassembled across fragments.
    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Text(payload) | Message::Binary(payload) => payload,
        }
    }

    fn payload_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Message::Text(payload) | Message::Binary(payload) => payload,
        }
    }
}

/// Application logic fed with every complete message.
pub trait Handler {
    /// Handles one message; a returned message is sent back as a single frame.
    fn on_message(&mut self, message: Message) -> Option<Message>;
}

/// Sends every message back unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Handler for Echo {
    fn on_message(&mut self, message: Message) -> Option<Message> {
        match &message {
            Message::Text(payload) => {
                debug!(text = %String::from_utf8_lossy(payload), "echoing text message");
            }
            Message::Binary(payload) => debug!(len = payload.len(), "echoing binary message"),
        }
        Some(message)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Frames flow in both directions.
    Open,
    /// We sent a Close frame and are waiting for the peer's.
    Closing,
    /// Terminal; nothing more is read or written.
    Closed,
}

/// Mutable protocol state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    receive_buffer: BytesMut,
    /// The message being reassembled; its variant is the fragment opcode.
    fragment: Option<Message>,
    phase: Phase,
    reject_reserved_bits: bool,
    require_masked_frames: bool,
}

impl ConnectionState {
    /// Fresh state for a connection that has just been upgraded.
    pub fn new(config: &Config) -> Self {
        ConnectionState {
            receive_buffer: BytesMut::with_capacity(config.read_buffer_size),
            fragment: None,
            phase: Phase::Open,
            reject_reserved_bits: config.reject_reserved_bits,
            require_masked_frames: config.require_masked_frames,
        }
    }

    /// Where the connection is in its lifecycle.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bytes of an incomplete frame held back from the last read.
    pub fn buffered(&self) -> usize {
        self.receive_buffer.len()
    }

    /// Whether a fragmented message is being reassembled.
    pub fn is_fragmenting(&self) -> bool {
        self.fragment.is_some()
    }

    /// Processes the bytes of one read and appends the wire bytes of every
    /// reply, in decode order, to `out`.
    ///
    /// Frames after a Close are not processed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a framing violation. `out` then ends with
    /// a `Close(1002)` frame and the state is [`Phase::Closed`].
    pub fn receive<H>(&mut self, chunk: &[u8], handler: &mut H, out: &mut Vec<u8>) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        self.receive_buffer.extend_from_slice(chunk);

        let parsed = frame::parse(&self.receive_buffer)
            .map(|parsed| (parsed.frames, parsed.remainder.len()));
        let (frames, remaining) = match parsed {
            Ok(parsed) => parsed,
            Err(Error::Protocol(err)) => return Err(self.fail(err, out)),
            Err(err) => return Err(err),
        };
        let consumed = self.receive_buffer.len() - remaining;
        self.receive_buffer.advance(consumed);

        for frame in frames {
            if self.phase == Phase::Closed {
                break;
            }
            if let Err(err) = self.dispatch(frame, handler, out) {
                return Err(self.fail(err, out));
            }
        }
        Ok(())
    }

    /// Starts a server-initiated close.
    pub fn initiate_close(&mut self, code: u16, reason: &str, out: &mut Vec<u8>) {
        if self.phase != Phase::Open {
            return;
        }
        out.extend_from_slice(&Frame::close(code, reason).to_bytes());
        self.fragment = None;
        self.phase = Phase::Closing;
    }

    fn dispatch<H>(
        &mut self,
        frame: Frame,
        handler: &mut H,
        out: &mut Vec<u8>,
    ) -> std::result::Result<(), ProtocolError>
    where
        H: Handler + ?Sized,
    {
        if self.reject_reserved_bits && frame.rsv != 0 {
            return Err(ProtocolError::ReservedBits(frame.rsv));
        }
        if self.require_masked_frames && !frame.masked {
            return Err(ProtocolError::UnmaskedFrame);
        }

        if self.phase == Phase::Closing {
            if frame.is_close() {
                debug!(code = ?frame.close_code(), "close handshake completed");
                self.close();
            } else {
                trace!(opcode = ?frame.opcode, "discarding frame while closing");
            }
            return Ok(());
        }

        match frame.opcode {
            OpCode::Text => {
                self.start_message(Message::Text(frame.payload), frame.fin, handler, out);
            }
            OpCode::Binary => {
                self.start_message(Message::Binary(frame.payload), frame.fin, handler, out);
            }
            OpCode::Continuation => {
                let Some(message) = self.fragment.as_mut() else {
                    return Err(ProtocolError::ContinuationWithoutStart);
                };
                message.payload_mut().extend_from_slice(&frame.payload);
                if frame.fin {
                    if let Some(message) = self.fragment.take() {
                        deliver(message, handler, out);
                    }
                }
            }
            OpCode::Ping => {
                trace!(len = frame.payload.len(), "answering ping");
                out.extend_from_slice(&frame::build(OpCode::Pong, &frame.payload, true));
            }
            OpCode::Pong => trace!(len = frame.payload.len(), "pong received"),
            OpCode::Close => {
                debug!(code = ?frame.close_code(), "peer closed the connection");
                out.extend_from_slice(&frame::build(OpCode::Close, &frame.payload, true));
                self.close();
            }
            OpCode::Reserved(value) => trace!(opcode = value, "ignoring reserved opcode"),
        }
        Ok(())
    }

    /// Delivers an unfragmented message, or begins reassembling a
    /// fragmented one in place of any message already in progress.
    fn start_message<H>(&mut self, message: Message, fin: bool, handler: &mut H, out: &mut Vec<u8>)
    where
        H: Handler + ?Sized,
    {
        if fin {
            deliver(message, handler, out);
        } else {
            self.fragment = Some(message);
        }
    }

    fn fail(&mut self, err: ProtocolError, out: &mut Vec<u8>) -> Error {
        warn!(error = %err, "protocol violation, closing connection");
        // Once our Close is out, nothing else may follow it.
        if self.phase == Phase::Open {
            out.extend_from_slice(
                &Frame::close(err.close_code(), PROTOCOL_ERROR_REASON).to_bytes(),
            );
        }
        self.close();
        err.into()
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
        self.fragment = None;
        self.receive_buffer.clear();
    }
}

fn deliver<H>(message: Message, handler: &mut H, out: &mut Vec<u8>)
where
    H: Handler + ?Sized,
{
    if let Some(reply) = handler.on_message(message) {
        out.extend_from_slice(&frame::build(reply.opcode(), reply.payload(), true));
    }
}

/// A WebSocket connection driven over an async byte stream.
pub struct Session<S, H = Echo> {
    stream: S,
    config: Config,
    state: ConnectionState,
    handler: H,
}

impl<S, H> Session<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    /// Creates a session on a stream that has already been upgraded.
    pub fn new(stream: S, config: Config, handler: H) -> Self {
        let state = ConnectionState::new(&config);
        Session {
            stream,
            config,
            state,
            handler,
        }
    }

    /// Performs the server handshake on `stream` and creates a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn accept(mut stream: S, config: Config, handler: H) -> Result<Self> {
        let early = server_handshake(&mut stream).await?;
        let mut session = Self::new(stream, config, handler);
        session.state.receive_buffer.extend_from_slice(&early);
        Ok(session)
    }

    /// Protocol state of this connection.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Runs the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the peer violated the protocol (after
    /// telling it so with a close frame), or [`Error::Io`] if reading or
    /// writing failed. End of stream and a completed close are `Ok`.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.shutdown(&result).await;
        result
    }

    /// Sends a Close frame and waits for the peer to answer it.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the close frame or reading the reply fails.
    pub async fn close(mut self, code: u16, reason: &str) -> Result<()> {
        let mut out = Vec::new();
        self.state.initiate_close(code, reason, &mut out);
        let result = match self.write(&out).await {
            Ok(()) => self.drive().await,
            Err(err) => Err(err),
        };
        self.shutdown(&result).await;
        result
    }

    async fn drive(&mut self) -> Result<()> {
        if self.state.buffered() > 0 {
            self.process(&[]).await?;
        }

        let mut read_buf = vec![0u8; self.config.read_buffer_size];
        while self.state.phase() != Phase::Closed {
            let n = self.read(&mut read_buf).await?;
            if n == 0 {
                debug!("peer closed the stream");
                return Ok(());
            }
            self.process(&read_buf[..n]).await?;
        }
        Ok(())
    }

    async fn process(&mut self, chunk: &[u8]) -> Result<()> {
        let mut out = Vec::new();
        let received = self.state.receive(chunk, &mut self.handler, &mut out);
        if !out.is_empty() {
            self.write(&out).await?;
        }
        received
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        deadline(self.config.read_timeout, self.stream.read(buf))
            .await
            .map_err(|err| {
                warn!(error = %err, "read failed");
                Error::from(err)
            })
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        deadline(self.config.write_timeout, write)
            .await
            .map_err(|err| {
                warn!(error = %err, "write failed");
                Error::from(err)
            })
    }

    async fn shutdown(&mut self, result: &Result<()>) {
        self.state.close();
        // A failed socket gets no further I/O; it is released on drop.
        if matches!(result, Err(Error::Io(_))) {
            return;
        }
        if let Err(err) = self.stream.close().await {
            trace!(error = %err, "error closing stream");
        }
    }
}

async fn deadline<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        None => fut.await,
        Some(limit) => {
            let expired = async move {
                Timer::after(limit).await;
                Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"))
            };
            smol::future::or(fut, expired).await
        }
    }
}
