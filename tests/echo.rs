//! End-to-end tests: a real socket, the server handshake and the echo session.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use smol::Task;
use wsframe::frame::{self, Frame, OpCode};
use wsframe::{handshake, mask, Config, Echo, Error, HandshakeError, ProtocolError, Session};

struct Client {
    stream: TcpStream,
    buffer: Vec<u8>,
    pending: VecDeque<Frame>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let early = handshake::client_handshake(&mut stream, &addr.to_string(), "/")
            .await
            .unwrap();
        Client::with_buffer(stream, early)
    }

    fn with_buffer(stream: TcpStream, buffer: Vec<u8>) -> Self {
        Client {
            stream,
            buffer,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, opcode: OpCode, payload: &[u8], fin: bool) {
        let wire = frame::build_masked(opcode, payload, fin, mask::random_key());
        self.stream.write_all(&wire).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next frame from the server, or `None` once it closes the stream.
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            let parsed = frame::parse(&self.buffer).unwrap();
            self.pending.extend(parsed.frames);
            self.buffer = parsed.remainder.to_vec();
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// How an in-memory stream treats writes.
#[derive(Clone, Copy)]
enum Writes {
    Accept,
    Fail,
    Stall,
}

/// What an in-memory stream saw, shared with the test after the session
/// takes ownership of the stream.
struct Wire {
    input: Cursor<Vec<u8>>,
    writes: Writes,
    written: Vec<u8>,
    write_attempts: usize,
    closed: bool,
}

/// An in-memory stream that reads scripted input.
#[derive(Clone)]
struct ScriptedStream(Rc<RefCell<Wire>>);

impl ScriptedStream {
    fn new(input: Vec<u8>, writes: Writes) -> Self {
        ScriptedStream(Rc::new(RefCell::new(Wire {
            input: Cursor::new(input),
            writes,
            written: Vec::new(),
            write_attempts: 0,
            closed: false,
        })))
    }

    fn consumed(&self) -> u64 {
        self.0.borrow().input.position()
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.0.borrow_mut().input.read(buf))
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut wire = self.0.borrow_mut();
        wire.write_attempts += 1;
        match wire.writes {
            Writes::Accept => {
                wire.written.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Writes::Fail => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Writes::Stall => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.borrow_mut().closed = true;
        Poll::Ready(Ok(()))
    }
}

async fn start(config: Config) -> (SocketAddr, Task<wsframe::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = smol::spawn(async move {
        let (stream, _) = listener.accept().await?;
        Session::accept(stream, config, Echo).await?.run().await
    });
    (addr, server)
}

#[test]
fn echoes_text() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        client.send(OpCode::Text, b"hello", true).await;
        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Text, b"hello".to_vec()))
        );

        client.send(OpCode::Text, &[b'a'; 200], true).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.opcode, OpCode::Text);
        assert_eq!(reply.payload, vec![b'a'; 200]);

        drop(client);
        server.await.unwrap();
    });
}

#[test]
fn echoes_large_binary() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.send(OpCode::Binary, &payload, true).await;
        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Binary, payload))
        );

        drop(client);
        server.await.unwrap();
    });
}

#[test]
fn answers_ping_with_pong() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        client.send(OpCode::Ping, b"ping", true).await;
        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Pong, b"ping".to_vec()))
        );

        drop(client);
        server.await.unwrap();
    });
}

#[test]
fn reassembles_fragments_around_ping() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        client.send(OpCode::Text, b"He", false).await;
        client.send(OpCode::Ping, b"x", true).await;
        client.send(OpCode::Continuation, b"ll", false).await;
        client.send(OpCode::Continuation, b"o", true).await;

        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Pong, b"x".to_vec()))
        );
        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Text, b"Hello".to_vec()))
        );

        drop(client);
        server.await.unwrap();
    });
}

#[test]
fn oversized_frame_closes_with_1002() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        client
            .send_raw(&[0x82, 0x7F, 0, 0, 0, 1, 0, 0, 0, 0])
            .await;

        let close = client.recv().await.unwrap();
        assert!(close.is_close());
        assert_eq!(close.close_code(), Some(1002));
        assert_eq!(client.recv().await, None);

        let err = server.await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
    });
}

#[test]
fn client_close_is_echoed() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut client = Client::connect(addr).await;

        let close = Frame::close(1000, "done");
        client.send(OpCode::Close, &close.payload, true).await;

        assert_eq!(client.recv().await, Some(close));
        assert_eq!(client.recv().await, None);
        server.await.unwrap();
    });
}

#[test]
fn server_initiated_close() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = smol::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let session = Session::accept(stream, Config::default(), Echo).await?;
            session.close(1001, "going away").await
        });
        let mut client = Client::connect(addr).await;

        let close = client.recv().await.unwrap();
        assert_eq!(close, Frame::close(1001, "going away"));

        client.send(OpCode::Close, &close.payload, true).await;
        assert_eq!(client.recv().await, None);
        server.await.unwrap();
    });
}

#[test]
fn frames_sent_with_the_request_are_processed() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut request = format!(
            "GET /chat HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
        .into_bytes();
        request.extend_from_slice(&frame::build_masked(OpCode::Text, b"early", true, [1, 2, 3, 4]));
        stream.write_all(&request).await.unwrap();

        let mut response = Vec::new();
        let head_end = loop {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "server closed during handshake");
            response.extend_from_slice(&chunk[..n]);
            if let Some(pos) = response.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&response[..head_end]).into_owned();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let mut client = Client::with_buffer(stream, response[head_end..].to_vec());
        assert_eq!(
            client.recv().await,
            Some(Frame::new(OpCode::Text, b"early".to_vec()))
        );

        drop(client);
        server.await.unwrap();
    });
}

#[test]
fn rejects_unsupported_version() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 8\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));

        let err = server.await.unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::UnsupportedVersion(ref version)) if version == "8"
        ));
    });
}

#[test]
fn idle_peer_hits_read_timeout() {
    smol::block_on(async {
        let config = Config::default().with_read_timeout(Duration::from_millis(50));
        let (addr, server) = start(config).await;
        let _client = Client::connect(addr).await;

        match server.await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected a timeout, got {other:?}"),
        }
    });
}

#[test]
fn rejects_request_without_upgrade_header() {
    smol::block_on(async {
        let (addr, server) = start(Config::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!response.contains("Sec-WebSocket-Version"));

        let err = server.await.unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::MissingHeader("Upgrade"))
        ));
    });
}

#[test]
fn rejects_head_that_is_not_utf8() {
    smol::block_on(async {
        let request = b"GET / HTTP/1.1\r\nX-Junk: \xff\xfe\r\n\r\n".to_vec();
        let stream = ScriptedStream::new(request, Writes::Accept);

        let err = Session::accept(stream.clone(), Config::default(), Echo)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Handshake(HandshakeError::Malformed)));
        let written = stream.0.borrow().written.clone();
        assert!(written.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    });
}

#[test]
fn endless_request_line_is_cut_off() {
    smol::block_on(async {
        let stream = ScriptedStream::new(vec![b'a'; 4 * 1024 * 1024], Writes::Accept);

        let err = Session::accept(stream.clone(), Config::default(), Echo)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Handshake(HandshakeError::Malformed)));
        assert!(stream.consumed() <= 64 * 1024, "read {} bytes", stream.consumed());
        let written = stream.0.borrow().written.clone();
        assert!(written.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    });
}

#[test]
fn write_failure_ends_session_without_close_frame() {
    smol::block_on(async {
        let mut input = frame::build_masked(OpCode::Text, b"hello", true, [1, 2, 3, 4]);
        input.extend_from_slice(&frame::build_masked(OpCode::Ping, b"p", true, [1, 2, 3, 4]));
        let stream = ScriptedStream::new(input, Writes::Fail);

        let err = Session::new(stream.clone(), Config::default(), Echo)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(ref err) if err.kind() == io::ErrorKind::BrokenPipe));
        let wire = stream.0.borrow();
        assert_eq!(wire.write_attempts, 1);
        assert!(wire.written.is_empty());
        assert!(!wire.closed);
    });
}

#[test]
fn stalled_write_hits_write_timeout() {
    smol::block_on(async {
        let input = frame::build_masked(OpCode::Text, b"hello", true, [1, 2, 3, 4]);
        let stream = ScriptedStream::new(input, Writes::Stall);
        let config = Config::default().with_write_timeout(Duration::from_millis(50));

        let err = Session::new(stream.clone(), config, Echo)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(ref err) if err.kind() == io::ErrorKind::TimedOut));
        assert!(!stream.0.borrow().closed);
    });
}
