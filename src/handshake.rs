//! WebSocket handshake implementation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use sha1::{Digest, Sha1};
use smol::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::{Error, HandshakeError, Result};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of an HTTP request or response head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Checks the upgrade request headers and returns the `Sec-WebSocket-Accept`
/// token for the response.
///
/// Header names match case-insensitively. `Upgrade` must be `websocket`,
/// `Connection` must list an `upgrade` token, `Sec-WebSocket-Key` must be
/// non-empty and `Sec-WebSocket-Version` must be `13`.
///
/// # Errors
///
/// Returns the first requirement the headers fail.
pub fn validate<K, V>(headers: &[(K, V)]) -> std::result::Result<String, HandshakeError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let upgrade = header(headers, "upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidUpgrade(upgrade.to_string()));
    }

    let connection =
        header(headers, "connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let key = header(headers, "sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    if key.is_empty() {
        return Err(HandshakeError::EmptyKey);
    }

    let version = header(headers, "sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    Ok(accept_key(key))
}

/// Computes `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Generates a random `Sec-WebSocket-Key` for a client request.
pub fn generate_key() -> String {
    let random_bytes: [u8; 16] = rand::thread_rng().gen();
    STANDARD.encode(random_bytes)
}

fn header<'a, K, V>(headers: &'a [(K, V)], name: &str) -> Option<&'a str>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers
        .iter()
        .find(|(key, _)| key.as_ref().trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_ref().trim())
}

/// Start line and headers of an HTTP/1.1 message, plus any bytes read past
/// the blank line that ends it.
struct Head {
    start_line: String,
    headers: Vec<(String, String)>,
    leftover: Vec<u8>,
}

/// Reads an HTTP/1.1 head, consuming at most `MAX_HEAD_LEN` bytes of it.
///
/// A head that is cut short, too long or not UTF-8 is
/// [`HandshakeError::Malformed`]; only transport failures are I/O errors.
async fn read_head<S>(stream: &mut S) -> Result<Head>
where
    S: AsyncRead + Unpin,
{
    let mut buf_reader = BufReader::new(stream);
    let mut start_line = String::new();
    let mut headers = Vec::new();
    let mut total = 0;

    loop {
        let mut raw = Vec::new();
        let budget = (MAX_HEAD_LEN - total) as u64;
        let n = (&mut buf_reader)
            .take(budget)
            .read_until(b'\n', &mut raw)
            .await?;
        total += n;
        if !raw.ends_with(b"\n") {
            return Err(HandshakeError::Malformed.into());
        }
        let line = std::str::from_utf8(&raw).map_err(|_| HandshakeError::Malformed)?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if start_line.is_empty() {
                continue;
            }
            break;
        }
        if start_line.is_empty() {
            start_line = line.to_string();
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Head {
        start_line,
        headers,
        leftover: buf_reader.buffer().to_vec(),
    })
}

/// Performs the server-side WebSocket handshake.
///
/// On success the `101 Switching Protocols` response has been written and the
/// bytes the client sent after its request head are returned; they belong to
/// the frame stream.
///
/// # Errors
///
/// Returns an error if reading or writing fails, or [`HandshakeError`] after
/// answering `400 Bad Request` to an invalid, malformed or oversized request.
pub async fn server_handshake<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, accepted) = match read_head(stream).await {
        Ok(head) => {
            let accepted = match head.start_line.split_whitespace().next() {
                Some("GET") => validate(&head.headers).map(|token| (token, head.leftover)),
                Some(method) => Err(HandshakeError::Method(method.to_string())),
                None => Err(HandshakeError::Malformed),
            };
            (head.start_line, accepted)
        }
        Err(Error::Handshake(err)) => (String::new(), Err(err)),
        Err(err) => return Err(err),
    };

    match accepted {
        Ok((token, leftover)) => {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                token
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            debug!(%request, "upgraded connection");
            Ok(leftover)
        }
        Err(err) => {
            warn!(%request, error = %err, "rejected upgrade request");
            let version_hint = match err {
                HandshakeError::UnsupportedVersion(_) => "Sec-WebSocket-Version: 13\r\n",
                _ => "",
            };
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 {}Connection: close\r\n\
                 Content-Length: 0\r\n\r\n",
                version_hint
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            Err(err.into())
        }
    }
}

/// Performs the client-side WebSocket handshake.
///
/// Returns any bytes the server sent after its response head.
///
/// # Errors
///
/// Returns an error if the handshake fails.
pub async fn client_handshake<S>(stream: &mut S, host: &str, path: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    );

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    if head.start_line.split_whitespace().nth(1) != Some("101") {
        return Err(HandshakeError::Rejected(head.start_line).into());
    }

    let accept = header(&head.headers, "sec-websocket-accept")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
    if accept != accept_key(&key) {
        return Err(HandshakeError::AcceptMismatch.into());
    }

    Ok(head.leftover)
}
