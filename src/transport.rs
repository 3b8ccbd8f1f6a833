//! WebSocket transport: HTTP upgrade handshake and frame codec
//!
//! Implemented directly over any `AsyncRead + AsyncWrite` byte stream so the
//! same codec serves real TCP connections and in-memory duplex pairs in
//! tests. The server side never masks outgoing frames; masked client frames
//! are unmasked on receipt. Bytes that arrive past a parse boundary (trailing
//! handshake data, partial frames) are preserved in a pending buffer and
//! drained before the socket is polled again.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::{Error, Result};

/// Fixed GUID appended to the client key when computing the accept token
const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request, headers included
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Wall-clock budget for completing the upgrade handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest accepted frame payload
pub const MAX_PAYLOAD_BYTES: u64 = 4 * 1024 * 1024;

/// WebSocket frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// One decoded WebSocket frame
#[derive(Debug)]
pub struct WireFrame {
    pub opcode: Opcode,
    pub fin: bool,
    pub payload: Vec<u8>,
}

/// An upgraded WebSocket connection over byte stream `S`
pub struct WsConnection<S> {
    stream: S,
    pending: Vec<u8>,
}

/// Compute the `Sec-WebSocket-Accept` token for a client key
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Perform the server side of the upgrade handshake.
///
/// Accumulates the request until the end-of-headers terminator, bounded by
/// [`MAX_HANDSHAKE_BYTES`] and [`HANDSHAKE_TIMEOUT`]; rejects non-GET
/// requests and requests without a `Sec-WebSocket-Key`. Bytes received past
/// the terminator are kept as buffered frame data.
///
/// # Errors
///
/// Returns an error on timeout, oversize, malformed request, or IO failure;
/// the caller drops the stream to reject the connection.
pub async fn accept<S>(mut stream: S) -> Result<WsConnection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buf: Vec<u8> = Vec::with_capacity(1024);

    let body_start = loop {
        // The header terminator must land within the request cap; anything
        // found past it, or a capful of bytes without one, is rejected.
        if let Some(end) = find_header_end(&buf) {
            if end > MAX_HANDSHAKE_BYTES {
                return Err(Error::Handshake(format!(
                    "request exceeds {MAX_HANDSHAKE_BYTES} bytes"
                )));
            }
            break end;
        }
        if buf.len() >= MAX_HANDSHAKE_BYTES {
            return Err(Error::Handshake(format!(
                "request exceeds {MAX_HANDSHAKE_BYTES} bytes"
            )));
        }
        let mut chunk = [0u8; 1024];
        let n = read_with_deadline(&mut stream, &mut chunk, deadline)
            .await?
            .ok_or_else(|| Error::Handshake("timed out waiting for request".to_string()))?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let request = std::str::from_utf8(&buf[..body_start])
        .map_err(|_| Error::Handshake("request is not valid UTF-8".to_string()))?;
    let (request_line, headers) = parse_request(request)?;

    if !request_line.starts_with("GET ") {
        return Err(Error::Handshake(format!(
            "expected GET request, got {:?}",
            request_line.split_whitespace().next().unwrap_or("")
        )));
    }

    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Key header".to_string()))?;
    let accept = accept_key(key);

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(WsConnection {
        stream,
        pending: buf[body_start..].to_vec(),
    })
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-upgraded stream (client side of a handshake done
    /// elsewhere, or a test duplex)
    pub fn new(stream: S) -> Self {
        Self::with_buffered(stream, Vec::new())
    }

    /// Wrap an already-upgraded stream along with bytes read past the end
    /// of the handshake response
    pub fn with_buffered(stream: S, pending: Vec<u8>) -> Self {
        Self { stream, pending }
    }

    /// Read the next complete frame, polling for at most `poll`.
    ///
    /// Returns `Ok(None)` when no complete frame arrived within the window;
    /// partially received bytes stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on a malformed frame, an oversize payload, a closed
    /// peer, or IO failure.
    pub async fn read_frame(&mut self, poll: Duration) -> Result<Option<WireFrame>> {
        let deadline = Instant::now() + poll;
        loop {
            if let Some(frame) = decode_frame(&mut self.pending)? {
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 4096];
            let Some(n) = read_with_deadline(&mut self.stream, &mut chunk, deadline).await? else {
                return Ok(None);
            };
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send a single unmasked frame (server-to-client frames are never
    /// masked)
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure.
    pub async fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let data = encode_frame(opcode, payload);
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a text frame
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.write_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Send a pong echoing a ping payload
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure.
    pub async fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(Opcode::Pong, payload).await
    }

    /// Send an empty close frame
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure.
    pub async fn send_close(&mut self) -> Result<()> {
        self.write_frame(Opcode::Close, &[]).await
    }
}

/// Encode one unmasked frame with the minimal length encoding
#[must_use]
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 10);
    push_header(&mut data, opcode, payload.len(), false);
    data.extend_from_slice(payload);
    data
}

/// Encode one masked frame, as a client would send it
#[must_use]
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 14);
    push_header(&mut data, opcode, payload.len(), true);
    data.extend_from_slice(&key);
    data.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4]),
    );
    data
}

fn push_header(data: &mut Vec<u8>, opcode: Opcode, len: usize, masked: bool) {
    let mask_bit = if masked { 0x80 } else { 0x00 };
    data.push(0x80 | opcode.to_wire());
    if len < 126 {
        data.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        data.push(mask_bit | 126);
        data.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        data.push(mask_bit | 127);
        data.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Try to decode one frame from the front of `buf`, consuming its bytes on
/// success. Returns `Ok(None)` when the buffer holds only a partial frame.
pub fn decode_frame(buf: &mut Vec<u8>) -> Result<Option<WireFrame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_wire(buf[0] & 0x0F)
        .ok_or_else(|| Error::Frame(format!("unsupported opcode 0x{:x}", buf[0] & 0x0F)))?;
    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7F;

    let (payload_len, mut offset): (u64, usize) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(Error::FrameTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset + payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[offset..total].to_vec();
    if let Some(key) = key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    buf.drain(..total);

    Ok(Some(WireFrame {
        opcode,
        fin,
        payload,
    }))
}

/// Index just past the `\r\n\r\n` terminator, if present
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Split an upgrade request into its request line and a lowercase-keyed
/// header map
fn parse_request(request: &str) -> Result<(&str, HashMap<String, String>)> {
    let mut lines = request.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Handshake("empty request".to_string()))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Handshake(format!("malformed header line {line:?}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok((request_line, headers))
}

/// One read bounded by an absolute deadline; `None` means the deadline
/// passed before any bytes arrived
async fn read_with_deadline<S: AsyncRead + Unpin>(
    stream: &mut S,
    chunk: &mut [u8],
    deadline: Instant,
) -> Result<Option<usize>> {
    let now = Instant::now();
    if now >= deadline {
        return Ok(None);
    }
    match tokio::time::timeout(deadline - now, stream.read(chunk)).await {
        Ok(res) => Ok(Some(res?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 6455 §1.3 sample handshake
    #[test]
    fn accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn frame_roundtrip_all_length_encodings() {
        for size in [0usize, 125, 126, 65_535, 65_536, 70_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut buf = encode_frame(Opcode::Binary, &payload);
            let frame = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(frame.opcode, Opcode::Binary);
            assert!(frame.fin);
            assert_eq!(frame.payload, payload, "size {size}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn masked_frame_is_unmasked() {
        let payload = b"hello bridge".to_vec();
        let mut buf = encode_masked_frame(Opcode::Text, &payload, [0xA1, 0x02, 0x33, 0x54]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let full = encode_frame(Opcode::Text, b"split across reads");
        let mut buf = full[..5].to_vec();
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&full[5..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"split across reads");
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut buf = encode_frame(Opcode::Text, b"first");
        buf.extend(encode_frame(Opcode::Text, b"second"));
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().payload, b"first");
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().payload, b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_payload_rejected() {
        // Header alone declares the length; no payload bytes needed.
        let mut buf = vec![0x82, 127];
        buf.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
        assert!(matches!(
            decode_frame(&mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn reserved_opcode_rejected() {
        let mut buf = vec![0x83, 0x00];
        assert!(matches!(decode_frame(&mut buf), Err(Error::Frame(_))));
    }

    fn upgrade_request(extra: &str) -> String {
        format!(
            "GET /control HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n{extra}"
        )
    }

    #[tokio::test]
    async fn handshake_upgrades_and_buffers_trailing_bytes() {
        let (mut client, server) = tokio::io::duplex(16 * 1024);

        // Request plus an early frame in the same packet.
        let mut bytes = upgrade_request("").into_bytes();
        bytes.extend(encode_masked_frame(Opcode::Text, b"early", [1, 2, 3, 4]));
        client.write_all(&bytes).await.unwrap();

        let mut conn = accept(server).await.unwrap();

        let mut response = vec![0u8; 1024];
        let n = client.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // The early frame must come out of the pending buffer.
        let frame = conn
            .read_frame(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, b"early");
    }

    #[tokio::test]
    async fn handshake_rejects_non_get() {
        let (mut client, server) = tokio::io::duplex(4096);
        let request = upgrade_request("").replacen("GET", "POST", 1);
        client.write_all(request.as_bytes()).await.unwrap();
        assert!(matches!(accept(server).await, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_rejects_missing_key() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(accept(server).await, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_header_names_are_case_insensitive() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  host: localhost\r\n\
                  SEC-WEBSOCKET-KEY: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        assert!(accept(server).await.is_ok());
    }

    #[tokio::test]
    async fn handshake_rejects_headers_ending_just_past_the_cap() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        // A complete, well-formed request whose terminator lands a few
        // hundred bytes past the cap still gets rejected.
        let padding = "X-Filler: ".to_string() + &"a".repeat(MAX_HANDSHAKE_BYTES) + "\r\n";
        let request = upgrade_request("").replace("Host: localhost\r\n", &padding);
        client.write_all(request.as_bytes()).await.unwrap();
        assert!(matches!(accept(server).await, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_rejects_oversize_request() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let padding = "X-Filler: ".to_string() + &"a".repeat(20 * 1024) + "\r\n";
        let request = upgrade_request("").replace("Host: localhost\r\n", &padding);
        client.write_all(request.as_bytes()).await.unwrap();
        assert!(matches!(accept(server).await, Err(Error::Handshake(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (client, server) = tokio::io::duplex(4096);
        // Hold the client open without ever completing the request.
        let accept_task = tokio::spawn(accept(server));
        tokio::time::advance(HANDSHAKE_TIMEOUT + Duration::from_secs(1)).await;
        let result = accept_task.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
        drop(client);
    }

    #[tokio::test]
    async fn read_frame_poll_timeout_returns_none() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut conn = WsConnection::new(server);
        let got = conn.read_frame(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn read_frame_preserves_partial_bytes_across_polls() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut conn = WsConnection::new(server);

        let full = encode_frame(Opcode::Text, b"slow frame");
        client.write_all(&full[..4]).await.unwrap();

        // First poll sees only a partial header+payload.
        assert!(
            conn.read_frame(Duration::from_millis(50))
                .await
                .unwrap()
                .is_none()
        );

        client.write_all(&full[4..]).await.unwrap();
        let frame = conn
            .read_frame(Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, b"slow frame");
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = WsConnection::new(server);
        drop(client);
        assert!(matches!(
            conn.read_frame(Duration::from_millis(50)).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn server_frames_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_conn = WsConnection::new(server);
        let mut client_conn = WsConnection::new(client);

        server_conn.send_text("{\"type\":\"ready\"}").await.unwrap();
        let frame = client_conn
            .read_frame(Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"{\"type\":\"ready\"}");
        assert!(frame.fin);
    }
}
