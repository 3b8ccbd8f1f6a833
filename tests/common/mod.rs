//! Shared test utilities

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use voicebridge::{BridgeService, Config, Result, Shutdown, WsConnection};
use voicebridge::transport::Opcode;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

fn unique_tag() -> String {
    format!(
        "{}_{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    )
}

/// Write an executable shell script acting as the helper
#[must_use]
pub fn write_helper_script(body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!("voicebridge-helper-{}.sh", unique_tag()));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write helper script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod helper script");
    path
}

/// Helper that echoes every stdin line back to stdout
#[must_use]
pub fn echo_helper() -> PathBuf {
    write_helper_script("exec cat")
}

/// Helper that echoes lines until one contains `die`, then exits nonzero
#[must_use]
pub fn dying_helper() -> PathBuf {
    write_helper_script(
        "while IFS= read -r line; do\n\
         case \"$line\" in *die*) exit 7;; esac\n\
         printf '%s\\n' \"$line\"\n\
         done",
    )
}

/// A running bridge under test
pub struct TestBridge {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<()>>,
}

/// Bind and run a bridge on an ephemeral port with unique ring names
pub async fn start_bridge(helper: PathBuf, mutate: impl FnOnce(&mut Config)) -> TestBridge {
    let tag = unique_tag();
    let mut config = Config::default();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.helper_path = helper;
    config.rings.mic_feed = format!("/vb_test_mic_{tag}");
    config.rings.speaker_tap = format!("/vb_test_tap_{tag}");
    config.audio.ring_capacity_frames = 1024;
    mutate(&mut config);

    let shutdown = Shutdown::new();
    let mut bridge = BridgeService::bind(config, shutdown.clone())
        .await
        .expect("failed to bind bridge");
    let addr = bridge.local_addr().expect("no local addr");
    let task = tokio::spawn(async move { bridge.run().await });
    TestBridge {
        addr,
        shutdown,
        task,
    }
}

/// Client side of the control connection
pub struct TestClient {
    conn: WsConnection<TcpStream>,
}

impl TestClient {
    /// Connect and complete the WebSocket upgrade
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect failed");
        let request = format!(
            "GET /control HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream
            .write_all(request.as_bytes())
            .await
            .expect("upgrade write failed");

        let (status, leftover) = read_http_response(&mut stream).await;
        assert!(
            status.starts_with("HTTP/1.1 101"),
            "unexpected upgrade response: {status}"
        );
        Self {
            conn: WsConnection::with_buffered(stream, leftover),
        }
    }

    /// Send one JSON text frame
    pub async fn send(&mut self, value: &Value) {
        self.conn
            .send_text(&value.to_string())
            .await
            .expect("send failed");
    }

    /// Send a raw text frame that need not be valid JSON
    pub async fn send_raw_text(&mut self, text: &str) {
        self.conn.send_text(text).await.expect("send failed");
    }

    /// Receive the next text frame whose `type` equals `msg_type`,
    /// skipping heartbeats and other relayed traffic
    pub async fn recv_type(&mut self, msg_type: &str) -> Value {
        self.recv_where(|v| v["type"] == msg_type).await
    }

    async fn recv_where(&mut self, accept: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a matching frame"
            );
            let Some(frame) = self
                .conn
                .read_frame(Duration::from_millis(250))
                .await
                .expect("read failed")
            else {
                continue;
            };
            if frame.opcode != Opcode::Text {
                continue;
            }
            let value: Value =
                serde_json::from_slice(&frame.payload).expect("frame is not JSON");
            if value["type"] == "heartbeat" {
                continue;
            }
            if accept(&value) {
                return value;
            }
        }
    }
}

/// Read an HTTP response's status line and headers; returns the status
/// line and any bytes received past the header terminator
pub async fn read_http_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let status = head.lines().next().unwrap_or("").to_string();
            return (status, buf[end + 4..].to_vec());
        }
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .expect("response read failed");
        if n == 0 {
            let head = String::from_utf8_lossy(&buf).to_string();
            let status = head.lines().next().unwrap_or("").to_string();
            return (status, Vec::new());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
