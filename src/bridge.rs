//! Bridge service: listener, session state machine, helper supervision
//!
//! One cooperative loop owns everything: it polls the listener for new
//! connections, checks helper liveness and applies restart policy, drains
//! helper stdout lines toward the client, polls the active client for
//! frames, and emits heartbeats. Every step is bounded by a short timeout
//! so no single peer can stall the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::helper::HelperProcess;
use crate::protocol::{self, SessionConfig, codes};
use crate::ring::AudioRing;
use crate::transport::{self, Opcode, WsConnection};
use crate::{Error, Result};

/// How long one accept poll waits for a new connection
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// How long one client poll waits for a frame
const CLIENT_POLL: Duration = Duration::from_millis(50);

/// Heartbeat cadence toward both the helper and the client
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A helper that reports running but produces no lines for this long is
/// treated as wedged and force-stopped
const HELPER_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Response sent to connections arriving while a client is already active
const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 409 Conflict\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Cooperative shutdown signal shared between the service loop and the
/// signal handler
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The voicebridge daemon: control listener, helper, and audio rings
pub struct BridgeService {
    config: Config,
    shutdown: Shutdown,
    listener: TcpListener,
    mic_feed: AudioRing,
    speaker_tap: AudioRing,
    helper: HelperProcess,
    helper_lines: Option<mpsc::Receiver<String>>,
    client: Option<WsConnection<TcpStream>>,
    session: Option<SessionConfig>,
    restarts_left: u32,
    last_helper_activity: Instant,
    last_heartbeat: Instant,
}

impl BridgeService {
    /// Bind the control listener and initialize both shared-memory rings.
    ///
    /// The bridge is the sole ring initializer; the helper and the audio
    /// driver attach to the rings it creates.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound or a ring
    /// cannot be created.
    pub async fn bind(config: Config, shutdown: Shutdown) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            Error::Config(format!("cannot bind {}: {e}", config.listen_addr))
        })?;

        let mut mic_feed = AudioRing::new();
        mic_feed.open(
            &config.rings.mic_feed,
            true,
            config.audio.channels,
            config.audio.ring_capacity_frames,
        )?;
        let mut speaker_tap = AudioRing::new();
        speaker_tap.open(
            &config.rings.speaker_tap,
            true,
            config.audio.channels,
            config.audio.ring_capacity_frames,
        )?;
        tracing::debug!(
            mic_feed = ?mic_feed.path(),
            speaker_tap = ?speaker_tap.path(),
            "audio rings created"
        );

        let restarts_left = config.restart_budget;
        Ok(Self {
            config,
            shutdown,
            listener,
            mic_feed,
            speaker_tap,
            helper: HelperProcess::new(),
            helper_lines: None,
            client: None,
            session: None,
            restarts_left,
            last_helper_activity: Instant::now(),
            last_heartbeat: Instant::now(),
        })
    }

    /// Address the control listener actually bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the service loop until shutdown is requested or the restart
    /// budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal conditions: the helper executable
    /// cannot be spawned.
    pub async fn run(&mut self) -> Result<()> {
        self.start_helper().await?;
        tracing::info!(
            listen = %self.config.listen_addr,
            helper = %self.config.helper_path.display(),
            "bridge running"
        );

        while !self.shutdown.is_requested() {
            if !self.check_helper().await? {
                break;
            }
            self.poll_accept().await;
            self.drain_helper_lines().await;
            self.poll_client().await;
            self.tick_heartbeats().await;
        }

        self.teardown().await;
        Ok(())
    }

    /// Spawn the helper and push its engine configuration line
    async fn start_helper(&mut self) -> Result<()> {
        let lines = self.helper.start(&self.config.helper_path)?;
        self.helper_lines = Some(lines);
        self.last_helper_activity = Instant::now();
        if let Err(e) = self
            .helper
            .send_line(&protocol::engine_config_line(&self.config))
            .await
        {
            tracing::warn!("engine_config delivery failed: {e}");
        }
        Ok(())
    }

    /// Liveness check and restart policy. Returns `false` when the restart
    /// budget is exhausted and the loop should end.
    async fn check_helper(&mut self) -> Result<bool> {
        if self.helper.is_running() {
            if self.last_helper_activity.elapsed() > HELPER_STALL_TIMEOUT {
                tracing::warn!(
                    pid = self.helper.pid(),
                    "helper silent for {}s, force-stopping",
                    HELPER_STALL_TIMEOUT.as_secs()
                );
                self.helper.stop().await;
            }
            return Ok(true);
        }

        let exit_code = self.helper.exit_code();
        if self.restarts_left == 0 {
            tracing::error!(exit_code, "helper exited, restart budget exhausted");
            self.send_to_client(&protocol::error_line(
                codes::HELPER_EXITED,
                &format!("helper exited with code {exit_code}"),
            ))
            .await;
            return Ok(false);
        }

        self.restarts_left -= 1;
        tracing::warn!(
            exit_code,
            restarts_left = self.restarts_left,
            "helper exited, restarting"
        );
        self.helper.stop().await;
        self.start_helper().await?;
        if let Some(session) = self.session {
            if let Err(e) = self
                .helper
                .send_line(&protocol::session_config_line(&session))
                .await
            {
                tracing::warn!("session_config redelivery failed: {e}");
            }
        }
        Ok(true)
    }

    /// Accept at most one pending connection: upgrade it when no client is
    /// active, reject it with 409 otherwise
    async fn poll_accept(&mut self) {
        let accepted = tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await;
        let Ok(result) = accepted else {
            return;
        };
        let (stream, peer) = match result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                return;
            }
        };

        if self.client.is_some() {
            tracing::info!(%peer, "rejecting second client");
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(BUSY_RESPONSE).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        match transport::accept(stream).await {
            Ok(mut conn) => {
                if let Err(e) = conn.send_text(&protocol::ready_line()).await {
                    tracing::warn!(%peer, "ready greeting failed: {e}");
                    return;
                }
                tracing::info!(%peer, "client connected");
                self.client = Some(conn);
                self.session = None;
            }
            Err(e) => {
                tracing::warn!(%peer, "handshake failed: {e}");
            }
        }
    }

    /// Relay queued helper lines to the active client
    async fn drain_helper_lines(&mut self) {
        let mut lines = Vec::new();
        if let Some(rx) = self.helper_lines.as_mut() {
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }
        if lines.is_empty() {
            return;
        }
        self.last_helper_activity = Instant::now();
        for line in lines {
            // Dropped silently when no client is connected.
            self.send_to_client(&line).await;
        }
    }

    /// Poll the active client for one frame
    async fn poll_client(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        match client.read_frame(CLIENT_POLL).await {
            Ok(None) => {}
            Ok(Some(frame)) => self.handle_client_frame(frame.opcode, frame.payload).await,
            Err(e) => {
                tracing::info!("client read failed: {e}");
                self.drop_client().await;
            }
        }
    }

    async fn handle_client_frame(&mut self, opcode: Opcode, payload: Vec<u8>) {
        match opcode {
            Opcode::Ping => {
                let failed = match self.client.as_mut() {
                    Some(client) => client.send_pong(&payload).await.is_err(),
                    None => false,
                };
                if failed {
                    tracing::info!("pong send failed");
                    self.drop_client().await;
                }
            }
            Opcode::Close => {
                tracing::info!("client sent close");
                self.drop_client().await;
            }
            Opcode::Text => match serde_json::from_slice::<Value>(&payload) {
                Ok(value) => self.handle_client_message(value).await,
                Err(e) => {
                    self.send_to_client(&protocol::error_line(
                        codes::INVALID_JSON,
                        &format!("malformed message: {e}"),
                    ))
                    .await;
                }
            },
            // The session protocol only acts on text.
            Opcode::Binary | Opcode::Continuation | Opcode::Pong => {}
        }
    }

    async fn handle_client_message(&mut self, mut value: Value) {
        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match msg_type.as_str() {
            "ping" => {
                let line = protocol::pong_line(value.get("id"));
                self.send_to_client(&line).await;
            }
            "configure_session" => self.configure_session(&value).await,
            _ if protocol::is_forwarded(&msg_type) => {
                if self.session.is_none() {
                    self.send_to_client(&protocol::error_line(
                        codes::SESSION_NOT_CONFIGURED,
                        &format!("{msg_type} requires a configured session"),
                    ))
                    .await;
                    return;
                }
                if msg_type == "start_stt" && value.get("language").is_none() {
                    value["language"] = Value::String(self.config.default_language.clone());
                }
                self.forward_to_helper(&value.to_string()).await;
            }
            _ => {
                // Before configuration every unexpected type reads as the
                // same state problem.
                let (code, detail) = if self.session.is_none() {
                    (
                        codes::SESSION_NOT_CONFIGURED,
                        format!("{msg_type:?} requires a configured session"),
                    )
                } else {
                    (
                        codes::UNKNOWN_MESSAGE_TYPE,
                        format!("unrecognized message type {msg_type:?}"),
                    )
                };
                self.send_to_client(&protocol::error_line(code, &detail)).await;
            }
        }
    }

    async fn configure_session(&mut self, value: &Value) {
        let session = match SessionConfig::from_value(value) {
            Ok(session) => session,
            Err(rejection) => {
                self.send_to_client(&protocol::error_line(rejection.code, &rejection.message))
                    .await;
                return;
            }
        };
        if session.mode.needs_api_key() && !self.config.has_elevenlabs_key() {
            self.send_to_client(&protocol::error_line(
                codes::MISSING_API_KEY,
                "elevenlabs mode requires ELEVENLABS_API_KEY",
            ))
            .await;
            return;
        }

        self.session = Some(session);
        // Best effort; the restart path re-pushes the session line.
        if let Err(e) = self
            .helper
            .send_line(&protocol::session_config_line(&session))
            .await
        {
            tracing::warn!("session_config delivery failed: {e}");
        }
        tracing::info!(mode = session.mode.as_str(), "session configured");
        self.send_to_client(&protocol::session_config_applied_line(&session))
            .await;
    }

    async fn forward_to_helper(&mut self, line: &str) {
        if let Err(e) = self.helper.send_line(line).await {
            tracing::warn!("helper forward failed: {e}");
            self.send_to_client(&protocol::error_line(
                codes::HELPER_UNAVAILABLE,
                "helper is not running, command dropped",
            ))
            .await;
        }
    }

    /// Periodic liveness lines to both peers
    async fn tick_heartbeats(&mut self) {
        if self.last_heartbeat.elapsed() < HEARTBEAT_INTERVAL {
            return;
        }
        self.last_heartbeat = Instant::now();
        let line = protocol::heartbeat_line();
        if self.helper.is_running()
            && let Err(e) = self.helper.send_line(&line).await
        {
            tracing::warn!("helper heartbeat failed: {e}");
        }
        self.send_to_client(&line).await;
    }

    /// Send a text frame to the active client, dropping the connection on
    /// failure. A no-op when no client is connected.
    async fn send_to_client(&mut self, line: &str) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if let Err(e) = client.send_text(line).await {
            tracing::info!("client send failed: {e}");
            self.drop_client().await;
        }
    }

    /// Close and forget the active client; its session dies with it
    async fn drop_client(&mut self) {
        if let Some(mut client) = self.client.take() {
            let _ = client.send_close().await;
            tracing::info!("client disconnected");
        }
        self.session = None;
    }

    /// Ordered teardown: client first, then helper, then the rings
    async fn teardown(&mut self) {
        tracing::info!("bridge stopping");
        self.drop_client().await;
        self.helper.stop().await;
        self.helper_lines = None;
        self.mic_feed.close();
        self.speaker_tap.close();
    }
}
