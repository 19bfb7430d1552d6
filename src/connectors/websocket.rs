//! WebSocket client for OKX v5 streams.
//!
//! Key requirements:
//! 1. Heartbeat: text `ping` every 20s, the server answers `pong`
//! 2. A missing `pong` or a closed socket fails the current pull
//! 3. Login (private channels) and subscribe happen before the first pull
//! 4. Reconnection is the caller's job: a failed socket is dropped

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::errors::ExchangeError;
use super::okx::error_from_code;

/// Default public WebSocket URL.
pub const PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Default private WebSocket URL.
pub const PRIVATE_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";

/// OKX drops idle connections after 30s.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Maximum time to wait for a pong on top of the heartbeat interval.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Path signed for WebSocket login.
const LOGIN_PATH: &str = "/users/self/verify";

/// One open OKX WebSocket connection.
pub struct OkxWebSocket {
    label: String,
    url: String,
    connection: WebSocketStream<MaybeTlsStream<TcpStream>>,
    heartbeat: Interval,
    last_pong: Instant,
}

impl OkxWebSocket {
    /// Establishes a WebSocket connection.
    ///
    /// `label` tags log lines, usually the symbol or `positions`.
    pub async fn connect(label: impl Into<String>, url: &str) -> Result<Self, ExchangeError> {
        let label = label.into();
        info!("[{}] Connecting to WebSocket: {}", label, url);

        let (connection, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ExchangeError::Network(format!("connection to {} timed out", url)))??;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; a fresh socket needs no ping yet.
        heartbeat.reset();

        debug!("[{}] WebSocket connected", label);
        Ok(Self {
            label,
            url: url.to_string(),
            connection,
            heartbeat,
            last_pong: Instant::now(),
        })
    }

    /// Authenticates the connection for private channels.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<(), ExchangeError> {
        let timestamp = Credentials::timestamp();
        let sign = credentials
            .sign(&timestamp, "GET", LOGIN_PATH, "")
            .map_err(|e| ExchangeError::Authentication(e.to_string()))?;

        let request = OpRequest {
            op: "login",
            args: vec![serde_json::json!({
                "apiKey": credentials.api_key,
                "passphrase": credentials.passphrase.clone().unwrap_or_default(),
                "timestamp": timestamp,
                "sign": sign,
            })],
        };
        self.send_json(&request).await?;

        loop {
            let text = self.next_text().await?;
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(_) => continue,
            };
            match envelope.event.as_deref() {
                Some("login") if envelope.code.as_deref().unwrap_or("0") == "0" => {
                    info!("[{}] Logged in", self.label);
                    return Ok(());
                }
                Some("login") | Some("error") => {
                    let err = error_from_code(
                        envelope.code.as_deref().unwrap_or_default(),
                        envelope.msg.as_deref().unwrap_or("Login failed"),
                    );
                    // Any rejection of the login request is an auth failure.
                    return Err(match err {
                        ExchangeError::Exchange(msg) => ExchangeError::Authentication(msg),
                        other => other,
                    });
                }
                _ => debug!("[{}] Ignoring pre-login message: {}", self.label, text),
            }
        }
    }

    /// Subscribes to one channel.
    pub async fn subscribe(&mut self, arg: serde_json::Value) -> Result<(), ExchangeError> {
        let request = OpRequest {
            op: "subscribe",
            args: vec![arg],
        };
        self.send_json(&request).await?;
        debug!("[{}] Subscription sent", self.label);
        Ok(())
    }

    /// Waits for the next data push on `channel`.
    ///
    /// Acks and other events are skipped; an `error` event fails the pull.
    pub async fn next_push(&mut self, channel: &str) -> Result<Push, ExchangeError> {
        loop {
            let text = self.next_text().await?;
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("[{}] Non-JSON message received: {} ({})", self.label, text, e);
                    continue;
                }
            };

            if envelope.event.as_deref() == Some("error") {
                return Err(error_from_code(
                    envelope.code.as_deref().unwrap_or_default(),
                    envelope.msg.as_deref().unwrap_or_default(),
                ));
            }

            let on_channel = envelope
                .arg
                .as_ref()
                .map(|a| a.channel == channel)
                .unwrap_or(false);

            match envelope.data {
                Some(data) if on_channel => {
                    return Ok(Push {
                        snapshot: envelope.event_type.as_deref() == Some("snapshot"),
                        data,
                    })
                }
                _ => {
                    if let Some(event) = envelope.event {
                        debug!("[{}] Event: {}", self.label, event);
                    }
                }
            }
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(mut self) {
        let _ = self.connection.close(None).await;
        debug!("[{}] WebSocket closed", self.label);
    }

    /// Reads the next text frame, answering pings and sending heartbeats.
    async fn next_text(&mut self) -> Result<String, ExchangeError> {
        loop {
            tokio::select! {
                msg = self.connection.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text == "pong" {
                                self.last_pong = Instant::now();
                                continue;
                            }
                            return Ok(text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.connection.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "Unknown".to_string());
                            info!("[{}] WebSocket closed by server: {}", self.label, reason);
                            return Err(ExchangeError::Network(format!("connection closed: {}", reason)));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("[{}] WebSocket receive error: {}", self.label, e);
                            return Err(e.into());
                        }
                        None => {
                            return Err(ExchangeError::Network("connection closed: stream ended".to_string()));
                        }
                    }
                }

                _ = self.heartbeat.tick() => {
                    if self.last_pong.elapsed() > HEARTBEAT_INTERVAL + PONG_TIMEOUT {
                        warn!("[{}] Heartbeat timeout detected", self.label);
                        return Err(ExchangeError::Network("heartbeat timeout".to_string()));
                    }
                    self.connection.send(Message::Text("ping".to_string())).await?;
                }
            }
        }
    }

    async fn send_json<T: Serialize>(&mut self, payload: &T) -> Result<(), ExchangeError> {
        let text = serde_json::to_string(payload).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        self.connection.send(Message::Text(text)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for OkxWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxWebSocket")
            .field("label", &self.label)
            .field("url", &self.url)
            .finish()
    }
}

// ============ Message Types ============

#[derive(Debug, Serialize)]
struct OpRequest {
    op: &'static str,
    args: Vec<serde_json::Value>,
}

/// One data push on a subscribed channel.
#[derive(Debug, Clone)]
pub struct Push {
    /// Set for `eventType: "snapshot"`: `data` is the whole channel state.
    pub snapshot: bool,
    pub data: Vec<serde_json::Value>,
}

/// Any inbound frame: an event (ack, login, error) or a data push.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: Option<String>,
    #[serde(rename = "eventType")]
    event_type: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    arg: Option<ChannelArg>,
    data: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ChannelArg {
    channel: String,
}
