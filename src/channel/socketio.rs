//! Minimal Socket.IO client over WebSocket
//!
//! Speaks Engine.IO v4 / Socket.IO v5 text packets on the default
//! namespace, which is all the classification backend uses:
//!
//! ```text
//! 0{"sid":..,"pingInterval":..}   server open
//! 40 / 40{"sid":..}               namespace connect (client / server ack)
//! 2 / 3                           ping / pong
//! 42["event",payload]             event
//! ```

use super::connector::{InboundEvent, PushConnection, PushConnector};
use crate::{MadskiError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const PONG_PACKET: &str = "3";
pub const CONNECT_PACKET: &str = "40";
pub const DISCONNECT_PACKET: &str = "41";

/// Engine.IO open handshake
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

/// A decoded text packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connected (server ack carries the socket id)
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(Value),
}

fn protocol(msg: impl Into<String>) -> MadskiError {
    MadskiError::Protocol(msg.into())
}

/// Decode one WebSocket text message
pub fn decode(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or_else(|| protocol("Empty packet"))?;
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|e| protocol(format!("Bad open packet: {}", e))),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_message(rest),
        // Upgrade and noop only matter for polling transports
        '5' | '6' => Ok(Packet::Noop),
        other => Err(protocol(format!("Unknown packet type {:?}", other))),
    }
}

fn decode_message(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| protocol("Empty Socket.IO message"))?;
    let mut rest = chars.as_str();

    // Optional "/namespace," prefix
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(comma) => &rest[comma + 1..],
            None => "",
        };
    }

    // Optional ack id
    let body = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    let json = |s: &str| -> Result<Value> {
        if s.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(s).map_err(|e| protocol(format!("Bad packet body: {}", e)))
        }
    };

    match kind {
        '0' => {
            let data = json(body)?;
            Ok(Packet::Connect(if data.is_null() { None } else { Some(data) }))
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut items = match json(body)? {
                Value::Array(items) => items.into_iter(),
                other => return Err(protocol(format!("Event body is not an array: {}", other))),
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(protocol("Event without a name")),
            };
            let data = items.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, data })
        }
        '4' => Ok(Packet::ConnectError(json(body)?)),
        other => Err(protocol(format!("Unsupported Socket.IO packet {:?}", other))),
    }
}

/// Encode an event on the default namespace
pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(name.to_string()), data.clone()]))
}

/// WebSocket URL for an http(s) base URL
pub fn socket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    format!("{}/socket.io/?EIO=4&transport=websocket", base)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read the next decodable packet; `Ok(None)` when the socket closed
async fn next_packet(ws: &mut WsStream) -> Result<Option<Packet>> {
    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| MadskiError::Channel(format!("WebSocket error: {}", e)))?;
        match message {
            Message::Text(text) => match decode(&text) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Skipping undecodable packet: {}", e),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn send_text(ws: &mut WsStream, text: String) -> Result<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| MadskiError::Channel(format!("Send failed: {}", e)))
}

/// Connects to a Socket.IO server
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    url: String,
    handshake_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(base_url: &str) -> Self {
        Self {
            url: socket_url(base_url),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn handshake(&self, ws: &mut WsStream) -> Result<Handshake> {
        let handshake = loop {
            match next_packet(ws).await? {
                Some(Packet::Open(handshake)) => break handshake,
                Some(other) => debug!("Ignoring {:?} before open", other),
                None => return Err(MadskiError::Channel("Closed during handshake".to_string())),
            }
        };

        send_text(ws, CONNECT_PACKET.to_string()).await?;

        loop {
            match next_packet(ws).await? {
                Some(Packet::Connect(_)) => return Ok(handshake),
                Some(Packet::ConnectError(data)) => {
                    return Err(MadskiError::Channel(format!("Connection refused: {}", data)))
                }
                Some(Packet::Ping) => send_text(ws, PONG_PACKET.to_string()).await?,
                Some(other) => debug!("Ignoring {:?} before namespace ack", other),
                None => return Err(MadskiError::Channel("Closed during handshake".to_string())),
            }
        }
    }
}

#[async_trait]
impl PushConnector for SocketIoConnector {
    async fn connect(&mut self) -> Result<Box<dyn PushConnection>> {
        debug!("Connecting to {}", self.url);
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| MadskiError::Channel(format!("Failed to connect to {}: {}", self.url, e)))?;

        let handshake = tokio::time::timeout(self.handshake_timeout, self.handshake(&mut ws))
            .await
            .map_err(|_| MadskiError::Channel("Handshake timed out".to_string()))??;

        info!(
            "Socket.IO session {} open (ping interval {}ms)",
            handshake.sid, handshake.ping_interval
        );
        Ok(Box::new(SocketIoConnection { ws }))
    }
}

/// An open Socket.IO session
pub struct SocketIoConnection {
    ws: WsStream,
}

#[async_trait]
impl PushConnection for SocketIoConnection {
    async fn emit(&mut self, event: &str, payload: Value) -> Result<()> {
        send_text(&mut self.ws, encode_event(event, &payload)).await
    }

    async fn next_event(&mut self) -> Result<Option<InboundEvent>> {
        loop {
            match next_packet(&mut self.ws).await? {
                Some(Packet::Event { name, data }) => return Ok(Some(InboundEvent::new(name, data))),
                Some(Packet::Ping) => send_text(&mut self.ws, PONG_PACKET.to_string()).await?,
                Some(Packet::Close) | Some(Packet::Disconnect) | None => return Ok(None),
                Some(Packet::ConnectError(data)) => {
                    return Err(MadskiError::Channel(format!("Server error: {}", data)))
                }
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = send_text(&mut self.ws, DISCONNECT_PACKET.to_string()).await;
        let _ = self.ws.close(None).await;
    }
}
