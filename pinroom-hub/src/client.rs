//! WebSocket client for joining a room by PIN.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Text and binary sends
//! - Received payloads surfaced as [`ClientEvent`]s
//!
//! Heartbeat pings from the server are answered by the transport while the
//! reader task runs; the client never originates pings itself.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, http};

use crate::protocol::{CloseReason, Frame, HubError, Payload};
use crate::transport::{self, TransportError};

const EVENT_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the room client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// A payload fanned out by the room
    Message(Payload),
    /// Connection lost or closed
    Disconnected,
}

/// The room client.
pub struct RoomClient {
    /// Base URL, e.g. `ws://localhost:8080`
    server_url: String,

    pin: String,

    /// `Origin` header sent with the upgrade request
    origin: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Frame>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl RoomClient {
    pub fn new(server_url: impl Into<String>, pin: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            server_url: server_url.into(),
            pin: pin.into(),
            origin: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Send `origin` as the `Origin` header when connecting.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Full upgrade URL for this client's room.
    pub fn room_url(&self) -> String {
        format!(
            "{}/ws?pin={}",
            self.server_url.trim_end_matches('/'),
            urlencoding::encode(&self.pin)
        )
    }

    /// Connect and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), HubError> {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.open().await;
        if result.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    async fn open(&mut self) -> Result<(), HubError> {
        let mut request = self
            .room_url()
            .into_client_request()
            .map_err(TransportError::from)?;
        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| TransportError::from(tungstenite::Error::HttpFormat(http::Error::from(e))))?;
            request.headers_mut().insert(ORIGIN, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(TransportError::from)?;
        let (mut sink, mut stream) = transport::split_stream(ws_stream);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTGOING_CAPACITY);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Frame::Close(_));
                if let Err(e) = sink.send(frame).await {
                    log::debug!("Client write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        log::debug!("Connected to room {}", self.pin);

        // Reader task: surface room traffic as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Frame::Message(payload)) => {
                        let _ = event_tx.send(ClientEvent::Message(payload)).await;
                    }
                    Ok(Frame::Close(_)) | Err(_) => break,
                    Ok(Frame::Ping(_)) | Ok(Frame::Pong(_)) => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), HubError> {
        self.send(Frame::Message(Payload::text(text))).await
    }

    pub async fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<(), HubError> {
        self.send(Frame::Message(Payload::binary(data))).await
    }

    /// Send a normal close and stop sending. Received events keep flowing
    /// until the server completes the close.
    pub async fn close(&mut self) -> Result<(), HubError> {
        let result = self.send(Frame::Close(Some(CloseReason::normal("client closing")))).await;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        result
    }

    async fn send(&self, frame: Frame) -> Result<(), HubError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(TransportError::Closed.into());
        }
        let tx = self.outgoing_tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }
}
