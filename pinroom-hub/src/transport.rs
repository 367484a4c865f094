//! Adapters between WebSocket libraries and hub [`Frame`]s.
//!
//! The pumps only see `Sink<Frame>` / `Stream<Item = Result<Frame, _>>`, so
//! the server side (axum) and the client side (tokio-tungstenite) share them.

use axum::extract::ws::{self, WebSocket};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{CloseReason, Frame, Payload, PayloadKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("text frame is not valid UTF-8")]
    InvalidText,
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("websocket error: {0}")]
    Tungstenite(#[from] tungstenite::Error),
}

/// Split an upgraded axum socket into a frame sink and a frame stream.
pub fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TransportError> + Send + Unpin,
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(frame_to_axum(frame)));
    let stream = stream.map(|message| message.map_err(TransportError::from).and_then(axum_to_frame));
    (sink, stream)
}

/// Split a tokio-tungstenite stream into a frame sink and a frame stream.
pub fn split_stream<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Sink<Frame, Error = TransportError> + Send + Unpin,
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(frame_to_tungstenite(frame)));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => tungstenite_to_frame(message).transpose(),
            Err(e) => Some(Err(TransportError::from(e))),
        })
    });
    (sink, stream)
}

fn payload_text(payload: &Payload) -> Result<&str, TransportError> {
    std::str::from_utf8(payload.data()).map_err(|_| TransportError::InvalidText)
}

fn frame_to_axum(frame: Frame) -> Result<ws::Message, TransportError> {
    Ok(match frame {
        Frame::Message(payload) => match payload.kind() {
            PayloadKind::Text => ws::Message::Text(payload_text(&payload)?.into()),
            PayloadKind::Binary => ws::Message::Binary(payload.into_data()),
        },
        Frame::Ping(data) => ws::Message::Ping(data),
        Frame::Pong(data) => ws::Message::Pong(data),
        Frame::Close(reason) => ws::Message::Close(reason.map(|r| ws::CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    })
}

fn axum_to_frame(message: ws::Message) -> Result<Frame, TransportError> {
    Ok(match message {
        ws::Message::Text(text) => Frame::Message(Payload::text(text.as_str())),
        ws::Message::Binary(data) => Frame::Message(Payload::binary(data)),
        ws::Message::Ping(data) => Frame::Ping(data),
        ws::Message::Pong(data) => Frame::Pong(data),
        ws::Message::Close(frame) => {
            Frame::Close(frame.map(|f| CloseReason::new(f.code, f.reason.as_str())))
        }
    })
}

fn frame_to_tungstenite(frame: Frame) -> Result<tungstenite::Message, TransportError> {
    use tungstenite::protocol::CloseFrame;

    Ok(match frame {
        Frame::Message(payload) => match payload.kind() {
            PayloadKind::Text => tungstenite::Message::Text(payload_text(&payload)?.into()),
            PayloadKind::Binary => tungstenite::Message::Binary(payload.into_data()),
        },
        Frame::Ping(data) => tungstenite::Message::Ping(data),
        Frame::Pong(data) => tungstenite::Message::Pong(data),
        Frame::Close(reason) => tungstenite::Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    })
}

/// Raw frames never surface on read, so they map to nothing.
fn tungstenite_to_frame(message: tungstenite::Message) -> Result<Option<Frame>, TransportError> {
    Ok(Some(match message {
        tungstenite::Message::Text(text) => Frame::Message(Payload::text(text.as_str())),
        tungstenite::Message::Binary(data) => Frame::Message(Payload::binary(data)),
        tungstenite::Message::Ping(data) => Frame::Ping(data),
        tungstenite::Message::Pong(data) => Frame::Pong(data),
        tungstenite::Message::Close(frame) => {
            Frame::Close(frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.as_str())))
        }
        tungstenite::Message::Frame(_) => return Ok(None),
    }))
}
