//! One connected participant: a read pump and a write pump over a split
//! transport.
//!
//! ```text
//!  transport ──► read pump ──► room.broadcast
//!                   │
//!              leave (once)
//!                   │
//!  transport ◄── write pump ◄── queue ◄── room
//!                   ▲
//!                 ticker (ping)
//! ```
//!
//! Whichever pump stops first triggers the leave. The room then closes the
//! queue, which winds the write pump down; a failed write drops the transport,
//! which ends the read pump.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::protocol::{CloseReason, Frame, HubError, Payload, PeerId, MAX_COALESCED_WRITES};
use crate::registry::RoomRegistry;
use crate::room::RoomHandle;
use crate::transport::TransportError;

/// Membership of one peer, shared by both of its pumps.
pub(crate) struct PeerSession {
    id: PeerId,
    room: RoomHandle,
    config: HubConfig,
    left: AtomicBool,
}

impl PeerSession {
    pub(crate) fn new(id: PeerId, room: RoomHandle, config: HubConfig) -> Self {
        Self {
            id,
            room,
            config,
            left: AtomicBool::new(false),
        }
    }

    /// Leave the room. Only the first call sends anything; returns whether
    /// this call was that one.
    pub(crate) async fn leave(&self) -> bool {
        if self.left.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.room.leave(self.id).await;
        true
    }
}

/// Forward inbound messages to the room until the peer goes away.
///
/// Any inbound frame counts as a sign of life and pushes the deadline out by
/// `pong_wait`.
pub(crate) async fn read_pump<R>(session: &PeerSession, mut stream: R)
where
    R: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let pong_wait = session.config.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = match time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                log::debug!("Peer {} read error: {e}", session.id);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                log::info!("Peer {} silent for {pong_wait:?}, dropping", session.id);
                break;
            }
        };
        deadline = Instant::now() + pong_wait;

        match frame {
            Frame::Message(payload) => {
                if payload.len() > session.config.max_message_size {
                    log::warn!(
                        "Peer {} sent {} bytes (limit {}), dropping",
                        session.id,
                        payload.len(),
                        session.config.max_message_size
                    );
                    break;
                }
                if session.room.broadcast(session.id, payload).await.is_err() {
                    break;
                }
            }
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Close(_) => break,
        }
    }

    session.leave().await;
}

/// Drain the outbound queue into the transport and keep the heartbeat going.
pub(crate) async fn write_pump<W>(session: &PeerSession, mut sink: W, mut queue: mpsc::Receiver<Payload>)
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    let write_wait = session.config.write_wait;
    let period = session.config.ping_period;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            payload = queue.recv() => match payload {
                Some(first) => {
                    if let Err(e) = write_batch(&mut sink, first, &mut queue, write_wait).await {
                        log::debug!("Peer {} write failed: {e}", session.id);
                        break;
                    }
                }
                None => {
                    let close = if session.room.is_closed() {
                        Some(CloseReason::going_away("room closed"))
                    } else {
                        None
                    };
                    let _ = send_timeout(&mut sink, Frame::Close(close), write_wait).await;
                    break;
                }
            },

            _ = ticker.tick() => {
                if let Err(e) = send_timeout(&mut sink, Frame::Ping(Bytes::new()), write_wait).await {
                    log::debug!("Peer {} ping failed: {e}", session.id);
                    break;
                }
            }
        }
    }

    session.leave().await;
}

/// Write `first` plus whatever else is already queued, then flush once.
async fn write_batch<W>(
    sink: &mut W,
    first: Payload,
    queue: &mut mpsc::Receiver<Payload>,
    write_wait: Duration,
) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    let write = async {
        sink.feed(Frame::Message(first)).await?;
        for _ in 1..MAX_COALESCED_WRITES {
            match queue.try_recv() {
                Ok(payload) => sink.feed(Frame::Message(payload)).await?,
                Err(_) => break,
            }
        }
        sink.flush().await
    };
    time::timeout(write_wait, write)
        .await
        .map_err(|_| TransportError::WriteTimeout(write_wait))?
}

async fn send_timeout<W>(sink: &mut W, frame: Frame, write_wait: Duration) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    time::timeout(write_wait, sink.send(frame))
        .await
        .map_err(|_| TransportError::WriteTimeout(write_wait))?
}

/// Run a connection as a member of room `pin` until either side ends it.
///
/// Returns the peer's id once both pumps have stopped and the peer has left.
/// If the room cannot be joined (the hub is shutting down), a going-away
/// close is sent and the join error returned.
pub async fn serve<W, R>(registry: &RoomRegistry, pin: &str, mut sink: W, stream: R) -> Result<PeerId, HubError>
where
    W: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    R: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let id = Uuid::new_v4();
    let config = registry.config().clone();

    let (room, queue) = match registry.join(pin, id).await {
        Ok(joined) => joined,
        Err(e) => {
            let close = Frame::Close(Some(CloseReason::going_away("server shutting down")));
            let _ = send_timeout(&mut sink, close, config.write_wait).await;
            return Err(e);
        }
    };
    log::info!("Peer {id} joined room {pin}");

    let session = Arc::new(PeerSession::new(id, room, config));
    let mut writer = tokio::spawn({
        let session = session.clone();
        async move { write_pump(&session, sink, queue).await }
    });

    let reader_first = tokio::select! {
        _ = read_pump(&session, stream) => true,
        _ = &mut writer => false,
    };
    if reader_first {
        if let Err(e) = writer.await {
            log::error!("Write pump for peer {id} panicked: {e}");
        }
    }

    session.leave().await;
    log::info!("Peer {id} left room {pin}");
    Ok(id)
}
