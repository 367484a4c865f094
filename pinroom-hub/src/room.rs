//! Per-room fan-out with non-blocking backpressure.
//!
//! A room is a single command loop that owns its member set. Joins, leaves,
//! broadcasts and snapshots all travel through one channel and are applied
//! one at a time, so membership never races:
//!
//! ```text
//! read pump A ──┐                       ┌──► queue A ──► write pump A
//! read pump B ──┼──► commands ──► Room ─┼──► queue B ──► write pump B
//! registry    ──┘        ▲              └──► queue C ──► write pump C
//!                        │
//!                 shutdown (watch)
//! ```
//!
//! Delivery into a member queue is `try_send`. A full queue means a stalled
//! consumer: that member is evicted on the spot instead of slowing the loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{EchoPolicy, HubConfig};
use crate::protocol::{HubError, Payload, PeerId, SystemMessage, ROOM_COMMAND_CAPACITY};

enum RoomCommand {
    Join {
        peer: PeerId,
        queue: mpsc::Sender<Payload>,
        ack: oneshot::Sender<()>,
    },
    Leave {
        peer: PeerId,
    },
    Broadcast {
        from: PeerId,
        payload: Payload,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Why a room loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomExit {
    /// The last member left or was evicted.
    Emptied,
    /// The shutdown signal fired.
    Shutdown,
    /// Every command sender was dropped.
    Abandoned,
}

/// Point-in-time view of a room, taken inside its loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub members: Vec<PeerId>,
    pub broadcasts: u64,
    pub evictions: u64,
}

/// Cloneable address of a running room.
#[derive(Clone)]
pub struct RoomHandle {
    pin: Arc<str>,
    commands: mpsc::Sender<RoomCommand>,
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("pin", &self.pin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RoomHandle {
    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// Add `peer` with its outbound queue.
    ///
    /// Resolves once the loop has applied the join. Fails with
    /// [`HubError::RoomClosed`] if the room terminated first, in which case
    /// `queue` has been dropped.
    pub async fn join(&self, peer: PeerId, queue: mpsc::Sender<Payload>) -> Result<(), HubError> {
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(RoomCommand::Join { peer, queue, ack })
            .await
            .map_err(|_| HubError::RoomClosed)?;
        acked.await.map_err(|_| HubError::RoomClosed)
    }

    /// Remove `peer`. A no-op for non-members and for a terminated room.
    pub async fn leave(&self, peer: PeerId) {
        let _ = self.commands.send(RoomCommand::Leave { peer }).await;
    }

    pub async fn broadcast(&self, from: PeerId, payload: Payload) -> Result<(), HubError> {
        self.commands
            .send(RoomCommand::Broadcast { from, payload })
            .await
            .map_err(|_| HubError::RoomClosed)
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, HubError> {
        let (reply, snapshot) = oneshot::channel();
        self.commands
            .send(RoomCommand::Snapshot { reply })
            .await
            .map_err(|_| HubError::RoomClosed)?;
        snapshot.await.map_err(|_| HubError::RoomClosed)
    }

    pub async fn members(&self) -> Result<Vec<PeerId>, HubError> {
        Ok(self.snapshot().await?.members)
    }

    /// Whether the loop has terminated.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the loop has terminated.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    /// Whether both handles address the same room instance.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }
}

/// The broadcast domain for one PIN.
pub struct Room {
    pin: Arc<str>,
    config: HubConfig,
    members: HashMap<PeerId, mpsc::Sender<Payload>>,
    commands: mpsc::Receiver<RoomCommand>,
    shutdown: watch::Receiver<bool>,
    broadcasts: u64,
    evictions: u64,
}

impl Room {
    /// Create a room and its handle. Nothing runs until [`Room::run`] is polled.
    pub fn new(
        pin: impl Into<Arc<str>>,
        config: HubConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, RoomHandle) {
        let pin = pin.into();
        let (tx, rx) = mpsc::channel(ROOM_COMMAND_CAPACITY);
        let room = Self {
            pin: pin.clone(),
            config,
            members: HashMap::new(),
            commands: rx,
            shutdown,
            broadcasts: 0,
            evictions: 0,
        };
        (room, RoomHandle { pin, commands: tx })
    }

    /// Run the command loop until the room empties or shuts down.
    ///
    /// Every member queue is closed on the way out; commands still buffered
    /// are dropped, which fails their senders with `RoomClosed`.
    pub async fn run(mut self) -> RoomExit {
        log::debug!("Room {} opened", self.pin);

        let exit = loop {
            if *self.shutdown.borrow_and_update() {
                break RoomExit::Shutdown;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break RoomExit::Shutdown;
                    }
                }

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.apply(command) {
                            break exit;
                        }
                    }
                    None => break RoomExit::Abandoned,
                },
            }
        };

        self.commands.close();
        self.members.clear();
        log::debug!("Room {} closed ({exit:?})", self.pin);
        exit
    }

    fn apply(&mut self, command: RoomCommand) -> Option<RoomExit> {
        match command {
            RoomCommand::Join { peer, queue, ack } => self.join(peer, queue, ack),
            RoomCommand::Leave { peer } => self.leave(peer),
            RoomCommand::Broadcast { from, payload } => self.broadcast(from, payload),
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(RoomSnapshot {
                    members: self.members.keys().copied().collect(),
                    broadcasts: self.broadcasts,
                    evictions: self.evictions,
                });
                None
            }
        }
    }

    fn join(
        &mut self,
        peer: PeerId,
        queue: mpsc::Sender<Payload>,
        ack: oneshot::Sender<()>,
    ) -> Option<RoomExit> {
        if self.config.welcome {
            match SystemMessage::joined(&*self.pin).encode() {
                Ok(welcome) => {
                    let _ = queue.try_send(welcome);
                }
                Err(e) => log::warn!("Failed to encode welcome for room {}: {e}", self.pin),
            }
        }
        self.members.insert(peer, queue);

        if ack.send(()).is_err() {
            // Joiner gave up before the ack; nobody will ever send its Leave.
            self.members.remove(&peer);
            return self.members.is_empty().then_some(RoomExit::Emptied);
        }
        None
    }

    fn leave(&mut self, peer: PeerId) -> Option<RoomExit> {
        self.members.remove(&peer)?;
        self.members.is_empty().then_some(RoomExit::Emptied)
    }

    fn broadcast(&mut self, from: PeerId, payload: Payload) -> Option<RoomExit> {
        // An evicted peer's read pump can outlive its membership.
        if !self.members.contains_key(&from) {
            log::debug!("Room {}: dropping broadcast from non-member {from}", self.pin);
            return None;
        }
        self.broadcasts += 1;

        let mut evicted = Vec::new();
        for (peer, queue) in &self.members {
            if self.config.echo == EchoPolicy::Others && *peer == from {
                continue;
            }
            match queue.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Peer {peer} is not keeping up, evicting from room {}", self.pin);
                    evicted.push(*peer);
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Peer {peer} queue already gone, evicting from room {}", self.pin);
                    evicted.push(*peer);
                }
            }
        }

        if evicted.is_empty() {
            return None;
        }
        for peer in &evicted {
            self.members.remove(peer);
        }
        self.evictions += evicted.len() as u64;
        self.members.is_empty().then_some(RoomExit::Emptied)
    }
}
