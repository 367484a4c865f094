//! PIN → room mapping with lazy creation and reclamation.
//!
//! Lookups take the read lock; creation takes the write lock and re-checks,
//! so concurrent first requests for one PIN still produce a single room.
//! Each room task removes its own entry when the loop exits, but only while
//! the entry still points at that same room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::HubConfig;
use crate::protocol::{HubError, Payload, PeerId};
use crate::room::{Room, RoomHandle};

type RoomMap = Arc<RwLock<HashMap<String, RoomHandle>>>;

/// Room registry: one live room per PIN.
pub struct RoomRegistry {
    rooms: RoomMap,
    config: HubConfig,
    shutdown: watch::Sender<bool>,
}

impl RoomRegistry {
    /// Create a registry, rejecting configs that [`HubConfig::validate`] refuses.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the live room for `pin`, creating and starting it if needed.
    ///
    /// A room is reclaimed when its last member leaves, so one that is
    /// resolved but never joined lives until shutdown. Outside the crate,
    /// rooms are only reached through [`RoomRegistry::join`].
    pub(crate) async fn resolve(&self, pin: &str) -> Result<RoomHandle, HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(pin).filter(|room| !room.is_closed()) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(pin).filter(|room| !room.is_closed()) {
            return Ok(room.clone());
        }
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        let (room, handle) = Room::new(pin, self.config.clone(), self.shutdown.subscribe());
        rooms.insert(pin.to_string(), handle.clone());
        log::debug!("Room {pin} created ({} active)", rooms.len());

        let map = self.rooms.clone();
        let reaped = handle.clone();
        tokio::spawn(async move {
            room.run().await;
            evict(&map, &reaped).await;
        });

        Ok(handle)
    }

    /// Resolve `pin` and join `peer` to it, returning the room and the peer's
    /// outbound queue.
    ///
    /// A room can terminate between being resolved and processing the join;
    /// the join is then retried against a freshly resolved room.
    pub async fn join(
        &self,
        pin: &str,
        peer: PeerId,
    ) -> Result<(RoomHandle, mpsc::Receiver<Payload>), HubError> {
        loop {
            let room = self.resolve(pin).await?;
            let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
            match room.join(peer, queue_tx).await {
                Ok(()) => return Ok((room, queue_rx)),
                Err(HubError::RoomClosed) => {
                    log::debug!("Room {pin} closed before peer {peer} could join, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The registered room for `pin`, without creating one.
    pub async fn lookup(&self, pin: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(pin).cloned()
    }

    pub async fn contains(&self, pin: &str) -> bool {
        self.rooms.read().await.contains_key(pin)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_pins(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Stop every room, current and future. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            log::info!("Shutting down room registry");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait for every registered room to terminate and be evicted.
    pub async fn drained(&self) {
        loop {
            let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
            if handles.is_empty() {
                return;
            }
            for handle in &handles {
                handle.closed().await;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::with_valid_config(HubConfig::default())
    }
}

async fn evict(rooms: &RwLock<HashMap<String, RoomHandle>>, room: &RoomHandle) {
    let mut rooms = rooms.write().await;
    if rooms.get(room.pin()).is_some_and(|current| current.same_room(room)) {
        rooms.remove(room.pin());
        log::debug!("Room {} removed (empty)", room.pin());
    }
}
