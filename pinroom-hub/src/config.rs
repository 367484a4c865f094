//! Hub tuning: queue sizes, heartbeat timings and fan-out policy.

use std::time::Duration;

use crate::protocol::{
    ping_period_for, HubError, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PONG_WAIT,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_WAIT,
};

/// Who receives a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    /// Every member, the sender included.
    #[default]
    All,
    /// Every member except the sender.
    Others,
}

/// Per-room and per-peer settings shared by every room of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Outbound queue capacity per peer. A full queue evicts the peer.
    pub queue_capacity: usize,
    /// Liveness window: silence longer than this ends the connection.
    pub pong_wait: Duration,
    /// Heartbeat period, must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for each transport write.
    pub write_wait: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    pub echo: EchoPolicy,
    /// Send a `joined` system message to each newly joined peer.
    pub welcome: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: ping_period_for(DEFAULT_PONG_WAIT),
            write_wait: DEFAULT_WRITE_WAIT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            echo: EchoPolicy::default(),
            welcome: false,
        }
    }
}

impl HubConfig {
    /// Set the liveness window and derive the heartbeat period from it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = ping_period_for(pong_wait);
        self
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.queue_capacity == 0 {
            return Err(HubError::Config("queue_capacity must be non-zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(HubError::Config("max_message_size must be non-zero".into()));
        }
        if self.write_wait.is_zero() || self.ping_period.is_zero() {
            return Err(HubError::Config("write_wait and ping_period must be non-zero".into()));
        }
        if self.ping_period >= self.pong_wait {
            return Err(HubError::Config(format!(
                "ping_period ({:?}) must be shorter than pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        Ok(())
    }
}
