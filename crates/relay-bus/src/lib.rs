//! Named-channel signaling relay.
//!
//! A participant opens a channel by name and gets a [`RelayChannel`]. The
//! handle sees every message published under that name, its own included,
//! until it is dropped. Once the last handle for a name is gone the relay
//! forgets the channel, so short-lived per-peer channels do not accumulate.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

pub const DEFAULT_CAPACITY: usize = 256;

/// One JSON message observed on a named relay channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEnvelope {
    pub channel: String,
    pub payload: Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("nobody has relay channel `{0}` open")]
    NoListeners(String),
    #[error("relay channel `{0}` is closed")]
    Closed(String),
    #[error("relay channel `{channel}` skipped {skipped} messages")]
    Lagged { channel: String, skipped: u64 },
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Signaling relay shared by every participant.
pub trait Relay: Send + Sync {
    /// Opens `channel`. Messages published after this call are delivered to
    /// the returned handle.
    fn open(&self, channel: &str) -> RelayChannel;

    /// Publishes to every open handle of `channel`.
    fn publish(&self, channel: &str, payload: Value) -> RelayResult<()>;
}

/// Told when a [`RelayChannel`] goes away so idle channels can be dropped.
pub trait ChannelRegistry: Send + Sync {
    fn release(&self, channel: &str);
}

/// An open subscription to one relay channel.
pub struct RelayChannel {
    name: String,
    outbound: broadcast::Sender<RelayEnvelope>,
    inbound: Option<broadcast::Receiver<RelayEnvelope>>,
    registry: Weak<dyn ChannelRegistry>,
}

impl RelayChannel {
    pub fn new(
        name: impl Into<String>,
        outbound: broadcast::Sender<RelayEnvelope>,
        inbound: broadcast::Receiver<RelayEnvelope>,
        registry: Weak<dyn ChannelRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            outbound,
            inbound: Some(inbound),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes on this channel. The handle itself receives the message too.
    pub fn send(&self, payload: Value) -> RelayResult<()> {
        self.outbound
            .send(RelayEnvelope {
                channel: self.name.clone(),
                payload,
            })
            .map(drop)
            .map_err(|_| RelayError::Closed(self.name.clone()))
    }

    /// Waits for the next message. A slow reader gets [`RelayError::Lagged`]
    /// once and then continues with the oldest retained message.
    pub async fn recv(&mut self) -> RelayResult<RelayEnvelope> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Err(RelayError::Closed(self.name.clone()));
        };
        match inbound.recv().await {
            Ok(envelope) => Ok(envelope),
            Err(RecvError::Lagged(skipped)) => Err(RelayError::Lagged {
                channel: self.name.clone(),
                skipped,
            }),
            Err(RecvError::Closed) => Err(RelayError::Closed(self.name.clone())),
        }
    }

    /// Next already-queued message, skipping over any lag.
    pub fn try_recv(&mut self) -> Option<RelayEnvelope> {
        let inbound = self.inbound.as_mut()?;
        loop {
            match inbound.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("name", &self.name)
            .field("open", &self.inbound.is_some())
            .finish()
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        // The receiver has to be gone before the registry counts listeners.
        self.inbound.take();
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.name);
        }
    }
}

#[derive(Debug)]
struct Hub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<RelayEnvelope>>>,
}

impl ChannelRegistry for Hub {
    fn release(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if channels
            .get(channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(channel);
        }
    }
}

/// In-process relay for tests and single-process meshes.
#[derive(Debug, Clone)]
pub struct LocalRelay {
    hub: Arc<Hub>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds how far a handle may fall behind before it lags.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of open handles on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .channels
            .lock()
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Number of channels with at least one open handle.
    pub fn channel_count(&self) -> usize {
        self.hub.channels.lock().len()
    }
}

impl Relay for LocalRelay {
    fn open(&self, channel: &str) -> RelayChannel {
        let (outbound, inbound) = {
            let mut channels = self.hub.channels.lock();
            let sender = channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.hub.capacity).0);
            (sender.clone(), sender.subscribe())
        };
        let hub: Arc<dyn ChannelRegistry> = self.hub.clone();
        RelayChannel::new(channel, outbound, inbound, Arc::downgrade(&hub))
    }

    fn publish(&self, channel: &str, payload: Value) -> RelayResult<()> {
        let sender = self.hub.channels.lock().get(channel).cloned();
        let Some(sender) = sender else {
            return Err(RelayError::NoListeners(channel.to_string()));
        };
        sender
            .send(RelayEnvelope {
                channel: channel.to_string(),
                payload,
            })
            .map(drop)
            .map_err(|_| RelayError::NoListeners(channel.to_string()))
    }
}
