use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relay_bus::Relay;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::context::MeshContext;
use crate::error::{MeshError, MeshResult};
use crate::session::peer::SessionEnv;
use crate::session::{LinkRegistry, MeshEvent, RoomEvent, RoomInfo, RoomManager, RoomStatus};
use crate::transport::message::{ChunkedReceiver, ChunkedSender};
use crate::transport::{Payload, PeerLink, PeerLinkFactory};

/// Application-facing handle to one participant of a mesh.
///
/// Construction spawns the room manager on the current tokio runtime.
/// Dropping the handle leaves the room and stops the manager.
pub struct DataChannel {
    user_token: String,
    inbox: mpsc::UnboundedSender<RoomEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    registry: LinkRegistry,
    context: Arc<MeshContext>,
    sender: ChunkedSender,
    task: JoinHandle<()>,
}

impl DataChannel {
    /// `user_id` becomes this participant's user token. Without one a fresh
    /// token is generated.
    pub fn new(
        channel: &str,
        user_id: Option<&str>,
        relay: Arc<dyn Relay>,
        links: Arc<dyn PeerLinkFactory>,
        config: MeshConfig,
    ) -> MeshResult<Self> {
        Self::with_context(
            channel,
            user_id,
            relay,
            links,
            config,
            Arc::new(MeshContext::new()),
        )
    }

    pub fn with_context(
        channel: &str,
        user_id: Option<&str>,
        relay: Arc<dyn Relay>,
        links: Arc<dyn PeerLinkFactory>,
        config: MeshConfig,
        context: Arc<MeshContext>,
    ) -> MeshResult<Self> {
        if channel.trim().is_empty() {
            return Err(MeshError::InvalidArgument("channel name is empty".into()));
        }
        let user_token = match user_id {
            Some(id) if id.trim().is_empty() => {
                return Err(MeshError::InvalidArgument("user id is empty".into()));
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry: LinkRegistry = Arc::new(RwLock::new(Default::default()));
        let sender = ChunkedSender::new(config.chunk_size, config.chunk_interval);
        let receiver = Arc::new(Mutex::new(ChunkedReceiver::new(config.assembler())));

        let env = SessionEnv {
            user_token: user_token.clone(),
            relay,
            links,
            inbox: inbox_tx.clone(),
            events: events_tx,
            config,
            context: context.clone(),
            registry: registry.clone(),
            receiver,
        };
        let manager = RoomManager::new(env, inbox_rx, channel.to_string());
        let task = tokio::spawn(manager.run());
        debug!(target = "mesh::channel", channel, user_token = %user_token, "data channel ready");

        Ok(Self {
            user_token,
            inbox: inbox_tx,
            events: Mutex::new(Some(events_rx)),
            registry,
            context,
            sender,
            task,
        })
    }

    fn command(&self, event: RoomEvent) -> MeshResult<()> {
        if self.task.is_finished() {
            return Err(MeshError::ManagerStopped);
        }
        self.inbox
            .send(event)
            .map_err(|_| MeshError::ManagerStopped)
    }

    pub fn user_token(&self) -> &str {
        &self.user_token
    }

    pub fn first_connection_opened(&self) -> bool {
        self.context.first_connection_opened()
    }

    /// Takes the event stream. Only the first call returns it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events.lock().take()
    }

    /// Creates a room with the local participant as broadcaster and returns
    /// its token. A token is generated when none is given.
    pub fn open(&self, room_token: Option<&str>) -> MeshResult<String> {
        let room_token = match room_token {
            Some(token) if token.trim().is_empty() => {
                return Err(MeshError::InvalidArgument("room token is empty".into()));
            }
            Some(token) => token.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        self.command(RoomEvent::CreateRoom {
            room_token: room_token.clone(),
        })?;
        Ok(room_token)
    }

    /// Starts looking for announced rooms.
    pub fn connect(&self) -> MeshResult<()> {
        self.command(RoomEvent::Connect)
    }

    pub fn join(&self, room: RoomInfo) -> MeshResult<()> {
        if room.id.trim().is_empty() || room.owner.trim().is_empty() {
            return Err(MeshError::InvalidArgument(
                "join requires a room id and an owner".into(),
            ));
        }
        if room.owner == self.user_token {
            return Err(MeshError::InvalidArgument("cannot join own room".into()));
        }
        self.command(RoomEvent::JoinRoom { room })
    }

    /// Sends to every open peer. Returns the number of chunks written.
    pub async fn send(&self, payload: impl Into<Payload>) -> MeshResult<usize> {
        let payload = non_empty(payload.into())?;
        let targets: Vec<Arc<dyn PeerLink>> = self.registry.read().values().cloned().collect();
        if targets.is_empty() {
            return Ok(0);
        }
        Ok(self.sender.send(&payload, &targets).await?)
    }

    pub async fn send_to(&self, user_token: &str, payload: impl Into<Payload>) -> MeshResult<usize> {
        let payload = non_empty(payload.into())?;
        let target = self
            .registry
            .read()
            .get(user_token)
            .cloned()
            .ok_or_else(|| MeshError::UnknownPeer(user_token.to_string()))?;
        Ok(self.sender.send(&payload, &[target]).await?)
    }

    pub fn leave(&self) -> MeshResult<()> {
        self.command(RoomEvent::Leave { target: None })
    }

    /// Tells one peer to leave and drops its session.
    pub fn eject(&self, user_token: &str) -> MeshResult<()> {
        if user_token.trim().is_empty() {
            return Err(MeshError::InvalidArgument("user token is empty".into()));
        }
        self.command(RoomEvent::Leave {
            target: Some(user_token.to_string()),
        })
    }

    /// User tokens of peers with an open link, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.registry.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn status(&self) -> MeshResult<RoomStatus> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomEvent::Status { reply })?;
        rx.await.map_err(|_| MeshError::ManagerStopped)
    }
}

fn non_empty(payload: Payload) -> MeshResult<Payload> {
    if payload.is_empty() {
        return Err(MeshError::InvalidArgument("payload is empty".into()));
    }
    Ok(payload)
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        let _ = self.inbox.send(RoomEvent::Leave { target: None });
        let _ = self.inbox.send(RoomEvent::Shutdown);
    }
}
