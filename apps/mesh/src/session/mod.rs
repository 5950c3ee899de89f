//! Room membership and peer-session orchestration.
//!
//! A single [`RoomManager`] task owns every peer session and the set of known
//! participants. Relay traffic, link events and timers are all funneled into
//! its inbox as [`RoomEvent`]s and processed one at a time.

pub mod peer;
pub mod signaling;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use relay_bus::{RelayChannel, RelayError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::transport::{LinkError, Payload, Role, SessionDescription};
use peer::{LinkOutcome, LinkSignal, PeerSession, SessionEnv};
use signaling::RelayMessage;

pub use peer::LinkRegistry;

/// A room seen on the relay: its token and the broadcaster's user token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomInfo {
    pub id: String,
    pub owner: String,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    RoomDiscovered(RoomInfo),
    Opened {
        user_token: String,
    },
    Message {
        user_token: String,
        payload: Payload,
        latency: Duration,
    },
    Closed {
        user_token: String,
    },
    Left {
        user_token: String,
    },
    Error {
        user_token: Option<String>,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStatus {
    pub room_token: Option<String>,
    pub is_broadcaster: bool,
    pub joined: bool,
    pub seeking: bool,
    /// Remote user tokens with a live session, in session order.
    pub sessions: Vec<String>,
    pub known: Vec<String>,
}

pub(crate) enum RoomEvent {
    CreateRoom {
        room_token: String,
    },
    Connect,
    JoinRoom {
        room: RoomInfo,
    },
    Leave {
        target: Option<String>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    Shutdown,
    Lobby(Value),
    SubChannel {
        channel: String,
        payload: Value,
    },
    SubChannelOpened {
        channel: String,
    },
    Link {
        channel: String,
        signal: LinkSignal,
    },
    LocalDescription {
        channel: String,
        result: Result<SessionDescription, LinkError>,
    },
    RemoteApplied {
        channel: String,
        result: Result<(), LinkError>,
    },
    Announce,
    RetryCandidates {
        channel: String,
    },
}

/// Forwards relay traffic into the room manager inbox until either side goes
/// away. `opened` is posted once before the first message. The channel is
/// released when the pump ends or is aborted.
pub(crate) fn spawn_relay_pump<F>(
    mut channel: RelayChannel,
    inbox: mpsc::UnboundedSender<RoomEvent>,
    opened: Option<RoomEvent>,
    wrap: F,
) -> JoinHandle<()>
where
    F: Fn(Value) -> RoomEvent + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(opened) = opened {
            if inbox.send(opened).is_err() {
                return;
            }
        }
        loop {
            match channel.recv().await {
                Ok(envelope) => {
                    if inbox.send(wrap(envelope.payload)).is_err() {
                        break;
                    }
                }
                Err(RelayError::Lagged { skipped, .. }) => {
                    warn!(target = "mesh::relay", channel = channel.name(), skipped, "relay subscriber lagged");
                }
                Err(_) => break,
            }
        }
    })
}

pub(crate) struct RoomManager {
    env: SessionEnv,
    inbox: mpsc::UnboundedReceiver<RoomEvent>,
    lobby: String,
    sessions: Vec<PeerSession>,
    /// Relay pumps of sessions whose link closed first; a late `left` or
    /// broadcaster handoff can still arrive on them.
    lingering: HashMap<String, JoinHandle<()>>,
    known: HashSet<String>,
    discovered: HashSet<RoomInfo>,
    room_token: Option<String>,
    is_broadcaster: bool,
    joined: bool,
    seeking: bool,
    announcer: Option<JoinHandle<()>>,
    lobby_pump: Option<JoinHandle<()>>,
}

impl RoomManager {
    /// Subscribes to the lobby right away so nothing published after
    /// construction is missed. Must be called inside a tokio runtime.
    pub fn new(env: SessionEnv, inbox: mpsc::UnboundedReceiver<RoomEvent>, lobby: String) -> Self {
        let lobby_channel = env.relay.open(&lobby);
        let lobby_pump = spawn_relay_pump(lobby_channel, env.inbox.clone(), None, RoomEvent::Lobby);
        Self {
            env,
            inbox,
            lobby,
            sessions: Vec::new(),
            lingering: HashMap::new(),
            known: HashSet::new(),
            discovered: HashSet::new(),
            room_token: None,
            is_broadcaster: false,
            joined: false,
            seeking: false,
            announcer: None,
            lobby_pump: Some(lobby_pump),
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.inbox.recv().await {
            if matches!(event, RoomEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.teardown();
    }

    fn handle(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::CreateRoom { room_token } => self.create_room(room_token),
            RoomEvent::Connect => {
                if !self.joined && !self.is_broadcaster {
                    self.seeking = true;
                }
            }
            RoomEvent::JoinRoom { room } => self.join_room(room),
            RoomEvent::Leave { target: Some(target) } => self.eject(&target),
            RoomEvent::Leave { target: None } => self.leave_all(),
            RoomEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RoomEvent::Shutdown => {}
            RoomEvent::Lobby(payload) => self.on_lobby(payload),
            RoomEvent::SubChannel { channel, payload } => self.on_sub_channel(channel, payload),
            RoomEvent::SubChannelOpened { channel } => {
                if let Some(idx) = self.session_index(&channel) {
                    self.sessions[idx].on_sub_channel_opened(&self.env);
                }
            }
            RoomEvent::Link { channel, signal } => self.on_link_event(&channel, signal),
            RoomEvent::LocalDescription { channel, result } => {
                if let Some(idx) = self.session_index(&channel) {
                    self.sessions[idx].on_local_description(&self.env, result);
                }
            }
            RoomEvent::RemoteApplied { channel, result } => {
                if let Some(idx) = self.session_index(&channel) {
                    self.sessions[idx].on_remote_applied(&self.env, result);
                }
            }
            RoomEvent::Announce => self.announce(),
            RoomEvent::RetryCandidates { channel } => {
                if let Some(idx) = self.session_index(&channel) {
                    self.sessions[idx].on_retry(&self.env);
                }
            }
        }
    }

    fn session_index(&self, channel: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.channel() == channel)
    }

    fn status(&self) -> RoomStatus {
        let mut known: Vec<String> = self.known.iter().cloned().collect();
        known.sort();
        RoomStatus {
            room_token: self.room_token.clone(),
            is_broadcaster: self.is_broadcaster,
            joined: self.joined,
            seeking: self.seeking,
            sessions: self
                .sessions
                .iter()
                .map(|session| {
                    session
                        .remote_token()
                        .unwrap_or(session.channel())
                        .to_string()
                })
                .collect(),
            known,
        }
    }

    fn create_room(&mut self, room_token: String) {
        info!(target = "mesh::room", room = %room_token, user_token = %self.env.user_token, "acting as broadcaster");
        self.room_token = Some(room_token);
        self.is_broadcaster = true;
        self.seeking = false;
        if let Some(announcer) = self.announcer.take() {
            announcer.abort();
        }
        self.announce();
        if self.env.config.transmit_room_once {
            return;
        }
        let inbox = self.env.inbox.clone();
        let period = self.env.config.announce_interval;
        self.announcer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if inbox.send(RoomEvent::Announce).is_err() {
                    break;
                }
            }
        }));
    }

    fn announce(&self) {
        let (true, Some(room_token)) = (self.is_broadcaster, &self.room_token) else {
            return;
        };
        self.env.publish(
            &self.lobby,
            &RelayMessage::room_announcement(&self.env.user_token, room_token),
        );
    }

    fn join_room(&mut self, room: RoomInfo) {
        if self.joined || self.is_broadcaster {
            debug!(target = "mesh::room", room = %room.id, "already in a room; join ignored");
            return;
        }
        info!(target = "mesh::room", room = %room.id, owner = %room.owner, "joining room");
        self.room_token = Some(room.id);
        self.seeking = false;
        self.joined = true;
        self.known.insert(room.owner.clone());

        let channel = self.env.user_token.clone();
        self.open_session(channel, Role::Answerer, None);
        self.env.publish(
            &self.lobby,
            &RelayMessage::join_request(&self.env.user_token, &room.owner, None),
        );
    }

    fn open_session(&mut self, channel: String, role: Role, remote: Option<String>) {
        if self.session_index(&channel).is_some() {
            warn!(target = "mesh::room", channel = %channel, "session already exists on channel");
            return;
        }
        if let Some(pump) = self.lingering.remove(&channel) {
            pump.abort();
        }
        let session = PeerSession::start(&self.env, channel, role, remote);
        self.sessions.push(session);
    }

    fn parse(&self, payload: Value, channel: &str) -> Option<RelayMessage> {
        let message = match RelayMessage::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "mesh::room", channel, error = %err, "dropping malformed relay message");
                return None;
            }
        };
        if message.is_from(&self.env.user_token) {
            trace!(target = "mesh::room", channel, "echo suppressed");
            return None;
        }
        Some(message)
    }

    fn on_lobby(&mut self, payload: Value) {
        let lobby = self.lobby.clone();
        let Some(message) = self.parse(payload, &lobby) else {
            return;
        };

        if self.seeking {
            if let (Some(id), Some(owner)) = (&message.room_token, &message.broadcaster) {
                if owner != &self.env.user_token {
                    self.on_room_discovered(RoomInfo {
                        id: id.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        if let Some(participant) = &message.new_participant {
            self.on_new_participant(participant);
        }

        if message.participant && message.join_user.as_deref() == Some(self.env.user_token.as_str()) {
            if let Some(remote) = &message.user_token {
                if self.known.insert(remote.clone()) {
                    let channel = message.channel.clone().unwrap_or_else(|| remote.clone());
                    debug!(target = "mesh::room", remote = %remote, channel = %channel, "opening offerer session");
                    self.open_session(channel, Role::Offerer, Some(remote.clone()));
                }
            }
        }
    }

    fn on_room_discovered(&mut self, room: RoomInfo) {
        if !self.discovered.insert(room.clone()) {
            return;
        }
        debug!(target = "mesh::room", room = %room.id, owner = %room.owner, "room discovered");
        self.env.emit(MeshEvent::RoomDiscovered(room.clone()));
        if self.env.config.auto_join {
            self.join_room(room);
        }
    }

    fn on_new_participant(&mut self, participant: &str) {
        if !(self.joined || self.is_broadcaster) {
            return;
        }
        if participant.is_empty()
            || participant == self.env.user_token
            || !self.known.insert(participant.to_string())
        {
            return;
        }
        let channel = Uuid::new_v4().to_string();
        debug!(target = "mesh::room", remote = %participant, channel = %channel, "introducing to new participant");
        self.open_session(channel.clone(), Role::Answerer, Some(participant.to_string()));
        self.env.publish(
            &self.lobby,
            &RelayMessage::join_request(&self.env.user_token, participant, Some(&channel)),
        );
    }

    fn on_sub_channel(&mut self, channel: String, payload: Value) {
        let Some(message) = self.parse(payload, &channel) else {
            return;
        };
        if let Some(idx) = self.session_index(&channel) {
            self.sessions[idx].on_relay_message(&self.env, &message);
        }
        if message.play_role_of_broadcaster {
            self.on_play_role_of_broadcaster(&message);
        }
        if message.left {
            self.on_left(&channel, &message);
        }
    }

    fn on_play_role_of_broadcaster(&mut self, message: &RelayMessage) {
        let Some(room_token) = message.room_token.clone().or_else(|| self.room_token.clone()) else {
            warn!(target = "mesh::room", "broadcaster handoff without a room token");
            return;
        };
        info!(target = "mesh::room", from = ?message.user_token, room = %room_token, "taking over as broadcaster");
        self.create_room(room_token);
    }

    fn on_left(&mut self, channel: &str, message: &RelayMessage) {
        let departed = message
            .user_token
            .clone()
            .unwrap_or_else(|| channel.to_string());
        info!(target = "mesh::room", remote = %departed, close_entire = message.close_entire_session, "peer left");

        if let Some(idx) = self.session_index(channel) {
            if let Some(pump) = self.close_session(idx) {
                pump.abort();
            }
        }
        if let Some(pump) = self.lingering.remove(channel) {
            pump.abort();
        }
        self.known.remove(&departed);

        if message.close_entire_session {
            self.leave_all();
        } else {
            self.env
                .publish(channel, &RelayMessage::left(&self.env.user_token, false));
        }
        self.env.emit(MeshEvent::Left {
            user_token: departed,
        });
    }

    fn on_link_event(&mut self, channel: &str, signal: LinkSignal) {
        let Some(idx) = self.session_index(channel) else {
            return;
        };
        match self.sessions[idx].on_link_event(&self.env, signal) {
            LinkOutcome::Nothing => {}
            LinkOutcome::Opened => self.fan_out(idx),
            LinkOutcome::Closed => {
                if let Some(pump) = self.close_session(idx) {
                    self.lingering.insert(channel.to_string(), pump);
                }
            }
        }
    }

    /// Introduces a newly opened peer to the rest of the room.
    fn fan_out(&self, idx: usize) {
        if !self.is_broadcaster || self.known.len() < 2 {
            return;
        }
        let session = &self.sessions[idx];
        let participant = session.remote_token().unwrap_or(session.channel());
        debug!(target = "mesh::room", participant, known = self.known.len(), "announcing new participant");
        self.env.publish(
            &self.lobby,
            &RelayMessage::new_participant(&self.env.user_token, participant),
        );
    }

    fn close_session(&mut self, idx: usize) -> Option<JoinHandle<()>> {
        let mut session = self.sessions.remove(idx);
        if let Some(remote) = session.remote_token() {
            self.known.remove(remote);
        }
        session.close(&self.env)
    }

    fn eject(&mut self, target: &str) {
        let Some(idx) = self
            .sessions
            .iter()
            .position(|session| session.remote_token() == Some(target))
        else {
            warn!(target = "mesh::room", remote = %target, "eject: no session for peer");
            return;
        };
        let close_entire = self.is_broadcaster && self.env.config.auto_close_entire_session;
        let channel = self.sessions[idx].channel().to_string();
        self.env.publish(
            &channel,
            &RelayMessage::left(&self.env.user_token, close_entire),
        );
        if let Some(pump) = self.close_session(idx) {
            pump.abort();
        }
        info!(target = "mesh::room", remote = %target, "peer ejected");
    }

    fn leave_all(&mut self) {
        let close_entire = self.is_broadcaster && self.env.config.auto_close_entire_session;
        if self.is_broadcaster && !close_entire {
            if let (Some(successor), Some(room_token)) = (self.sessions.first(), &self.room_token) {
                debug!(target = "mesh::room", channel = %successor.channel(), "handing off broadcaster role");
                self.env.publish(
                    successor.channel(),
                    &RelayMessage::play_role_of_broadcaster(&self.env.user_token, room_token),
                );
            }
        }

        let alert = RelayMessage::left(&self.env.user_token, close_entire);
        for session in &self.sessions {
            self.env.publish(session.channel(), &alert);
        }
        let closing = self.sessions.len();
        while !self.sessions.is_empty() {
            if let Some(pump) = self.close_session(0) {
                pump.abort();
            }
        }
        for (_, pump) in self.lingering.drain() {
            pump.abort();
        }
        if let Some(announcer) = self.announcer.take() {
            announcer.abort();
        }
        info!(target = "mesh::room", sessions = closing, close_entire, "left room");

        self.room_token = None;
        self.is_broadcaster = false;
        self.joined = false;
        self.seeking = false;
        self.known.clear();
        self.discovered.clear();
    }

    fn teardown(&mut self) {
        while !self.sessions.is_empty() {
            if let Some(pump) = self.close_session(0) {
                pump.abort();
            }
        }
        for handle in self
            .lingering
            .drain()
            .map(|(_, pump)| pump)
            .chain(self.announcer.take())
            .chain(self.lobby_pump.take())
        {
            handle.abort();
        }
        debug!(target = "mesh::room", user_token = %self.env.user_token, "room manager stopped");
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        for handle in self.announcer.take().into_iter().chain(self.lobby_pump.take()) {
            handle.abort();
        }
    }
}
