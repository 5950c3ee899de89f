use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relay_bus::Relay;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::signaling::RelayMessage;
use super::{MeshEvent, RoomEvent};
use crate::config::MeshConfig;
use crate::context::MeshContext;
use crate::transport::chunk::{SdpPart, SdpSlots, normalize_bandwidth, split_sdp};
use crate::transport::message::ChunkedReceiver;
use crate::transport::{
    IceCandidate, LinkError, LinkEvent, PeerLink, PeerLinkFactory, Role, SessionDescription,
};

/// Open links keyed by remote user token.
pub type LinkRegistry = Arc<RwLock<HashMap<String, Arc<dyn PeerLink>>>>;

/// Everything a session needs from its owner, shared by all sessions.
pub(crate) struct SessionEnv {
    pub user_token: String,
    pub relay: Arc<dyn Relay>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub inbox: mpsc::UnboundedSender<RoomEvent>,
    pub events: mpsc::UnboundedSender<MeshEvent>,
    pub config: MeshConfig,
    pub context: Arc<MeshContext>,
    pub registry: LinkRegistry,
    pub receiver: Arc<Mutex<ChunkedReceiver>>,
}

impl SessionEnv {
    pub fn publish(&self, channel: &str, message: &RelayMessage) {
        let payload = match message.to_value() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "mesh::session", channel, error = %err, "failed to encode relay message");
                return;
            }
        };
        if let Err(err) = self.relay.publish(channel, payload) {
            debug!(target = "mesh::session", channel, error = %err, "relay publish failed");
        }
    }

    pub fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    AwaitingLocalSdp,
    SendingSdp,
    AwaitingRemoteSdp,
    Negotiating,
    Open,
    Closed,
}

/// Link events routed through the room manager. Application frames are
/// delivered straight from the link pump and never become a signal.
#[derive(Debug)]
pub(crate) enum LinkSignal {
    LocalCandidate(IceCandidate),
    Open,
    Close,
    Error(String),
}

/// What the room manager has to do after a link event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkOutcome {
    Nothing,
    Opened,
    Closed,
}

/// Handshake state for one remote participant on one relay sub-channel.
pub(crate) struct PeerSession {
    channel: String,
    remote_token: Option<String>,
    role: Role,
    state: SessionState,
    link: Option<Arc<dyn PeerLink>>,
    sdp: SdpSlots,
    assembled: bool,
    remote_applied: bool,
    sub_channel_ready: bool,
    outbound_candidates: VecDeque<IceCandidate>,
    inbound_candidates: VecDeque<IceCandidate>,
    relay_pump: Option<JoinHandle<()>>,
    link_pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Subscribes to `channel` and starts forwarding its traffic to the room
    /// manager. The role is fixed from here on.
    pub fn start(
        env: &SessionEnv,
        channel: String,
        role: Role,
        remote_token: Option<String>,
    ) -> Self {
        let handle = env.relay.open(&channel);
        let relay_pump = super::spawn_relay_pump(
            handle,
            env.inbox.clone(),
            Some(RoomEvent::SubChannelOpened {
                channel: channel.clone(),
            }),
            {
                let channel = channel.clone();
                move |payload| RoomEvent::SubChannel {
                    channel: channel.clone(),
                    payload,
                }
            },
        );
        let state = match role {
            Role::Offerer => SessionState::Idle,
            Role::Answerer => SessionState::AwaitingRemoteSdp,
        };
        debug!(
            target = "mesh::session",
            channel = %channel,
            remote = ?remote_token,
            ?role,
            "session created"
        );
        Self {
            channel,
            remote_token,
            role,
            state,
            link: None,
            sdp: SdpSlots::default(),
            assembled: false,
            remote_applied: false,
            sub_channel_ready: false,
            outbound_candidates: VecDeque::new(),
            inbound_candidates: VecDeque::new(),
            relay_pump: Some(relay_pump),
            link_pump: None,
            retry: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn remote_token(&self) -> Option<&str> {
        self.remote_token.as_deref()
    }

    fn label(&self) -> String {
        self.remote_token
            .clone()
            .unwrap_or_else(|| self.channel.clone())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(
                target = "mesh::session",
                channel = %self.channel,
                from = ?self.state,
                to = ?next,
                "state"
            );
            self.state = next;
        }
    }

    fn report(&self, env: &SessionEnv, error: &LinkError) {
        warn!(target = "mesh::session", channel = %self.channel, error = %error, "link error");
        env.emit(MeshEvent::Error {
            user_token: self.remote_token.clone(),
            error: error.to_string(),
        });
    }

    fn create_link(&mut self, env: &SessionEnv) -> Result<Arc<dyn PeerLink>, LinkError> {
        if let Some(link) = &self.link {
            return Ok(link.clone());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = env.links.create(self.role, tx)?;
        self.link = Some(link.clone());

        let channel = self.channel.clone();
        let origin = self.label();
        let inbox = env.inbox.clone();
        let events = env.events.clone();
        let receiver = env.receiver.clone();
        self.link_pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let signal = match event {
                    LinkEvent::Message(frame) => {
                        let delivery = receiver.lock().receive(&origin, &frame);
                        if let Some(delivery) = delivery {
                            let _ = events.send(MeshEvent::Message {
                                user_token: delivery.origin,
                                payload: delivery.payload,
                                latency: delivery.latency,
                            });
                        }
                        continue;
                    }
                    LinkEvent::LocalCandidate(candidate) => LinkSignal::LocalCandidate(candidate),
                    LinkEvent::Open => LinkSignal::Open,
                    LinkEvent::Close => LinkSignal::Close,
                    LinkEvent::Error(error) => LinkSignal::Error(error),
                };
                let routed = RoomEvent::Link {
                    channel: channel.clone(),
                    signal,
                };
                if inbox.send(routed).is_err() {
                    break;
                }
            }
        }));
        Ok(link)
    }

    pub fn on_sub_channel_opened(&mut self, env: &SessionEnv) {
        if self.state == SessionState::Closed {
            return;
        }
        self.sub_channel_ready = true;
        self.flush_outbound(env);

        if self.role != Role::Offerer || self.link.is_some() {
            return;
        }
        let link = match self.create_link(env) {
            Ok(link) => link,
            Err(err) => {
                self.report(env, &err);
                return;
            }
        };
        self.transition(SessionState::AwaitingLocalSdp);
        let inbox = env.inbox.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let result = link.create_offer().await;
            let _ = inbox.send(RoomEvent::LocalDescription { channel, result });
        });
    }

    pub fn on_local_description(
        &mut self,
        env: &SessionEnv,
        result: Result<SessionDescription, LinkError>,
    ) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut description = match result {
            Ok(description) => description,
            Err(err) => {
                self.report(env, &err);
                return;
            }
        };
        description.sdp = normalize_bandwidth(&description.sdp);
        let serialized = match serde_json::to_string(&description) {
            Ok(serialized) => serialized,
            Err(err) => {
                self.report(env, &LinkError::Description(err.to_string()));
                return;
            }
        };

        self.transition(SessionState::SendingSdp);
        let parts = split_sdp(&serialized);
        for (part, text) in [
            (SdpPart::First, parts.first),
            (SdpPart::Second, parts.second),
            (SdpPart::Third, parts.third),
        ] {
            env.publish(
                &self.channel,
                &RelayMessage::sdp_part(&env.user_token, part, text),
            );
        }
        debug!(
            target = "mesh::session",
            channel = %self.channel,
            kind = ?description.kind,
            bytes = serialized.len(),
            "local description sent"
        );
        self.transition(match self.role {
            Role::Offerer => SessionState::AwaitingRemoteSdp,
            Role::Answerer => SessionState::Negotiating,
        });
    }

    /// Handles SDP parts and candidates arriving on this session's channel.
    pub fn on_relay_message(&mut self, env: &SessionEnv, message: &RelayMessage) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut filled = false;
        for (part, text) in message.sdp_parts() {
            if part == SdpPart::First && self.remote_token.is_none() {
                self.remote_token = message.user_token.clone();
            }
            self.sdp.insert(part, text.to_string());
            filled = true;
        }
        if filled && self.sdp.is_complete() && !self.assembled {
            self.assemble(env);
        }

        if let Some(candidate) = &message.candidate {
            if self.state == SessionState::Open {
                trace!(target = "mesh::session", channel = %self.channel, "candidate after open ignored");
            } else {
                self.inbound_candidates.push_back(candidate.clone());
                self.flush_inbound(env);
            }
        }
    }

    fn assemble(&mut self, env: &SessionEnv) {
        self.assembled = true;
        let Some(text) = self.sdp.assemble() else {
            return;
        };
        let mut description: SessionDescription = match serde_json::from_str(&text) {
            Ok(description) => description,
            Err(err) => {
                self.report(env, &LinkError::Description(err.to_string()));
                return;
            }
        };
        description.sdp = normalize_bandwidth(&description.sdp);
        debug!(
            target = "mesh::session",
            channel = %self.channel,
            kind = ?description.kind,
            "remote description assembled"
        );

        let link = match self.role {
            Role::Offerer => match &self.link {
                Some(link) => link.clone(),
                None => {
                    warn!(target = "mesh::session", channel = %self.channel, "answer arrived before offer");
                    return;
                }
            },
            Role::Answerer => match self.create_link(env) {
                Ok(link) => link,
                Err(err) => {
                    self.report(env, &err);
                    return;
                }
            },
        };

        let inbox = env.inbox.clone();
        let channel = self.channel.clone();
        match self.role {
            Role::Offerer => {
                self.transition(SessionState::Negotiating);
                tokio::spawn(async move {
                    let result = link.set_remote_answer(description).await;
                    let _ = inbox.send(RoomEvent::RemoteApplied { channel, result });
                });
            }
            Role::Answerer => {
                self.transition(SessionState::AwaitingLocalSdp);
                tokio::spawn(async move {
                    match link.create_answer(description).await {
                        Ok(answer) => {
                            let _ = inbox.send(RoomEvent::RemoteApplied {
                                channel: channel.clone(),
                                result: Ok(()),
                            });
                            let _ = inbox.send(RoomEvent::LocalDescription {
                                channel,
                                result: Ok(answer),
                            });
                        }
                        Err(err) => {
                            let _ = inbox.send(RoomEvent::RemoteApplied {
                                channel,
                                result: Err(err),
                            });
                        }
                    }
                });
            }
        }
    }

    pub fn on_remote_applied(&mut self, env: &SessionEnv, result: Result<(), LinkError>) {
        if self.state == SessionState::Closed {
            return;
        }
        match result {
            Ok(()) => {
                self.remote_applied = true;
                self.flush_inbound(env);
            }
            Err(err) => {
                // Nothing can be applied without a remote description.
                self.inbound_candidates.clear();
                self.report(env, &err);
            }
        }
    }

    pub fn on_retry(&mut self, env: &SessionEnv) {
        if self.state == SessionState::Closed {
            return;
        }
        self.flush_outbound(env);
        self.flush_inbound(env);
        if self.outbound_candidates.is_empty() && self.inbound_candidates.is_empty() {
            if let Some(retry) = self.retry.take() {
                retry.abort();
            }
        }
    }

    pub fn on_link_event(&mut self, env: &SessionEnv, signal: LinkSignal) -> LinkOutcome {
        if self.state == SessionState::Closed {
            return LinkOutcome::Nothing;
        }
        match signal {
            LinkSignal::LocalCandidate(candidate) => {
                env.context.observe_candidate(&candidate.candidate);
                self.outbound_candidates.push_back(candidate);
                self.flush_outbound(env);
                LinkOutcome::Nothing
            }
            LinkSignal::Open => {
                if self.state == SessionState::Open {
                    return LinkOutcome::Nothing;
                }
                self.transition(SessionState::Open);
                self.inbound_candidates.clear();
                let user_token = self.label();
                if let Some(link) = &self.link {
                    env.registry.write().insert(user_token.clone(), link.clone());
                }
                if env.context.mark_connection_opened() {
                    info!(target = "mesh::session", remote = %user_token, "first peer connection opened");
                }
                info!(target = "mesh::session", channel = %self.channel, remote = %user_token, "peer link open");
                env.emit(MeshEvent::Opened { user_token });
                LinkOutcome::Opened
            }
            LinkSignal::Close => LinkOutcome::Closed,
            LinkSignal::Error(error) => {
                warn!(target = "mesh::session", channel = %self.channel, %error, "link reported error");
                env.emit(MeshEvent::Error {
                    user_token: self.remote_token.clone(),
                    error,
                });
                LinkOutcome::Nothing
            }
        }
    }

    fn flush_outbound(&mut self, env: &SessionEnv) {
        if self.outbound_candidates.is_empty() {
            return;
        }
        if !self.sub_channel_ready {
            self.ensure_retry(env);
            return;
        }
        while let Some(candidate) = self.outbound_candidates.pop_front() {
            env.publish(
                &self.channel,
                &RelayMessage::candidate(&env.user_token, candidate),
            );
        }
    }

    fn flush_inbound(&mut self, env: &SessionEnv) {
        if self.inbound_candidates.is_empty() {
            return;
        }
        let Some(link) = self.link.clone().filter(|_| self.remote_applied) else {
            self.ensure_retry(env);
            return;
        };
        let pending: Vec<IceCandidate> = self.inbound_candidates.drain(..).collect();
        for candidate in &pending {
            env.context.observe_candidate(&candidate.candidate);
        }
        let events = env.events.clone();
        let remote = self.remote_token.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            for candidate in pending {
                if let Err(err) = link.add_remote_candidate(candidate).await {
                    warn!(target = "mesh::session", channel = %channel, error = %err, "candidate rejected");
                    let _ = events.send(MeshEvent::Error {
                        user_token: remote.clone(),
                        error: err.to_string(),
                    });
                }
            }
        });
    }

    fn ensure_retry(&mut self, env: &SessionEnv) {
        if self.retry.as_ref().is_some_and(|retry| !retry.is_finished()) {
            return;
        }
        let inbox = env.inbox.clone();
        let channel = self.channel.clone();
        let period = env.config.candidate_retry_interval;
        self.retry = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let tick = RoomEvent::RetryCandidates {
                    channel: channel.clone(),
                };
                if inbox.send(tick).is_err() {
                    break;
                }
            }
        }));
    }

    /// Releases the link and every timer. Returns the relay pump so the
    /// caller decides whether the channel keeps being observed.
    pub fn close(&mut self, env: &SessionEnv) -> Option<JoinHandle<()>> {
        if self.state == SessionState::Closed {
            return self.relay_pump.take();
        }
        self.transition(SessionState::Closed);
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(pump) = self.link_pump.take() {
            pump.abort();
        }
        self.outbound_candidates.clear();
        self.inbound_candidates.clear();

        if let Some(link) = self.link.take() {
            link.close();
            let user_token = self.label();
            {
                let mut registry = env.registry.write();
                if registry
                    .get(&user_token)
                    .is_some_and(|registered| Arc::ptr_eq(registered, &link))
                {
                    registry.remove(&user_token);
                }
            }
            env.emit(MeshEvent::Closed { user_token });
        }
        debug!(target = "mesh::session", channel = %self.channel, remote = ?self.remote_token, "session closed");
        self.relay_pump.take()
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        for handle in [
            self.retry.take(),
            self.link_pump.take(),
            self.relay_pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}
