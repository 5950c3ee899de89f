//! In-process Peer Link. Two endpoints find each other through the endpoint
//! id embedded in their session descriptions, so negotiation still has to go
//! through a real offer/answer and candidate exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    IceCandidate, LinkError, LinkEvent, PeerLink, PeerLinkFactory, Role, SdpKind,
    SessionDescription,
};

const ENDPOINT_ATTR: &str = "a=loopback-endpoint:";
const FIRST_PORT: u16 = 40000;

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<String, Weak<LoopbackLink>>>,
    next_port: AtomicU16,
}

impl NetworkInner {
    fn lookup(&self, id: &str) -> Option<Arc<LoopbackLink>> {
        self.endpoints.lock().get(id).and_then(Weak::upgrade)
    }
}

/// Factory for loopback links. Clones share one endpoint namespace.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints that are still alive.
    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl PeerLinkFactory for LoopbackNetwork {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let port = FIRST_PORT.wrapping_add(self.inner.next_port.fetch_add(1, Ordering::Relaxed));
        let link = Arc::new(LoopbackLink {
            id: Uuid::new_v4().to_string(),
            network: Arc::downgrade(&self.inner),
            events,
            state: Mutex::new(LinkState {
                port,
                ..LinkState::default()
            }),
        });
        let mut endpoints = self.inner.endpoints.lock();
        endpoints.retain(|_, weak| weak.strong_count() > 0);
        endpoints.insert(link.id.clone(), Arc::downgrade(&link));
        debug!(target = "mesh::loopback", endpoint = %link.id, ?role, "loopback link created");
        Ok(link)
    }
}

#[derive(Debug, Default)]
struct LinkState {
    port: u16,
    remote: Option<String>,
    remote_candidates: usize,
    open: bool,
    closed: bool,
}

pub struct LoopbackLink {
    id: String,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    fn render_sdp(&self, setup: &str) -> String {
        format!(
            "v=0\r\n\
             o=- {session} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             c=IN IP4 0.0.0.0\r\n\
             b=AS:30\r\n\
             {ENDPOINT_ATTR}{id}\r\n\
             a=setup:{setup}\r\n",
            session = self.state.lock().port,
            id = self.id,
        )
    }

    fn local_candidate(&self) -> IceCandidate {
        let port = self.state.lock().port;
        IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.state.lock().closed {
            return;
        }
        let _ = self.events.send(event);
    }

    fn bind_remote(&self, description: &SessionDescription) -> Result<(), LinkError> {
        let remote = parse_endpoint(&description.sdp)
            .ok_or_else(|| LinkError::Description("missing loopback endpoint".into()))?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        state.remote = Some(remote);
        Ok(())
    }

    fn maybe_open(&self) {
        let opened = {
            let mut state = self.state.lock();
            let ready = state.remote.is_some() && state.remote_candidates > 0;
            if ready && !state.open && !state.closed {
                state.open = true;
                true
            } else {
                false
            }
        };
        if opened {
            trace!(target = "mesh::loopback", endpoint = %self.id, "link open");
            self.emit(LinkEvent::Open);
        }
    }

    fn peer(&self) -> Option<Arc<LoopbackLink>> {
        let remote = self.state.lock().remote.clone()?;
        self.network.upgrade()?.lookup(&remote)
    }

    fn remote_closed(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.open = false;
        }
        self.emit(LinkEvent::Close);
        self.state.lock().closed = true;
    }
}

fn parse_endpoint(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim_end_matches('\r').strip_prefix(ENDPOINT_ATTR))
        .map(str::to_string)
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        if self.state.lock().closed {
            return Err(LinkError::Closed);
        }
        let offer = SessionDescription::offer(self.render_sdp("actpass"));
        self.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        Ok(offer)
    }

    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        if offer.kind != SdpKind::Offer {
            return Err(LinkError::Description("expected an offer".into()));
        }
        self.bind_remote(&offer)?;
        let answer = SessionDescription::answer(self.render_sdp("active"));
        self.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        self.maybe_open();
        Ok(answer)
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        if answer.kind != SdpKind::Answer {
            return Err(LinkError::Description("expected an answer".into()));
        }
        self.bind_remote(&answer)?;
        self.maybe_open();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LinkError::Closed);
            }
            if state.remote.is_none() {
                return Err(LinkError::Candidate(format!(
                    "no remote description for {}",
                    candidate.candidate
                )));
            }
            state.remote_candidates += 1;
        }
        self.maybe_open();
        Ok(())
    }

    fn send(&self, frame: Bytes) {
        if !self.is_open() {
            return;
        }
        if let Some(peer) = self.peer() {
            peer.emit(LinkEvent::Message(frame));
        }
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.open && !state.closed
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.open = false;
        }
        self.emit(LinkEvent::Close);
        self.state.lock().closed = true;
        if let Some(peer) = self.peer() {
            peer.remote_closed();
        }
        debug!(target = "mesh::loopback", endpoint = %self.id, "link closed");
    }
}
