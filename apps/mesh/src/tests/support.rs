use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_bus::LocalRelay;
use tokio::sync::mpsc;

use crate::transport::loopback::LoopbackNetwork;
use crate::transport::{
    IceCandidate, LinkError, LinkEvent, PeerLink, PeerLinkFactory, Role, SessionDescription,
};
use crate::{DataChannel, MeshConfig, MeshEvent, RoomStatus};

pub const LOBBY: &str = "mesh-lobby";
const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(5);

pub fn fast_config() -> MeshConfig {
    MeshConfig::default()
        .with_announce_interval(Duration::from_millis(10))
        .with_candidate_retry_interval(Duration::from_millis(10))
        .with_chunk_interval(Duration::from_millis(1))
}

pub struct Participant {
    pub channel: DataChannel,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
}

pub fn participant(
    relay: &Arc<LocalRelay>,
    links: Arc<dyn PeerLinkFactory>,
    name: &str,
    config: MeshConfig,
) -> Participant {
    let channel =
        DataChannel::new(LOBBY, Some(name), relay.clone(), links, config).expect("data channel");
    let events = channel.events().expect("event stream");
    Participant { channel, events }
}

pub fn loopback(relay: &Arc<LocalRelay>, network: &LoopbackNetwork, name: &str) -> Participant {
    participant(relay, Arc::new(network.clone()), name, fast_config())
}

pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn status_until<F>(channel: &DataChannel, what: &str, mut check: F) -> RoomStatus
where
    F: FnMut(&RoomStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = channel.status().await.expect("status");
        if check(&status) {
            return status;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}; last status {status:?}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn next_matching<F>(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    what: &str,
    mut pred: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed while waiting for {what}"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Events already queued, without waiting.
pub fn drain(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// Loopback links that record which negotiation calls they received.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    network: LoopbackNetwork,
    logs: Arc<Mutex<Vec<CallLog>>>,
    raisers: Arc<Mutex<Vec<mpsc::UnboundedSender<LinkEvent>>>>,
}

impl RecordingFactory {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn logs(&self) -> Vec<Vec<&'static str>> {
        self.logs.lock().iter().map(|log| log.lock().clone()).collect()
    }

    /// Every call made on any recorded link, flattened.
    pub fn calls(&self) -> Vec<&'static str> {
        self.logs().into_iter().flatten().collect()
    }

    /// Delivers `event` to the owner of every recorded link as if the link
    /// itself had reported it.
    pub fn raise(&self, event: LinkEvent) {
        for raiser in self.raisers.lock().iter() {
            let _ = raiser.send(event.clone());
        }
    }
}

impl PeerLinkFactory for RecordingFactory {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        self.raisers.lock().push(events.clone());
        let inner = self.network.create(role, events)?;
        let log = CallLog::default();
        self.logs.lock().push(log.clone());
        Ok(Arc::new(RecordingLink { inner, log }))
    }
}

struct RecordingLink {
    inner: Arc<dyn PeerLink>,
    log: CallLog,
}

#[async_trait]
impl PeerLink for RecordingLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.log.lock().push("offer");
        self.inner.create_offer().await
    }

    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        self.log.lock().push("answer");
        self.inner.create_answer(offer).await
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        self.log.lock().push("remote_answer");
        self.inner.set_remote_answer(answer).await
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.log.lock().push("candidate");
        self.inner.add_remote_candidate(candidate).await
    }

    fn send(&self, frame: Bytes) {
        self.inner.send(frame);
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&self) {
        self.inner.close();
    }
}
