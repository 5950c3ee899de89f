use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod chunk;
pub mod loopback;
pub mod message;

pub use chunk::Payload;

/// Which side of the offer/answer exchange a session plays. Fixed for the
/// lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as carried over the relay (`{"type": .., "sdp": ..}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Events a link reports back to its owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    Open,
    Message(Bytes),
    Close,
    Error(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("link closed")]
    Closed,
}

/// Point-to-point link between two established peers.
///
/// `send` is only meaningful once the link reported [`LinkEvent::Open`];
/// sending on a link that is not open is a silent no-op.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Applies `offer` as the remote description and produces the local answer.
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError>;

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    fn send(&self, frame: Bytes);

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Creates links; every event of the new link is delivered on `events`.
pub trait PeerLinkFactory: Send + Sync {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}
