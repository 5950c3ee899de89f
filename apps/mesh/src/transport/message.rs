use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::PeerLink;
use super::chunk::{
    AssemblerConfig, ChunkError, LinkFrame, MessageAssembler, Payload, decode_frame, encode_chunk,
    split_message,
};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Splits payloads into chunks and writes them to open links with a fixed
/// delay between consecutive chunks.
#[derive(Debug, Clone)]
pub struct ChunkedSender {
    chunk_size: usize,
    interval: Duration,
}

impl ChunkedSender {
    pub fn new(chunk_size: usize, interval: Duration) -> Self {
        Self {
            chunk_size,
            interval,
        }
    }

    /// Sends `payload` to every target that is open at the time each chunk is
    /// written. Returns the number of chunks produced.
    pub async fn send(
        &self,
        payload: &Payload,
        targets: &[Arc<dyn PeerLink>],
    ) -> Result<usize, ChunkError> {
        let (text, is_object) = payload.to_wire()?;
        let transfer_id = Uuid::new_v4().to_string();
        let chunks = split_message(&text, self.chunk_size, &transfer_id, now_millis(), is_object)?;

        let mut sent = 0usize;
        for chunk in chunks {
            if sent > 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            let frame = encode_chunk(&chunk)?;
            let mut delivered = 0usize;
            for link in targets.iter().filter(|link| link.is_open()) {
                link.send(frame.clone());
                delivered += 1;
            }
            trace!(
                target = "mesh::transport",
                transfer_id = %transfer_id,
                seq = ?chunk.seq,
                last = chunk.last,
                links = delivered,
                "chunk sent"
            );
            sent += 1;
        }
        debug!(
            target = "mesh::transport",
            transfer_id = %transfer_id,
            chunks = sent,
            targets = targets.len(),
            "transfer sent"
        );
        Ok(sent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub origin: String,
    pub payload: Payload,
    pub latency: Duration,
}

/// Reassembles frames from every link into completed deliveries.
#[derive(Debug)]
pub struct ChunkedReceiver {
    assembler: MessageAssembler,
}

impl ChunkedReceiver {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            assembler: MessageAssembler::new(config),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.assembler.in_flight()
    }

    pub fn receive(&mut self, origin: &str, frame: &[u8]) -> Option<Delivery> {
        let chunk = match decode_frame(frame) {
            Ok(LinkFrame::Chunk(chunk)) => chunk,
            Ok(LinkFrame::Raw(value)) => {
                return Some(Delivery {
                    origin: origin.to_string(),
                    payload: Payload::Object(value),
                    latency: Duration::ZERO,
                });
            }
            Err(err) => {
                debug!(target = "mesh::transport", origin, error = %err, "dropping malformed frame");
                return None;
            }
        };

        let now = Instant::now();
        for event in self.assembler.gc(now) {
            warn!(
                target = "mesh::transport",
                transfer_id = %event.transfer_id,
                reason = ?event.reason,
                "discarded stale transfer"
            );
        }

        let outcome = match self.assembler.ingest(chunk, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target = "mesh::transport", origin, error = %err, "discarding transfer");
                return None;
            }
        };
        for event in outcome.gc_events {
            warn!(
                target = "mesh::transport",
                transfer_id = %event.transfer_id,
                reason = ?event.reason,
                "evicted transfer"
            );
        }
        let assembled = outcome.completed?;
        let latency = Duration::from_millis(now_millis().saturating_sub(assembled.sending_time_ms));
        trace!(
            target = "mesh::transport",
            origin,
            transfer_id = %assembled.transfer_id,
            latency_ms = latency.as_millis() as u64,
            "transfer complete"
        );
        Some(Delivery {
            origin: origin.to_string(),
            payload: assembled.payload,
            latency,
        })
    }
}
