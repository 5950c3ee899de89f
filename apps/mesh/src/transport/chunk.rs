use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const TEXT_FRAME_TYPE: &str = "text";
pub const BANDWIDTH_MARKER: &str = "b=";
pub const ZERO_BANDWIDTH: &str = "b=AS:0";
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("transfer {transfer_id}: expected chunk {expected}, got {got}")]
    OutOfOrder {
        transfer_id: String,
        expected: u32,
        got: u32,
    },
    #[error("chunk frame malformed: {0}")]
    Malformed(String),
}

/// Application payload. Objects travel as JSON text with the object flag set
/// so the receiver can decode them again.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Object(Value),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Object(value) => value.is_null(),
        }
    }

    pub fn to_wire(&self) -> Result<(String, bool), ChunkError> {
        match self {
            Payload::Text(text) => Ok((text.clone(), false)),
            Payload::Object(value) => serde_json::to_string(value)
                .map(|text| (text, true))
                .map_err(|err| ChunkError::Malformed(err.to_string())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Object(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Object(value)
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpPart {
    First,
    Second,
    Third,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpParts {
    pub first: String,
    pub second: String,
    pub third: String,
}

/// Splits a serialized session description into three slices with boundaries
/// at `len/3` and `2*len/3` (in characters).
pub fn split_sdp(sdp: &str) -> SdpParts {
    let len = sdp.chars().count();
    let part = len / 3;
    let first_end = byte_offset(sdp, part);
    if len > part * 2 {
        let second_end = byte_offset(sdp, part * 2);
        SdpParts {
            first: sdp[..first_end].to_string(),
            second: sdp[first_end..second_end].to_string(),
            third: sdp[second_end..].to_string(),
        }
    } else {
        // Only the empty string lands here; the second slice stops one short.
        let second_end = byte_offset(sdp, len.saturating_sub(1)).max(first_end);
        SdpParts {
            first: sdp[..first_end].to_string(),
            second: sdp[first_end..second_end].to_string(),
            third: String::new(),
        }
    }
}

pub fn assemble_sdp(parts: &SdpParts) -> String {
    let mut out = String::with_capacity(parts.first.len() + parts.second.len() + parts.third.len());
    out.push_str(&parts.first);
    out.push_str(&parts.second);
    out.push_str(&parts.third);
    out
}

/// Keyed slots for the three SDP parts; parts may arrive in any order.
#[derive(Debug, Default)]
pub struct SdpSlots {
    first: Option<String>,
    second: Option<String>,
    third: Option<String>,
}

impl SdpSlots {
    pub fn insert(&mut self, part: SdpPart, text: String) {
        match part {
            SdpPart::First => self.first = Some(text),
            SdpPart::Second => self.second = Some(text),
            SdpPart::Third => self.third = Some(text),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.first.is_some() && self.second.is_some() && self.third.is_some()
    }

    pub fn assemble(&self) -> Option<String> {
        match (&self.first, &self.second, &self.third) {
            (Some(first), Some(second), Some(third)) => Some(assemble_sdp(&SdpParts {
                first: first.clone(),
                second: second.clone(),
                third: third.clone(),
            })),
            _ => None,
        }
    }
}

/// Forces every bandwidth line to a zero-bandwidth directive, keeping the
/// line terminator intact.
pub fn normalize_bandwidth(sdp: &str) -> String {
    sdp.split('\n')
        .map(|line| {
            if !line.starts_with(BANDWIDTH_MARKER) {
                return line.to_string();
            }
            if line.ends_with('\r') {
                format!("{ZERO_BANDWIDTH}\r")
            } else {
                ZERO_BANDWIDTH.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One fragment of a text transfer as it travels on a peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(rename = "uuid")]
    pub transfer_id: String,
    #[serde(rename = "sendingTime")]
    pub sending_time: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub last: bool,
    #[serde(rename = "isobject", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_object: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    /// Position within the transfer. Older senders omit it; such chunks
    /// are taken to be next in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
}

/// Lazy chunk sequence produced by [`split_message`].
#[derive(Debug)]
pub struct MessageChunks<'a> {
    rest: &'a str,
    max_chunk: usize,
    transfer_id: String,
    sending_time: u64,
    is_object: bool,
    total_hint: u64,
    seq: u32,
    finished: bool,
}

impl Iterator for MessageChunks<'_> {
    type Item = MessageChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let (head, tail) = self.rest.split_at(byte_offset(self.rest, self.max_chunk));
        let last = tail.is_empty();
        let chunk = MessageChunk {
            transfer_id: self.transfer_id.clone(),
            sending_time: self.sending_time,
            message: head.to_string(),
            last,
            is_object: last && self.is_object,
            packets: (self.seq == 0).then_some(self.total_hint),
            seq: Some(self.seq),
        };
        self.rest = tail;
        self.seq = self.seq.saturating_add(1);
        self.finished = last;
        Some(chunk)
    }
}

pub fn split_message<'a>(
    text: &'a str,
    max_chunk: usize,
    transfer_id: &str,
    sending_time_ms: u64,
    is_object: bool,
) -> Result<MessageChunks<'a>, ChunkError> {
    if max_chunk == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    let total_hint = (text.chars().count() / max_chunk) as u64;
    Ok(MessageChunks {
        rest: text,
        max_chunk,
        transfer_id: transfer_id.to_string(),
        sending_time: sending_time_ms,
        is_object,
        total_hint,
        seq: 0,
        finished: false,
    })
}

#[derive(Serialize)]
struct TextFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    chunk: &'a MessageChunk,
}

/// Anything a peer link can carry: a text-transfer chunk or an arbitrary
/// JSON frame that is delivered as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    Chunk(MessageChunk),
    Raw(Value),
}

pub fn encode_chunk(chunk: &MessageChunk) -> Result<Bytes, ChunkError> {
    let frame = TextFrame {
        kind: TEXT_FRAME_TYPE,
        chunk,
    };
    serde_json::to_vec(&frame)
        .map(Bytes::from)
        .map_err(|err| ChunkError::Malformed(err.to_string()))
}

pub fn decode_frame(bytes: &[u8]) -> Result<LinkFrame, ChunkError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| ChunkError::Malformed(err.to_string()))?;
    if value.get("type").and_then(Value::as_str) != Some(TEXT_FRAME_TYPE) {
        return Ok(LinkFrame::Raw(value));
    }
    serde_json::from_value(value)
        .map(LinkFrame::Chunk)
        .map_err(|err| ChunkError::Malformed(err.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub max_inflight: usize,
    pub transfer_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub transfer_id: String,
    pub reason: GcReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub transfer_id: String,
    pub payload: Payload,
    pub sending_time_ms: u64,
}

#[derive(Debug, Default, PartialEq)]
pub struct IngestOutcome {
    pub completed: Option<Assembled>,
    pub gc_events: Vec<GcEvent>,
}

#[derive(Debug)]
struct PartialTransfer {
    created_at: Instant,
    parts: Vec<String>,
    next_seq: u32,
}

/// Reassembles text transfers. Chunks of one transfer must arrive in send
/// order; a gap discards the transfer.
#[derive(Debug)]
pub struct MessageAssembler {
    partials: HashMap<String, PartialTransfer>,
    config: AssemblerConfig,
}

impl MessageAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    pub fn ingest(&mut self, chunk: MessageChunk, now: Instant) -> Result<IngestOutcome, ChunkError> {
        let mut outcome = IngestOutcome::default();
        let MessageChunk {
            transfer_id,
            sending_time,
            message,
            last,
            is_object,
            seq,
            ..
        } = chunk;
        let seq = seq.unwrap_or_else(|| {
            self.partials
                .get(&transfer_id)
                .map_or(0, |partial| partial.next_seq)
        });

        if seq == 0 && last {
            self.partials.remove(&transfer_id);
            outcome.completed = Some(Assembled {
                payload: decode_payload(message, is_object)?,
                transfer_id,
                sending_time_ms: sending_time,
            });
            return Ok(outcome);
        }

        if seq == 0
            && !self.partials.contains_key(&transfer_id)
            && self.partials.len() >= self.config.max_inflight
        {
            if let Some(evicted) = self.evict_oldest() {
                outcome.gc_events.push(evicted);
            }
        }

        let entry = match self.partials.entry(transfer_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                if seq != 0 {
                    return Err(ChunkError::OutOfOrder {
                        transfer_id,
                        expected: 0,
                        got: seq,
                    });
                }
                slot.insert(PartialTransfer {
                    created_at: now,
                    parts: Vec::new(),
                    next_seq: 0,
                })
            }
        };

        if entry.next_seq != seq {
            let expected = entry.next_seq;
            self.partials.remove(&transfer_id);
            return Err(ChunkError::OutOfOrder {
                transfer_id,
                expected,
                got: seq,
            });
        }
        entry.parts.push(message);
        entry.next_seq = entry.next_seq.saturating_add(1);

        if last {
            if let Some(partial) = self.partials.remove(&transfer_id) {
                outcome.completed = Some(Assembled {
                    payload: decode_payload(partial.parts.concat(), is_object)?,
                    transfer_id,
                    sending_time_ms: sending_time,
                });
            }
        }

        Ok(outcome)
    }

    /// Drops transfers that have been incomplete for longer than the timeout.
    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let mut dropped = Vec::new();
        let timeout = self.config.transfer_timeout;
        self.partials.retain(|transfer_id, partial| {
            let expired = now.saturating_duration_since(partial.created_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    transfer_id: transfer_id.clone(),
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.created_at)
            .map(|(transfer_id, _)| transfer_id.clone())?;
        self.partials.remove(&oldest);
        Some(GcEvent {
            transfer_id: oldest,
            reason: GcReason::Capacity,
        })
    }
}

fn decode_payload(text: String, is_object: bool) -> Result<Payload, ChunkError> {
    if !is_object {
        return Ok(Payload::Text(text));
    }
    serde_json::from_str(&text)
        .map(Payload::Object)
        .map_err(|err| ChunkError::Malformed(format!("object payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(assembler: &mut MessageAssembler, chunks: Vec<MessageChunk>) -> Vec<Assembled> {
        let now = Instant::now();
        chunks
            .into_iter()
            .filter_map(|chunk| assembler.ingest(chunk, now).expect("ingest").completed)
            .collect()
    }

    #[test]
    fn split_sdp_uses_thirds() {
        let parts = split_sdp("abcdefghij");
        assert_eq!(parts.first, "abc");
        assert_eq!(parts.second, "def");
        assert_eq!(parts.third, "ghij");
    }

    #[test]
    fn split_sdp_short_inputs() {
        assert_eq!(split_sdp(""), SdpParts::default());
        let one = split_sdp("x");
        assert_eq!((one.first.as_str(), one.second.as_str(), one.third.as_str()), ("", "", "x"));
        let two = split_sdp("xy");
        assert_eq!(two.third, "xy");
    }

    #[test]
    fn sdp_round_trip() {
        let samples = [
            "",
            "a",
            "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n",
            "{\"type\":\"offer\",\"sdp\":\"v=0\\r\\nb=AS:30\"}",
            "ünïcödé → sdp ✓",
        ];
        for sample in samples {
            assert_eq!(assemble_sdp(&split_sdp(sample)), sample);
        }
    }

    #[test]
    fn slots_accept_any_order() {
        let parts = split_sdp("the session description");
        let mut slots = SdpSlots::default();
        slots.insert(SdpPart::Third, parts.third.clone());
        assert!(!slots.is_complete());
        slots.insert(SdpPart::First, parts.first.clone());
        assert_eq!(slots.assemble(), None);
        slots.insert(SdpPart::Second, parts.second.clone());
        assert_eq!(slots.assemble().as_deref(), Some("the session description"));
    }

    #[test]
    fn empty_parts_still_fill_slots() {
        let parts = split_sdp("x");
        let mut slots = SdpSlots::default();
        slots.insert(SdpPart::First, parts.first);
        slots.insert(SdpPart::Second, parts.second);
        slots.insert(SdpPart::Third, parts.third);
        assert_eq!(slots.assemble().as_deref(), Some("x"));
    }

    #[test]
    fn bandwidth_lines_are_zeroed() {
        let sdp = "v=0\r\nb=AS:30\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nb=TIAS:64000\na=mid:0";
        let normalized = normalize_bandwidth(sdp);
        assert_eq!(
            normalized,
            "v=0\r\nb=AS:0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nb=AS:0\na=mid:0"
        );
        assert_eq!(normalize_bandwidth(&normalized), normalized);
    }

    #[test]
    fn hello_world_splits_into_three_chunks() {
        let chunks: Vec<_> = split_message("hello world", 5, "t-1", 10, false)
            .expect("split")
            .collect();
        let texts: Vec<_> = chunks.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(texts, vec!["hello", " worl", "d"]);
        assert_eq!(
            chunks.iter().map(|c| c.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(chunks[0].packets, Some(2));
        assert_eq!(chunks[1].packets, None);
        assert_eq!(
            chunks.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );

        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let done = feed(&mut assembler, chunks);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, Payload::Text("hello world".into()));
        assert_eq!(done[0].sending_time_ms, 10);
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn short_payload_is_first_and_last() {
        let chunks: Vec<_> = split_message("hi", 5, "t-2", 0, false)
            .expect("split")
            .collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].last);
        assert_eq!(chunks[0].seq, Some(0));
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        let chunks: Vec<_> = split_message("abcdefghij", 5, "t-3", 0, false)
            .expect("split")
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].message, "fghij");
        assert!(chunks[1].last);
    }

    #[test]
    fn empty_payload_closes_transfer() {
        let chunks: Vec<_> = split_message("", 5, "t-4", 0, false)
            .expect("split")
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].message, "");

        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let done = feed(&mut assembler, chunks);
        assert_eq!(done[0].payload, Payload::Text(String::new()));
    }

    #[test]
    fn zero_length_final_fragment_completes() {
        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let base = MessageChunk {
            transfer_id: "t-5".into(),
            sending_time: 0,
            message: "abc".into(),
            last: false,
            is_object: false,
            packets: Some(1),
            seq: Some(0),
        };
        let tail = MessageChunk {
            message: String::new(),
            last: true,
            packets: None,
            seq: Some(1),
            ..base.clone()
        };
        let done = feed(&mut assembler, vec![base, tail]);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload.as_text(), Some("abc"));
    }

    #[test]
    fn object_payload_is_decoded() {
        let (text, is_object) = Payload::from(json!({ "kind": "move", "x": 3 }))
            .to_wire()
            .expect("wire");
        assert!(is_object);
        let chunks: Vec<_> = split_message(&text, 4, "t-6", 0, is_object)
            .expect("split")
            .collect();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().rev().skip(1).all(|chunk| !chunk.is_object));

        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let done = feed(&mut assembler, chunks);
        assert_eq!(done[0].payload, Payload::Object(json!({ "kind": "move", "x": 3 })));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let chunks: Vec<_> = split_message("ééééé", 2, "t-7", 0, false)
            .expect("split")
            .collect();
        assert_eq!(
            chunks.iter().map(|c| c.message.as_str()).collect::<Vec<_>>(),
            vec!["éé", "éé", "é"]
        );
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = split_message("abc", 0, "t-8", 0, false).expect_err("zero size");
        assert_eq!(err, ChunkError::ZeroChunkSize);
    }

    #[test]
    fn gap_discards_transfer() {
        let mut chunks: Vec<_> = split_message("abcdefghij", 3, "t-9", 0, false)
            .expect("split")
            .collect();
        chunks.remove(1);
        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let now = Instant::now();
        assembler.ingest(chunks[0].clone(), now).expect("first chunk");
        let err = assembler
            .ingest(chunks[1].clone(), now)
            .expect_err("gap detected");
        assert!(matches!(err, ChunkError::OutOfOrder { expected: 1, got: 2, .. }));
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn chunks_without_seq_are_taken_in_arrival_order() {
        let frames = [
            json!({ "type": "text", "uuid": "t-legacy", "sendingTime": 7, "message": "hel", "packets": 2 }),
            json!({ "type": "text", "uuid": "t-legacy", "sendingTime": 7, "message": "lo " }),
            json!({ "type": "text", "uuid": "t-legacy", "sendingTime": 7, "message": "you", "last": true }),
        ];
        let chunks: Vec<MessageChunk> = frames
            .iter()
            .map(|frame| match decode_frame(frame.to_string().as_bytes()).expect("decode") {
                LinkFrame::Chunk(chunk) => chunk,
                LinkFrame::Raw(value) => panic!("expected a chunk, got {value}"),
            })
            .collect();
        assert!(chunks.iter().all(|chunk| chunk.seq.is_none()));

        let mut assembler = MessageAssembler::new(AssemblerConfig::default());
        let done = feed(&mut assembler, chunks);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload.as_text(), Some("hello you"));
        assert_eq!(done[0].sending_time_ms, 7);
    }

    #[test]
    fn stale_transfers_are_gced() {
        let config = AssemblerConfig {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            transfer_timeout: Duration::from_millis(25),
        };
        let mut assembler = MessageAssembler::new(config);
        let start = Instant::now();
        let first = split_message("abcdef", 3, "t-10", 0, false)
            .expect("split")
            .next()
            .expect("first chunk");
        assembler.ingest(first, start).expect("ingest");
        assert!(assembler.gc(start + Duration::from_millis(10)).is_empty());
        let dropped = assembler.gc(start + Duration::from_millis(30));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, GcReason::Timeout);
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn capacity_evicts_oldest_transfer() {
        let config = AssemblerConfig {
            max_inflight: 1,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        };
        let mut assembler = MessageAssembler::new(config);
        let start = Instant::now();
        for (idx, id) in ["old", "new"].into_iter().enumerate() {
            let first = split_message("abcdef", 3, id, 0, false)
                .expect("split")
                .next()
                .expect("first chunk");
            let outcome = assembler
                .ingest(first, start + Duration::from_millis(idx as u64))
                .expect("ingest");
            if id == "new" {
                assert_eq!(
                    outcome.gc_events,
                    vec![GcEvent {
                        transfer_id: "old".into(),
                        reason: GcReason::Capacity,
                    }]
                );
            }
        }
        assert_eq!(assembler.in_flight(), 1);
    }

    #[test]
    fn frames_distinguish_chunks_from_raw_json() {
        let chunk = split_message("hey", 10, "t-11", 42, false)
            .expect("split")
            .next()
            .expect("chunk");
        let encoded = encode_chunk(&chunk).expect("encode");
        let wire: Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(wire["type"], "text");
        assert_eq!(wire["uuid"], "t-11");
        assert_eq!(wire["sendingTime"], 42);
        assert_eq!(decode_frame(&encoded).expect("decode"), LinkFrame::Chunk(chunk));

        let raw = decode_frame(br#"{"type":"ping","n":1}"#).expect("decode raw");
        assert_eq!(raw, LinkFrame::Raw(json!({ "type": "ping", "n": 1 })));
        assert!(decode_frame(b"not json").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sdp_thirds_reassemble_to_the_input(text in "\\PC{0,400}") {
                let parts = split_sdp(&text);
                let len = text.chars().count();
                prop_assert_eq!(parts.first.chars().count(), len / 3);
                prop_assert_eq!(parts.second.chars().count(), len / 3);
                prop_assert_eq!(assemble_sdp(&parts), text);
            }

            #[test]
            fn any_text_survives_chunking(text in "\\PC{0,300}", max_chunk in 1usize..40) {
                let chunks: Vec<_> = split_message(&text, max_chunk, "t-prop", 1, false)
                    .expect("split")
                    .collect();
                prop_assert!(chunks.iter().all(|chunk| chunk.message.chars().count() <= max_chunk));
                prop_assert_eq!(chunks.iter().filter(|chunk| chunk.last).count(), 1);

                let mut assembler = MessageAssembler::new(AssemblerConfig::default());
                let done = feed(&mut assembler, chunks);
                prop_assert_eq!(done.len(), 1);
                prop_assert_eq!(done[0].payload.as_text(), Some(text.as_str()));
                prop_assert_eq!(assembler.in_flight(), 0);
            }
        }
    }
}
