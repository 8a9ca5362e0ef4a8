use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::warn;

pub const CHUNK_VERSION: u8 = 0xC1;
const HEADER_LEN: usize = 1 + 4 + 4 + 4;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_INBOUND_CHUNK_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_INFLIGHT: usize = 256;
/// Completed batch ids remembered so late duplicates do not reopen them.
const COMPLETED_MEMORY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Upper bound for one encoded frame, header included.
    pub max_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
    pub gc_timeout: Duration,
}

impl ChunkConfig {
    /// Outbound framing for a channel whose frames must stay within `mtu`.
    pub fn for_mtu(mtu: usize) -> Self {
        Self {
            max_chunk_bytes: mtu.max(HEADER_LEN + 1),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
        }
    }

    /// Inbound limits; tolerant of senders configured with a larger mtu.
    /// Message size and GC timeout honour the `TIDEPOOL_CHUNK_*` overrides.
    pub fn inbound(mtu: usize) -> Self {
        let limits = inbound_limits();
        Self {
            max_message_bytes: limits.max_message_bytes,
            gc_timeout: limits.gc_timeout,
            ..Self::for_mtu(mtu.max(MIN_INBOUND_CHUNK_BYTES))
        }
    }

    pub fn payload_capacity(&self) -> usize {
        self.max_chunk_bytes.saturating_sub(HEADER_LEN).max(1)
    }

    pub fn max_chunks(&self) -> usize {
        self.max_message_bytes.div_ceil(self.payload_capacity())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk frame too large: {0} bytes")]
    ChunkTooLarge(usize),
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub batch: u32,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcEvent {
    pub batch: u32,
    pub reason: GcReason,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub completed: Option<Bytes>,
    pub gc_events: Vec<GcEvent>,
}

#[derive(Debug)]
struct PartialMessage {
    created_at: Instant,
    chunks: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: usize,
}

impl PartialMessage {
    fn new(total: u32, created_at: Instant) -> Self {
        Self {
            created_at,
            chunks: vec![None; total as usize],
            received: 0,
            received_bytes: 0,
        }
    }

    fn total(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// Batch ids that finished recently, oldest first.
#[derive(Debug, Default)]
struct CompletedBatches {
    order: VecDeque<u32>,
    members: HashSet<u32>,
}

impl CompletedBatches {
    fn contains(&self, batch: u32) -> bool {
        self.members.contains(&batch)
    }

    fn remember(&mut self, batch: u32) {
        if !self.members.insert(batch) {
            return;
        }
        self.order.push_back(batch);
        if self.order.len() > COMPLETED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// Collects chunk frames per batch and yields the joined payload once every
/// sequence number has arrived. Duplicates are ignored, including ones that
/// trail in after their batch completed.
pub struct Reassembler {
    partials: HashMap<u32, PartialMessage>,
    completed: CompletedBatches,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            completed: CompletedBatches::default(),
            config,
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    pub fn ingest(&mut self, frame: ChunkFrame, now: Instant) -> Result<IngestOutcome, ChunkError> {
        validate_chunk_bounds(&frame, &self.config)?;
        let mut outcome = IngestOutcome::default();
        if frame.total == 1 {
            outcome.completed = Some(frame.payload);
            return Ok(outcome);
        }

        let ChunkFrame {
            batch,
            seq,
            total,
            payload,
        } = frame;

        if self.completed.contains(batch) {
            return Ok(outcome);
        }
        if !self.partials.contains_key(&batch) && self.partials.len() >= self.config.max_inflight {
            if let Some(evicted) = self.evict_oldest() {
                outcome.gc_events.push(evicted);
            }
        }

        let entry = self
            .partials
            .entry(batch)
            .or_insert_with(|| PartialMessage::new(total, now));
        if entry.total() != total {
            self.partials.remove(&batch);
            return Err(ChunkError::Malformed("chunk total changed for batch"));
        }

        let slot = &mut entry.chunks[seq as usize];
        if slot.is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(payload.len());
            *slot = Some(payload);
            entry.received += 1;
        }
        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&batch);
            return Err(ChunkError::MessageTooLarge(size));
        }

        if entry.received == total {
            let mut combined = Vec::with_capacity(entry.received_bytes);
            for chunk in entry.chunks.iter().flatten() {
                combined.extend_from_slice(chunk);
            }
            self.partials.remove(&batch);
            self.completed.remember(batch);
            outcome.completed = Some(Bytes::from(combined));
        }
        Ok(outcome)
    }

    /// Drop batches that have been incomplete for longer than the timeout.
    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let timeout = self.config.gc_timeout;
        let mut dropped = Vec::new();
        self.partials.retain(|batch, partial| {
            let expired = now.saturating_duration_since(partial.created_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    batch: *batch,
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
            .map(|(batch, _)| *batch)?;
        self.partials.remove(&oldest);
        Some(GcEvent {
            batch: oldest,
            reason: GcReason::Capacity,
        })
    }
}

struct InboundLimits {
    max_message_bytes: usize,
    gc_timeout: Duration,
}

fn inbound_limits() -> &'static InboundLimits {
    static LIMITS: Lazy<InboundLimits> = Lazy::new(|| InboundLimits {
        max_message_bytes: env_number("TIDEPOOL_CHUNK_MAX_MESSAGE_BYTES")
            .map(|bytes| bytes as usize)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
        gc_timeout: env_number("TIDEPOOL_CHUNK_GC_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GC_TIMEOUT),
    });
    &LIMITS
}

fn env_number(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(target = "tidepool::connection", var, value = %raw, "ignoring invalid chunk limit");
            None
        }
    }
}

pub fn split_message(
    payload: &[u8],
    batch: u32,
    config: &ChunkConfig,
) -> Result<Vec<ChunkFrame>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    if payload.is_empty() {
        return Ok(vec![ChunkFrame {
            batch,
            seq: 0,
            total: 1,
            payload: Bytes::new(),
        }]);
    }
    let pieces: Vec<&[u8]> = payload.chunks(config.payload_capacity()).collect();
    let total =
        u32::try_from(pieces.len()).map_err(|_| ChunkError::Malformed("chunk total overflow"))?;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(seq, piece)| ChunkFrame {
            batch,
            seq: seq as u32,
            total,
            payload: Bytes::copy_from_slice(piece),
        })
        .collect())
}

pub fn encode_chunk(frame: &ChunkFrame) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.push(CHUNK_VERSION);
    buf.extend_from_slice(&frame.batch.to_be_bytes());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.total.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

/// Parse one frame of a chunk-framed connection. Every binary frame on such
/// a connection carries the header, so anything else is malformed.
pub fn decode_chunk(bytes: &[u8], config: &ChunkConfig) -> Result<ChunkFrame, ChunkError> {
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("chunk frame too short"));
    }
    if bytes[0] != CHUNK_VERSION {
        return Err(ChunkError::Malformed("unknown chunk version"));
    }
    if bytes.len() > config.max_chunk_bytes {
        return Err(ChunkError::ChunkTooLarge(bytes.len()));
    }
    let read_u32 = |offset: usize| {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_be_bytes(word)
    };
    let frame = ChunkFrame {
        batch: read_u32(1),
        seq: read_u32(5),
        total: read_u32(9),
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    };
    validate_chunk_bounds(&frame, config)?;
    Ok(frame)
}

fn validate_chunk_bounds(frame: &ChunkFrame, config: &ChunkConfig) -> Result<(), ChunkError> {
    if frame.total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if frame.seq >= frame.total {
        return Err(ChunkError::Malformed("chunk seq out of range"));
    }
    if frame.payload.len() > config.payload_capacity() {
        return Err(ChunkError::ChunkTooLarge(frame.payload.len()));
    }
    if frame.total as usize > config.max_chunks() {
        return Err(ChunkError::MessageTooLarge(
            frame.total as usize * config.payload_capacity(),
        ));
    }
    Ok(())
}
