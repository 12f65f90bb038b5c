//! Snapshot building and encoding

use bytes::Bytes;

use crate::ws::codec;

use super::entity::EntityState;

/// One tick's authoritative world state. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Per-tick counter, wraps at u16
    pub sequence: u16,
    /// Milliseconds since server start, strictly increasing across snapshots
    pub timestamp_ms: u64,
    pub entities: Vec<EntityState>,
}

impl Snapshot {
    /// Serialize once; the frame is shared by every connection
    pub fn encode(&self) -> Bytes {
        codec::encode_snapshot(self.sequence, self.timestamp_ms, &self.entities)
    }
}

/// Stamps snapshots with a wrapping sequence and a strictly increasing clock
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    next_sequence: u16,
    last_timestamp: Option<u64>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot at `now_ms`. Two ticks landing on the same
    /// millisecond still get distinct, increasing timestamps.
    pub fn build(&mut self, now_ms: u64, entities: Vec<EntityState>) -> Snapshot {
        let timestamp_ms = match self.last_timestamp {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last_timestamp = Some(timestamp_ms);

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        Snapshot {
            sequence,
            timestamp_ms,
            entities,
        }
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
    /// Per-connection sends skipped because the outbound queue was full
    pub dropped: u64,
}

impl SnapshotStats {
    pub fn record(&mut self, entity_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }

    pub fn record_drop(&mut self) {
        self.dropped += 1;
    }
}
