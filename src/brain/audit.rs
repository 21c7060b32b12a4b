use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::kernel::decision::{Decision, DecisionOrigin, Verdict};
use crate::kernel::event::{Outcome, TelemetryEvent};
use crate::kernel::time::Timestamp;
use crate::transport::canonical::{audit_bytes, compute_hmac, verify_hmac};
use crate::transport::{KeyProvider, SecretKey};

const MAX_RECORDS: usize = 10_000;

/// `prev_signature` of the first record in a trail.
pub const GENESIS: &str = "";

/// One line of the decision audit trail: the decision plus the event it
/// was about, minus the argument summary. `signature` chains each record to
/// the one before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub recorded_at: Timestamp,
    pub source: String,
    pub sequence: u64,
    pub nonce: String,
    pub event_timestamp: Timestamp,
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub verdict: Verdict,
    pub origin: DecisionOrigin,
    pub score: f64,
    pub threshold: f64,
    pub reason: String,
    #[serde(default)]
    pub chain_index: u64,
    #[serde(default)]
    pub prev_signature: String,
    #[serde(default)]
    pub signature: String,
}

impl AuditRecord {
    pub fn new(event: &TelemetryEvent, decision: &Decision, threshold: f64, recorded_at: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at,
            source: event.source.clone(),
            sequence: event.sequence,
            nonce: decision.event_ref.clone(),
            event_timestamp: event.timestamp,
            duration_ms: event.duration_ms,
            outcome: event.outcome.clone(),
            verdict: decision.verdict,
            origin: decision.origin,
            score: decision.score,
            threshold,
            reason: decision.reason.clone(),
            chain_index: 0,
            prev_signature: String::new(),
            signature: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainBreak {
    #[error("record {index}: signature does not match its contents")]
    BadSignature { index: u64 },
    #[error("record {index}: does not follow the previous record")]
    BrokenLink { index: u64 },
    #[error("record {index}: expected index {expected}")]
    Gap { index: u64, expected: u64 },
}

#[derive(Debug)]
struct ChainHead {
    next_index: u64,
    last_signature: String,
}

/// HMAC-chained front for an `AuditSink`. Records reach the sink in chain
/// order; altering, dropping or reordering any of them breaks `verify`.
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    key: Arc<SecretKey>,
    head: Mutex<ChainHead>,
}

impl AuditTrail {
    /// Chains under the provider's signing key as of now; later rotations do
    /// not affect this trail.
    pub fn new(sink: Arc<dyn AuditSink>, keys: &dyn KeyProvider) -> Self {
        Self {
            sink,
            key: keys.signing_key(),
            head: Mutex::new(ChainHead {
                next_index: 0,
                last_signature: GENESIS.to_string(),
            }),
        }
    }

    pub fn append(&self, mut record: AuditRecord) {
        let mut head = self.head.lock();
        record.chain_index = head.next_index;
        record.prev_signature = head.last_signature.clone();
        match compute_hmac(self.key.as_bytes(), &audit_bytes(&record)) {
            Ok(signature) => record.signature = signature,
            Err(e) => error!("Audit record {} left unsigned: {}", record.chain_index, e),
        }
        head.next_index += 1;
        head.last_signature = record.signature.clone();
        self.sink.append(record);
    }

    /// Records appended so far.
    pub fn len(&self) -> u64 {
        self.head.lock().next_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a contiguous run of records, e.g. a sink snapshot. A run that
    /// starts mid-chain is trusted from its first record on.
    pub fn verify(&self, records: &[AuditRecord]) -> Result<usize, ChainBreak> {
        let mut previous: Option<&AuditRecord> = None;
        for record in records {
            let index = record.chain_index;
            if !verify_hmac(self.key.as_bytes(), &audit_bytes(record), &record.signature) {
                return Err(ChainBreak::BadSignature { index });
            }
            match previous {
                Some(prev) => {
                    if index != prev.chain_index + 1 {
                        return Err(ChainBreak::Gap {
                            index,
                            expected: prev.chain_index + 1,
                        });
                    }
                    if record.prev_signature != prev.signature {
                        return Err(ChainBreak::BrokenLink { index });
                    }
                }
                None if index == 0 && record.prev_signature != GENESIS => {
                    return Err(ChainBreak::BrokenLink { index });
                }
                None => {}
            }
            previous = Some(record);
        }
        Ok(records.len())
    }
}

/// Append-only destination for audit records. Appends must not block for long;
/// the engine calls this on its hot path.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord);
}

/// Bounded in-memory trail; oldest records fall off first.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    buffer: Mutex<VecDeque<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RECORDS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_RECORDS))),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(record);
    }
}

/// Emits every record as a structured tracing event under the `pic::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, record: AuditRecord) {
        match record.verdict {
            Verdict::Allow => info!(
                target: "pic::audit",
                id = %record.id,
                source = %record.source,
                seq = record.sequence,
                chain = record.chain_index,
                score = record.score,
                "allow: {}",
                record.reason
            ),
            Verdict::Block => warn!(
                target: "pic::audit",
                id = %record.id,
                source = %record.source,
                seq = record.sequence,
                chain = record.chain_index,
                score = record.score,
                origin = ?record.origin,
                "block: {}",
                record.reason
            ),
        }
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn append(&self, record: AuditRecord) {
        (**self).append(record)
    }
}

impl<A: AuditSink, B: AuditSink> AuditSink for (A, B) {
    fn append(&self, record: AuditRecord) {
        self.0.append(record.clone());
        self.1.append(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::KeyRing;

    fn record(seq: u64) -> AuditRecord {
        let event = TelemetryEvent::new("svc", 0.0, 4.0, Outcome::Success, "", seq);
        let d = Decision::allow(format!("n{}", seq), 0.1, "normal");
        AuditRecord::new(&event, &d, 0.7, 0.0)
    }

    #[test]
    fn memory_sink_drops_oldest_when_full() {
        let sink = MemoryAuditSink::with_capacity(2);
        for seq in 0..3 {
            sink.append(record(seq));
        }
        let records = sink.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].nonce, "n2");
    }

    #[test]
    fn trimmed_trail_still_verifies() {
        let sink = Arc::new(MemoryAuditSink::with_capacity(3));
        let trail = AuditTrail::new(sink.clone(), &KeyRing::generate(60));
        for seq in 0..5 {
            trail.append(record(seq));
        }
        let records = sink.snapshot();
        assert_eq!(records[0].chain_index, 2);
        assert_eq!(trail.verify(&records), Ok(3));
        assert_eq!(trail.len(), 5);
    }
}
