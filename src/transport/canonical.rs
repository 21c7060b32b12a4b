//! Canonical byte encodings covered by the HMAC.
//!
//! Layout: `LABEL | field* ` where every variable-length field is a u32
//! big-endian length followed by the raw bytes, and every number is its
//! fixed-width big-endian representation (`f64` via `to_bits`). Field order is
//! fixed here and nowhere else, so signer and verifier always agree.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::brain::audit::AuditRecord;
use crate::error::PipelineError;
use crate::kernel::decision::Decision;
use crate::kernel::event::{Outcome, TelemetryEvent};
use crate::kernel::time::Timestamp;

type HmacSha256 = Hmac<Sha256>;

pub const LABEL_EVENT: &[u8] = b"PIC-V1-EVENT";
pub const LABEL_DECISION: &[u8] = b"PIC-V1-DECISION";
pub const LABEL_AUDIT: &[u8] = b"PIC-V1-AUDIT";

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(label: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(label);
        Self { buf }
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(b);
        self
    }

    fn str(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes())
    }

    fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

fn exception_type(outcome: &Outcome) -> &str {
    match outcome {
        Outcome::Exception(ty) => ty.as_str(),
        _ => "",
    }
}

/// Bytes signed for a SignedEvent: (event, nonce, timestamp).
pub fn event_bytes(event: &TelemetryEvent, nonce: &str, timestamp: Timestamp) -> Vec<u8> {
    Encoder::new(LABEL_EVENT)
        .str(&event.source)
        .f64(event.timestamp)
        .f64(event.duration_ms)
        .str(event.outcome.tag())
        .str(exception_type(&event.outcome))
        .str(&event.args_summary)
        .u64(event.sequence)
        .str(nonce)
        .f64(timestamp)
        .finish()
}

/// Bytes signed for a SignedDecision.
pub fn decision_bytes(decision: &Decision, timestamp: Timestamp) -> Vec<u8> {
    Encoder::new(LABEL_DECISION)
        .str(&decision.verdict.to_string())
        .f64(decision.score)
        .str(&decision.reason)
        .str(&decision.event_ref)
        .f64(timestamp)
        .finish()
}

/// Bytes signed for an audit record: everything but its own signature.
pub fn audit_bytes(record: &AuditRecord) -> Vec<u8> {
    Encoder::new(LABEL_AUDIT)
        .u64(record.chain_index)
        .str(&record.prev_signature)
        .str(&record.id.to_string())
        .f64(record.recorded_at)
        .str(&record.source)
        .u64(record.sequence)
        .str(&record.nonce)
        .f64(record.event_timestamp)
        .f64(record.duration_ms)
        .str(record.outcome.tag())
        .str(exception_type(&record.outcome))
        .str(&record.verdict.to_string())
        .str(record.origin.as_str())
        .f64(record.score)
        .f64(record.threshold)
        .str(&record.reason)
        .finish()
}

pub fn compute_hmac(key: &[u8], payload: &[u8]) -> Result<String, PipelineError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PipelineError::InternalFailure(format!("invalid hmac key: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of `signature_hex` against the HMAC of `payload`.
/// Malformed hex never matches.
pub fn verify_hmac(key: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(payload);
    let actual = mac.finalize().into_bytes();
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}
