use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;

use super::canonical::{compute_hmac, decision_bytes, event_bytes, verify_hmac};
use super::keys::KeyProvider;
use crate::error::PipelineError;
use crate::kernel::decision::{Decision, SignedDecision};
use crate::kernel::event::{SignedEvent, TelemetryEvent};
use crate::kernel::time::{unix_now, Timestamp};

/// 128-bit random nonce, lowercase hex.
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Producer-side signer. Pure transform plus RNG: no I/O.
#[derive(Clone)]
pub struct SecureTransport {
    keys: Arc<dyn KeyProvider>,
}

impl SecureTransport {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn sign(&self, event: TelemetryEvent) -> Result<SignedEvent, PipelineError> {
        self.sign_at(event, unix_now())
    }

    pub fn sign_at(&self, event: TelemetryEvent, timestamp: Timestamp) -> Result<SignedEvent, PipelineError> {
        let nonce = fresh_nonce();
        let key = self.keys.signing_key();
        let signature = compute_hmac(key.as_bytes(), &event_bytes(&event, &nonce, timestamp))?;
        Ok(SignedEvent {
            event,
            nonce,
            timestamp,
            signature,
        })
    }

    /// Used by the decision side to authenticate its answer.
    pub fn sign_decision(&self, decision: Decision) -> Result<SignedDecision, PipelineError> {
        let timestamp = unix_now();
        let key = self.keys.signing_key();
        let signature = compute_hmac(key.as_bytes(), &decision_bytes(&decision, timestamp))?;
        Ok(SignedDecision {
            decision,
            timestamp,
            signature,
        })
    }

    pub fn verify_decision(&self, signed: &SignedDecision) -> bool {
        let payload = decision_bytes(&signed.decision, signed.timestamp);
        self.keys
            .verification_keys()
            .iter()
            .any(|key| verify_hmac(key.as_bytes(), &payload, &signed.signature))
    }
}
