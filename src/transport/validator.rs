use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::canonical::{event_bytes, verify_hmac};
use super::keys::KeyProvider;
use super::nonce_cache::{NonceCache, NonceCheck};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::kernel::event::SignedEvent;
use crate::kernel::time::{unix_now, Timestamp};

/// Extra check run after signature, replay and freshness all pass.
pub trait ValidationHook: Send + Sync {
    fn name(&self) -> &str {
        "hook"
    }

    fn check(&self, signed: &SignedEvent) -> Result<(), String>;
}

impl<F> ValidationHook for F
where
    F: Fn(&SignedEvent) -> Result<(), String> + Send + Sync,
{
    fn check(&self, signed: &SignedEvent) -> Result<(), String> {
        self(signed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    InvalidSignature,
    ReplayAttack,
    StaleEvent { age_s: f64 },
    NonceCacheFull,
    Hook { name: String, reason: String },
}

impl Rejection {
    pub fn reason(&self) -> String {
        match self {
            Rejection::InvalidSignature => "invalid_signature".to_string(),
            Rejection::ReplayAttack => "replay_attack".to_string(),
            Rejection::StaleEvent { .. } => "stale_event".to_string(),
            Rejection::NonceCacheFull => "nonce_cache_full".to_string(),
            Rejection::Hook { name, reason } => format!("{}: {}", name, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
    pub rejection: Option<Rejection>,
}

impl ValidationResult {
    fn accepted() -> Self {
        Self {
            valid: true,
            reason: "valid".to_string(),
            rejection: None,
        }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self {
            valid: false,
            reason: rejection.reason(),
            rejection: Some(rejection),
        }
    }

    /// Map to the pipeline error taxonomy.
    pub fn into_error(self, nonce: &str, window_s: u64) -> Option<PipelineError> {
        self.rejection.map(|r| match r {
            Rejection::InvalidSignature => PipelineError::InvalidSignature,
            Rejection::ReplayAttack => PipelineError::ReplayDetected(nonce.to_string()),
            Rejection::StaleEvent { age_s } => PipelineError::StaleEvent { age_s, window_s },
            Rejection::NonceCacheFull => PipelineError::InternalFailure("nonce cache full".into()),
            Rejection::Hook { name, reason } => {
                PipelineError::InternalFailure(format!("validation hook {} rejected: {}", name, reason))
            }
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidatorStats {
    pub total_validations: u64,
    pub valid_events: u64,
    pub invalid_signatures: u64,
    pub replay_attacks: u64,
    pub stale_events: u64,
    pub cache_full_rejections: u64,
    pub hook_rejections: u64,
    pub nonce_cache_size: usize,
    pub success_rate: f64,
}

/// Receiving-side checks: signature, replay, freshness, then injected hooks.
///
/// All three built-in checks are evaluated on every event so each failure kind
/// is counted; the first failing check (in that order) is the reported reason.
/// A nonce is only recorded once its signature verified, so forged traffic
/// cannot burn the nonce of a genuine event.
pub struct SecurityValidator {
    keys: Arc<dyn KeyProvider>,
    freshness_window_s: u64,
    cache: Mutex<NonceCache>,
    hooks: Vec<Box<dyn ValidationHook>>,
    stats: Mutex<ValidatorStats>,
}

impl SecurityValidator {
    pub fn new(keys: Arc<dyn KeyProvider>, freshness_window_s: u64, cache_capacity: usize) -> Self {
        Self {
            keys,
            freshness_window_s,
            cache: Mutex::new(NonceCache::new(freshness_window_s, cache_capacity)),
            hooks: Vec::new(),
            stats: Mutex::new(ValidatorStats::default()),
        }
    }

    pub fn from_config(keys: Arc<dyn KeyProvider>, config: &PipelineConfig) -> Self {
        Self::new(keys, config.nonce_freshness_window_s, config.nonce_cache_capacity)
    }

    pub fn with_hook(self, hook: impl ValidationHook + 'static) -> Self {
        self.with_boxed_hook(Box::new(hook))
    }

    pub fn with_boxed_hook(mut self, hook: Box<dyn ValidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn freshness_window_s(&self) -> u64 {
        self.freshness_window_s
    }

    pub fn verify(&self, signed: &SignedEvent) -> ValidationResult {
        self.verify_at(signed, unix_now())
    }

    pub fn verify_at(&self, signed: &SignedEvent, now: Timestamp) -> ValidationResult {
        // 1. Signature under any active key
        let payload = event_bytes(&signed.event, &signed.nonce, signed.timestamp);
        let signature_ok = self
            .keys
            .verification_keys_at(now)
            .iter()
            .any(|key| verify_hmac(key.as_bytes(), &payload, &signed.signature));

        // 2. Replay (lookup + insert under one lock)
        let nonce_check = self.cache.lock().check(&signed.nonce, signed.timestamp, now, signature_ok);

        // 3. Freshness, in both directions
        let age_s = now - signed.timestamp;
        let fresh = age_s.abs() <= self.freshness_window_s as f64;

        let mut first: Option<Rejection> = None;
        {
            let mut stats = self.stats.lock();
            stats.total_validations += 1;
            if !signature_ok {
                stats.invalid_signatures += 1;
                first.get_or_insert(Rejection::InvalidSignature);
            }
            match nonce_check {
                NonceCheck::Replay => {
                    stats.replay_attacks += 1;
                    first.get_or_insert(Rejection::ReplayAttack);
                }
                NonceCheck::Full => {
                    stats.cache_full_rejections += 1;
                    first.get_or_insert(Rejection::NonceCacheFull);
                }
                NonceCheck::Fresh => {}
            }
            if !fresh {
                stats.stale_events += 1;
                first.get_or_insert(Rejection::StaleEvent { age_s });
            }
        }

        if first.is_none() {
            for hook in &self.hooks {
                if let Err(reason) = hook.check(signed) {
                    self.stats.lock().hook_rejections += 1;
                    first = Some(Rejection::Hook {
                        name: hook.name().to_string(),
                        reason,
                    });
                    break;
                }
            }
        }

        match first {
            None => {
                self.stats.lock().valid_events += 1;
                ValidationResult::accepted()
            }
            Some(rejection) => {
                warn!(
                    "Rejected event from '{}' (nonce={}): {}",
                    signed.source(),
                    signed.nonce,
                    rejection.reason()
                );
                ValidationResult::rejected(rejection)
            }
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(unix_now())
    }

    /// Periodic purge of expired nonce records.
    pub fn sweep_at(&self, now: Timestamp) -> usize {
        let removed = self.cache.lock().sweep(now);
        if removed > 0 {
            debug!("Cleaned up {} expired nonces", removed);
        }
        removed
    }

    pub fn stats(&self) -> ValidatorStats {
        let mut stats = self.stats.lock().clone();
        stats.nonce_cache_size = self.cache.lock().len();
        stats.success_rate = if stats.total_validations > 0 {
            stats.valid_events as f64 / stats.total_validations as f64
        } else {
            0.0
        };
        stats
    }
}
