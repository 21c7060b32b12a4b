//! Authenticated channel between the producer side and the decision side:
//! canonical encoding, keys, signing and receiving-side validation.

pub mod canonical;
pub mod keys;
pub mod nonce_cache;
pub mod signer;
pub mod validator;

pub use keys::{KeyProvider, KeyRing, SecretKey};
pub use signer::SecureTransport;
pub use validator::{Rejection, SecurityValidator, ValidationHook, ValidationResult, ValidatorStats};
