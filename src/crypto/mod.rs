//! Halcyon Cryptographic Layer
//!
//! SHA-256 and HMAC-SHA256 for Aether frame authentication, with
//! constant-time digest comparison. Deterministic and memory-safe.

pub mod hash;

pub use hash::{hmac_sha256, sha256, verify_digest, DigestDisplay, DIGEST_LEN};
