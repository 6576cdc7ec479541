//! Halcyon Hashing Layer
//!
//! Thin wrappers over the RustCrypto SHA-256 core. Keys longer than the
//! block size are hashed down inside the MAC construction (RFC 2104), and
//! digest comparison never short-circuits on the first differing byte.

use core::fmt;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const DIGEST_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// 32-byte SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256 over the concatenation of `parts`, keyed by `key`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    // HMAC accepts any key length; oversized keys are hashed first
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of two digests.
pub fn verify_digest(a: &[u8; DIGEST_LEN], b: &[u8; DIGEST_LEN]) -> bool {
    a.ct_eq(b).into()
}

/// Hex pretty printer for digests.
pub struct DigestDisplay<'a>(pub &'a [u8; DIGEST_LEN]);

impl fmt::Display for DigestDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // FIPS 180-4 "abc"
        let digest = sha256(b"abc");
        let expected = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
            0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
            0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(digest, expected);
    }

    #[test]
    fn hmac_known_vector() {
        // RFC 4231 test case 2
        let digest = hmac_sha256(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        let expected = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(digest, expected);
    }

    #[test]
    fn long_keys_are_hashed_first() {
        let long_key = [0xAA_u8; 100];
        let a = hmac_sha256(&long_key, &[b"payload"]);
        let b = hmac_sha256(&sha256(&long_key), &[b"payload"]);
        assert_eq!(a, b);
    }

    #[test]
    fn verify_rejects_any_flip() {
        let digest = sha256(b"frame");
        for i in 0..DIGEST_LEN {
            let mut tampered = digest;
            tampered[i] ^= 0x01;
            assert!(!verify_digest(&digest, &tampered));
        }
        assert!(verify_digest(&digest, &digest));
    }

    #[test]
    fn digest_display_hex() {
        let digest = sha256(b"");
        let shown = alloc::format!("{}", DigestDisplay(&digest));
        assert!(shown.starts_with("e3b0c442"));
        assert_eq!(shown.len(), 64);
    }
}
