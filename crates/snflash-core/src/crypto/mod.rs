//! Cryptographic helpers for the bundled diagnostics assets.
//!
//! Stateless functions over explicit byte slices and keys. Nothing here keeps
//! key material between calls.

pub mod cipher;
pub mod kdf;
pub mod seal;

use rand::RngCore;
use thiserror::Error;

pub use cipher::{BLOCK_SIZE, Iv, KEY_SIZE};
pub use kdf::{DerivedKey, Prf, derive, derive_with};
pub use seal::{decrypt_string, encrypt_string, open_with_passphrase, seal_with_passphrase};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid padding")]
    PaddingInvalid,

    #[error("Invalid ciphertext length: {len} is not a positive multiple of {block}")]
    LengthInvalid { len: usize, block: usize },
}

/// Fill a fresh buffer with OS randomness.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(0).len(), 0);
        assert_eq!(random_bytes(16).len(), 16);
        // 128 random bits colliding would mean a broken RNG.
        assert_ne!(random_bytes(16), random_bytes(16));
    }
}
