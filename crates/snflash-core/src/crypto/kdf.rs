//! Password-based key derivation (PBKDF2).

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Upper bound on derived key length.
pub const MAX_KEY_LEN: usize = 64;

/// Work factor below which a warning is logged.
pub const RECOMMENDED_MIN_ITERATIONS: u32 = 10_000;

/// Pseudo-random function used inside PBKDF2.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Prf {
    /// HMAC-SHA1, only for assets sealed by older tooling.
    HmacSha1,
    #[default]
    HmacSha256,
}

impl fmt::Display for Prf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prf::HmacSha1 => write!(f, "PBKDF2-HMAC-SHA1"),
            Prf::HmacSha256 => write!(f, "PBKDF2-HMAC-SHA256"),
        }
    }
}

/// Key bytes produced by [`derive`]. Wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Derive a key with PBKDF2-HMAC-SHA256.
pub fn derive(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    key_len: usize,
) -> Result<DerivedKey, CryptoError> {
    derive_with(Prf::HmacSha256, passphrase, salt, iterations, key_len)
}

/// Derive a key with an explicit PRF.
pub fn derive_with(
    prf: Prf,
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    key_len: usize,
) -> Result<DerivedKey, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidParameter("passphrase is empty".into()));
    }
    if salt.is_empty() {
        return Err(CryptoError::InvalidParameter("salt is empty".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::InvalidParameter("iterations must be > 0".into()));
    }
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return Err(CryptoError::InvalidParameter(format!(
            "key length {} outside 1..={}",
            key_len, MAX_KEY_LEN
        )));
    }
    if iterations < RECOMMENDED_MIN_ITERATIONS {
        tracing::warn!(iterations, prf = %prf, "Low PBKDF2 iteration count");
    }

    let mut out = vec![0u8; key_len];
    match prf {
        Prf::HmacSha1 => pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), salt, iterations, &mut out),
        Prf::HmacSha256 => {
            pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut out)
        }
    }
    Ok(DerivedKey(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN_SHA256: &str = "5a536474902628ba61e66a00ee64205b2fca35dcb35b23338a7f411473ad0e96";
    const GOLDEN_SHA1: &str = "246952e49134567111de756354bd1c63497c6bee5804e0bf734f45d2769d4636";

    #[test]
    fn test_golden_vector_sha256() {
        let key = derive("diagkey", &[0u8; 16], 10_000, 32).unwrap();
        assert_eq!(hex::encode(key.as_bytes()), GOLDEN_SHA256);
    }

    #[test]
    fn test_golden_vector_sha1() {
        let key = derive_with(Prf::HmacSha1, "diagkey", &[0u8; 16], 10_000, 32).unwrap();
        assert_eq!(hex::encode(key.as_bytes()), GOLDEN_SHA1);
    }

    #[test]
    fn test_deterministic() {
        let a = derive("passphrase", b"salt-salt", 1_000, 32).unwrap();
        let b = derive("passphrase", b"salt-salt", 1_000, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_salt_changes_key() {
        let a = derive("passphrase", b"salt-one", 1_000, 32).unwrap();
        let b = derive("passphrase", b"salt-two", 1_000, 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            derive("p", b"salt", 0, 32),
            Err(CryptoError::InvalidParameter(_))
        ));
        assert!(matches!(
            derive("p", b"salt", 1, 0),
            Err(CryptoError::InvalidParameter(_))
        ));
        assert!(matches!(
            derive("p", b"salt", 1, MAX_KEY_LEN + 1),
            Err(CryptoError::InvalidParameter(_))
        ));
        assert!(matches!(
            derive("", b"salt", 1, 32),
            Err(CryptoError::InvalidParameter(_))
        ));
        assert!(matches!(
            derive("p", b"", 1, 32),
            Err(CryptoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_debug_redacts() {
        let key = derive("p", b"salt", 1, 32).unwrap();
        assert_eq!(format!("{:?}", key), "DerivedKey(<32 bytes redacted>)");
    }
}
