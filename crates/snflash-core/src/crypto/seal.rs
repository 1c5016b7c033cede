//! Self-describing passphrase containers.
//!
//! Layout (all integers little endian):
//!
//! ```text
//! [0..4]   magic "SNF1"
//! [4]      PRF id (0 = HMAC-SHA1, 1 = HMAC-SHA256)
//! [5..9]   PBKDF2 iterations
//! [9..25]  salt
//! [25..41] IV
//! [41..]   AES-256-CBC ciphertext
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::cipher::{self, BLOCK_SIZE, KEY_SIZE};
use super::kdf::{Prf, derive_with};
use super::{CryptoError, random_bytes};

pub const SEAL_MAGIC: &[u8; 4] = b"SNF1";
pub const SEAL_SALT_LEN: usize = 16;
pub const SEAL_HEADER_LEN: usize = 4 + 1 + 4 + SEAL_SALT_LEN + BLOCK_SIZE;

/// Iterations used by [`encrypt_string`].
pub const STRING_ITERATIONS: u32 = 100_000;

fn prf_id(prf: Prf) -> u8 {
    match prf {
        Prf::HmacSha1 => 0,
        Prf::HmacSha256 => 1,
    }
}

fn prf_from_id(id: u8) -> Result<Prf, CryptoError> {
    match id {
        0 => Ok(Prf::HmacSha1),
        1 => Ok(Prf::HmacSha256),
        other => Err(CryptoError::InvalidParameter(format!(
            "unknown PRF id {}",
            other
        ))),
    }
}

/// Encrypt `plaintext` under a key derived from `passphrase` with a fresh
/// random salt and IV.
pub fn seal_with_passphrase(
    plaintext: &[u8],
    passphrase: &str,
    iterations: u32,
) -> Result<Vec<u8>, CryptoError> {
    let salt = random_bytes(SEAL_SALT_LEN);
    let key = derive_with(Prf::HmacSha256, passphrase, &salt, iterations, KEY_SIZE)?;
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&random_bytes(BLOCK_SIZE));
    let body = cipher::encrypt(plaintext, key.as_bytes(), &iv)?;

    let mut out = Vec::with_capacity(SEAL_HEADER_LEN + body.len());
    out.extend_from_slice(SEAL_MAGIC);
    out.push(prf_id(Prf::HmacSha256));
    // Writing into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(iterations);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open a container produced by [`seal_with_passphrase`].
pub fn open_with_passphrase(sealed: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_HEADER_LEN + BLOCK_SIZE {
        return Err(CryptoError::LengthInvalid {
            len: sealed.len(),
            block: BLOCK_SIZE,
        });
    }
    if &sealed[..4] != SEAL_MAGIC {
        return Err(CryptoError::InvalidParameter("bad container magic".into()));
    }
    let prf = prf_from_id(sealed[4])?;
    let iterations = Cursor::new(&sealed[5..9])
        .read_u32::<LittleEndian>()
        .map_err(|e| CryptoError::InvalidParameter(e.to_string()))?;
    let salt = &sealed[9..9 + SEAL_SALT_LEN];
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&sealed[9 + SEAL_SALT_LEN..SEAL_HEADER_LEN]);

    let key = derive_with(prf, passphrase, salt, iterations, KEY_SIZE)?;
    cipher::decrypt(&sealed[SEAL_HEADER_LEN..], key.as_bytes(), &iv)
}

/// Seal a UTF-8 string and return it as lowercase hex.
pub fn encrypt_string(text: &str, passphrase: &str) -> Result<String, CryptoError> {
    let sealed = seal_with_passphrase(text.as_bytes(), passphrase, STRING_ITERATIONS)?;
    Ok(hex::encode(sealed))
}

/// Inverse of [`encrypt_string`].
pub fn decrypt_string(encoded: &str, passphrase: &str) -> Result<String, CryptoError> {
    let sealed = hex::decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidParameter(format!("hex: {}", e)))?;
    let plain = open_with_passphrase(&sealed, passphrase)?;
    String::from_utf8(plain).map_err(|e| CryptoError::InvalidParameter(format!("utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let sealed = seal_with_passphrase(b"diags payload", "asset-pass", 1_000).unwrap();
        assert_eq!(&sealed[..4], SEAL_MAGIC);
        assert_eq!(sealed[4], 1);
        assert_eq!(&sealed[5..9], &1_000u32.to_le_bytes());
        assert_eq!(
            open_with_passphrase(&sealed, "asset-pass").unwrap(),
            b"diags payload"
        );
    }

    #[test]
    fn test_open_wrong_passphrase_fails() {
        let sealed = seal_with_passphrase(&[0x42; 64], "right", 1_000).unwrap();
        // A wrong key yields valid padding by chance only ~1/256 of the time,
        // and then the plaintext still differs.
        match open_with_passphrase(&sealed, "wrong") {
            Err(CryptoError::PaddingInvalid) => {}
            Ok(plain) => assert_ne!(plain, vec![0x42; 64]),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(matches!(
            open_with_passphrase(b"short", "p"),
            Err(CryptoError::LengthInvalid { .. })
        ));
        let mut sealed = seal_with_passphrase(b"x", "p", 1_000).unwrap();
        sealed[0] = b'X';
        assert!(matches!(
            open_with_passphrase(&sealed, "p"),
            Err(CryptoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_string_helpers() {
        let enc = encrypt_string("C02XK1ABCDEF", "operator").unwrap();
        assert!(enc.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decrypt_string(&enc, "operator").unwrap(), "C02XK1ABCDEF");
        assert!(decrypt_string("zz", "operator").is_err());
    }
}
