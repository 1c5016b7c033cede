//! AES-256 with PKCS#7 padding.
//!
//! Three modes are exposed, each under its own name:
//!
//! - explicit IV CBC: [`encrypt`] / [`decrypt`], or the [`encrypt_prepended`] /
//!   [`decrypt_prepended`] pair which stores a random IV in front of the
//!   ciphertext.
//! - [`legacy`] zero-IV CBC: the IV is reused across messages.
//! - [`legacy`] ECB: the format older asset tooling actually wrote. Identical
//!   plaintext blocks map to identical ciphertext blocks.
//!
//! The legacy modes exist only for reading assets produced by older tooling.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroize;

use super::{CryptoError, random_bytes};

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

pub type Iv = [u8; BLOCK_SIZE];

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidParameter(format!(
            "AES-256 key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Ok(())
}

fn cipher_for(key: &[u8]) -> Result<Aes256, CryptoError> {
    check_key(key)?;
    Aes256::new_from_slice(key).map_err(|e| CryptoError::InvalidParameter(e.to_string()))
}

fn check_ciphertext_len(len: usize) -> Result<(), CryptoError> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(CryptoError::LengthInvalid {
            len,
            block: BLOCK_SIZE,
        });
    }
    Ok(())
}

/// Strip PKCS#7 padding from a decrypted buffer. The buffer is wiped when the
/// padding does not validate.
fn unpad(mut out: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let mut last = [0u8; BLOCK_SIZE];
    last.copy_from_slice(&out[out.len() - BLOCK_SIZE..]);
    match padding_len(&last) {
        Some(pad) => {
            let keep = out.len() - pad;
            out[keep..].zeroize();
            out.truncate(keep);
            Ok(out)
        }
        None => {
            out.zeroize();
            Err(CryptoError::PaddingInvalid)
        }
    }
}

/// Encrypt under an explicit IV. Output length is always a multiple of
/// [`BLOCK_SIZE`] and at least one block longer than a block-aligned input.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &Iv) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidParameter(e.to_string()))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt under an explicit IV and strip the padding.
pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &Iv) -> Result<Vec<u8>, CryptoError> {
    check_ciphertext_len(ciphertext.len())?;
    check_key(key)?;
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidParameter(e.to_string()))?;

    // Padding is left to `unpad`, which checks it in constant time.
    let mut out = ciphertext.to_vec();
    dec.decrypt_padded_mut::<NoPadding>(&mut out)
        .map_err(|_| CryptoError::LengthInvalid {
            len: ciphertext.len(),
            block: BLOCK_SIZE,
        })?;
    unpad(out)
}

/// Encrypt with a fresh random IV, returned as `iv || ciphertext`.
pub fn encrypt_prepended(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&random_bytes(BLOCK_SIZE));
    let body = encrypt(plaintext, key, &iv)?;
    let mut out = Vec::with_capacity(BLOCK_SIZE + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`encrypt_prepended`].
pub fn decrypt_prepended(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < 2 * BLOCK_SIZE {
        return Err(CryptoError::LengthInvalid {
            len: data.len(),
            block: BLOCK_SIZE,
        });
    }
    let (head, body) = data.split_at(BLOCK_SIZE);
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(head);
    decrypt(body, key, &iv)
}

/// Modes for legacy assets.
pub mod legacy {
    use super::*;

    pub const ZERO_IV: Iv = [0u8; BLOCK_SIZE];

    pub fn encrypt_zero_iv(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(plaintext, key, &ZERO_IV)
    }

    pub fn decrypt_zero_iv(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(ciphertext, key, &ZERO_IV)
    }

    /// AES-256-ECB encrypt with PKCS#7 padding.
    pub fn encrypt_ecb(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = cipher_for(key)?;

        let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + pad, pad as u8);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(buf)
    }

    /// AES-256-ECB decrypt and strip the padding.
    pub fn decrypt_ecb(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_ciphertext_len(ciphertext.len())?;
        let cipher = cipher_for(key)?;

        let mut out = ciphertext.to_vec();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        unpad(out)
    }
}

/// 0xFF when `a <= b`, else 0x00.
#[inline]
fn ct_le(a: u8, b: u8) -> u8 {
    ((a as u16).wrapping_sub(b as u16 + 1) >> 8) as u8
}

/// Validate PKCS#7 padding without branching on the padding bytes.
fn padding_len(last: &[u8; BLOCK_SIZE]) -> Option<usize> {
    let pad = last[BLOCK_SIZE - 1];
    let mut bad = ct_le(pad, 0) | !ct_le(pad, BLOCK_SIZE as u8);
    for (i, &b) in last.iter().enumerate() {
        let dist = (BLOCK_SIZE - i) as u8;
        bad |= ct_le(dist, pad) & (b ^ pad);
    }
    if bad == 0 { Some(pad as usize) } else { None }
}
