//! Encrypted image vault.
//!
//! Maps a detected model identifier to its bundled encrypted diagnostics
//! image, derives the asset key and writes the plaintext to a process-owned
//! temporary file. The file is removed when the returned [`DecryptedImage`]
//! is dropped or closed.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::crypto::cipher::{self, KEY_SIZE, legacy};
use crate::crypto::kdf::{DerivedKey, Prf, derive_with};
use crate::crypto::CryptoError;

pub const DEFAULT_ASSET_ITERATIONS: u32 = 10_000;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No image registered for model {0}")]
    UnsupportedModel(String),

    #[error("Invalid salt for {label}: {message}")]
    InvalidSalt { label: String, message: String },

    #[error("Failed to read asset {path}: {source}")]
    AssetRead { path: PathBuf, source: io::Error },

    #[error("Failed to stage decrypted image: {0}")]
    Staging(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// How the IV of an asset is stored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IvPolicy {
    /// Random IV in the first 16 bytes of the file.
    #[default]
    Prepended,
    /// All-zero IV CBC. Only for assets from older tooling.
    LegacyZero,
    /// ECB, no IV at all. The layout older asset tooling wrote, usually
    /// paired with [`Prf::HmacSha1`].
    LegacyEcb,
}

fn default_iterations() -> u32 {
    DEFAULT_ASSET_ITERATIONS
}

/// An encrypted image on disk plus the policy needed to open it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedImageAsset {
    pub path: PathBuf,
    pub passphrase: String,
    /// Hex-encoded salt.
    pub salt: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub prf: Prf,
    #[serde(default)]
    pub iv: IvPolicy,
}

impl fmt::Debug for EncryptedImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedImageAsset")
            .field("path", &self.path)
            .field("passphrase", &"<redacted>")
            .field("salt", &self.salt)
            .field("iterations", &self.iterations)
            .field("prf", &self.prf)
            .field("iv", &self.iv)
            .finish()
    }
}

impl EncryptedImageAsset {
    fn key(&self) -> Result<DerivedKey, VaultError> {
        let label = self.path.display().to_string();
        let salt = hex::decode(self.salt.trim()).map_err(|e| VaultError::InvalidSalt {
            label,
            message: e.to_string(),
        })?;
        Ok(derive_with(
            self.prf,
            &self.passphrase,
            &salt,
            self.iterations,
            KEY_SIZE,
        )?)
    }

    /// Encrypt `plain` the way this asset expects to be stored.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, VaultError> {
        let key = self.key()?;
        let out = match self.iv {
            IvPolicy::Prepended => cipher::encrypt_prepended(plain, key.as_bytes())?,
            IvPolicy::LegacyZero => legacy::encrypt_zero_iv(plain, key.as_bytes())?,
            IvPolicy::LegacyEcb => legacy::encrypt_ecb(plain, key.as_bytes())?,
        };
        Ok(out)
    }

    /// Decrypt bytes read from this asset's file.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
        let key = self.key()?;
        let out = match self.iv {
            IvPolicy::Prepended => cipher::decrypt_prepended(sealed, key.as_bytes())?,
            IvPolicy::LegacyZero => legacy::decrypt_zero_iv(sealed, key.as_bytes())?,
            IvPolicy::LegacyEcb => legacy::decrypt_ecb(sealed, key.as_bytes())?,
        };
        Ok(out)
    }
}

/// A per-model asset entry as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAsset {
    pub model: String,
    #[serde(flatten)]
    pub asset: EncryptedImageAsset,
}

/// Plaintext image staged in a temporary file.
#[derive(Debug)]
pub struct DecryptedImage {
    path: TempPath,
    len: u64,
    label: String,
}

impl DecryptedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    /// Delete the file now and report any error. Dropping also deletes it.
    pub fn close(self) -> io::Result<()> {
        debug!(path = %self.path.display(), "Removing staged image");
        self.path.close()
    }
}

/// Registry of encrypted assets keyed by model identifier.
#[derive(Debug, Default, Clone)]
pub struct ImageVault {
    assets: BTreeMap<String, EncryptedImageAsset>,
    boot: Option<EncryptedImageAsset>,
    staging_dir: Option<PathBuf>,
}

impl ImageVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_assets(assets: &[ModelAsset], boot: Option<EncryptedImageAsset>) -> Self {
        let mut vault = Self::new();
        for entry in assets {
            vault.register(&entry.model, entry.asset.clone());
        }
        vault.boot = boot;
        vault
    }

    pub fn register(&mut self, model: &str, asset: EncryptedImageAsset) {
        self.assets.insert(model.to_string(), asset);
    }

    pub fn set_boot_image(&mut self, asset: Option<EncryptedImageAsset>) {
        self.boot = asset;
    }

    /// Stage plaintext under `dir` instead of the system temp directory.
    pub fn set_staging_dir(&mut self, dir: Option<PathBuf>) {
        self.staging_dir = dir;
    }

    pub fn supports(&self, model: &str) -> bool {
        self.assets.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    pub fn has_boot_image(&self) -> bool {
        self.boot.is_some()
    }

    /// Decrypt the diagnostics image registered for `model`.
    #[instrument(skip(self))]
    pub fn decrypt_asset(&self, model: &str) -> Result<DecryptedImage, VaultError> {
        let asset = self
            .assets
            .get(model)
            .ok_or_else(|| VaultError::UnsupportedModel(model.to_string()))?;
        self.stage(asset, &format!("diags-{}", model))
    }

    /// Decrypt the shared boot image, if one is configured.
    pub fn decrypt_boot_image(&self) -> Result<Option<DecryptedImage>, VaultError> {
        match &self.boot {
            Some(asset) => self.stage(asset, "boot").map(Some),
            None => Ok(None),
        }
    }

    fn stage(
        &self,
        asset: &EncryptedImageAsset,
        label: &str,
    ) -> Result<DecryptedImage, VaultError> {
        let sealed = std::fs::read(&asset.path).map_err(|source| VaultError::AssetRead {
            path: asset.path.clone(),
            source,
        })?;
        let plain = asset.open(&sealed)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("snflash-").suffix(".img");
        let mut file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&plain)?;
        file.flush()?;
        let path = file.into_temp_path();

        info!(
            label,
            bytes = plain.len(),
            path = %path.display(),
            "Staged decrypted image"
        );
        Ok(DecryptedImage {
            path,
            len: plain.len() as u64,
            label: label.to_string(),
        })
    }
}
