//! Session configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::vault::{EncryptedImageAsset, ImageVault, ModelAsset};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AUDIT_LOG: &str = "snflash-audit.log";

/// Configuration for a device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial port name. `None` picks the first USB serial port.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Wait for a text reply.
    pub response_timeout_ms: u64,
    /// Wait for a binary ack. Restarted by every WAIT frame.
    pub ack_timeout_ms: u64,
    /// Give up waiting for a replacement serial after this long.
    pub new_serial_timeout_secs: Option<u64>,
    /// Bytes per transfer chunk.
    pub chunk_size: usize,
    pub audit_log_path: PathBuf,
    /// Directory holding `<model>.bin` exploit payloads.
    pub payload_dir: Option<PathBuf>,
    /// Where decrypted images are staged. Defaults to the system temp dir.
    pub staging_dir: Option<PathBuf>,
    /// Image streamed ahead of every diagnostics image.
    pub boot_image: Option<EncryptedImageAsset>,
    /// Per-model diagnostics images.
    pub assets: Vec<ModelAsset>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            new_serial_timeout_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            audit_log_path: PathBuf::from(DEFAULT_AUDIT_LOG),
            payload_dir: None,
            staging_dir: None,
            boot_image: None,
            assets: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SessionConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn new_serial_timeout(&self) -> Option<Duration> {
        self.new_serial_timeout_secs.map(Duration::from_secs)
    }

    /// Chunk size clamped to what the device accepts.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    /// Vault holding every asset named in this config.
    pub fn build_vault(&self) -> ImageVault {
        let mut vault = ImageVault::from_assets(&self.assets, self.boot_image.clone());
        vault.set_staging_dir(self.staging_dir.clone());
        vault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::Prf;
    use crate::vault::IvPolicy;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.response_timeout(), Duration::from_secs(2));
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.audit_log_path, PathBuf::from("snflash-audit.log"));
        assert!(config.new_serial_timeout().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            port = "/dev/ttyUSB0"
            chunk_size = 1000000

            [[assets]]
            model = "J680AP"
            path = "assets/j680.enc"
            passphrase = "bench"
            salt = "00112233445566778899aabbccddeeff"
            prf = "hmac-sha1"
            iv = "legacy-zero"
            "#,
        )
        .unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.effective_chunk_size(), MAX_CHUNK_SIZE);
        assert_eq!(config.assets.len(), 1);
        let asset = &config.assets[0].asset;
        assert_eq!(asset.iterations, 10_000);
        assert_eq!(asset.prf, Prf::HmacSha1);
        assert_eq!(asset.iv, IvPolicy::LegacyZero);
        assert!(config.build_vault().supports("J680AP"));
    }

    #[test]
    fn test_parse_legacy_ecb_asset() {
        let config: SessionConfig = toml::from_str(
            r#"
            [[assets]]
            model = "J132AP"
            path = "assets/j132.enc"
            passphrase = "bench"
            salt = "00112233445566778899aabbccddeeff"
            prf = "hmac-sha1"
            iv = "legacy-ecb"
            "#,
        )
        .unwrap();
        assert_eq!(config.assets[0].asset.iv, IvPolicy::LegacyEcb);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snflash.toml");
        let config = SessionConfig {
            port: Some("COM3".into()),
            new_serial_timeout_secs: Some(90),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.port.as_deref(), Some("COM3"));
        assert_eq!(loaded.new_serial_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SessionConfig::load_from_file("/nonexistent/snflash.toml").unwrap_err();
        assert!(err.to_string().contains("reading"));
    }
}
