//! snflash-core: serial-number reprogramming pipeline for a bench-attached
//! controller.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Crypto**: PBKDF2 key derivation, AES-256-CBC with PKCS#7, passphrase sealing
//! - **Vault**: model id to encrypted diagnostics image, staged to a temp file
//! - **Serial number**: sanitize, parse, validate and generate serials
//! - **Protocol**: text commands, binary frames and acks
//! - **Transport**: serial port abstraction (serialport, mock) and reply framing
//! - **State**: session state machine and per-state handlers
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: high-level orchestrator, worker thread and control handle
//! - **Audit**: append-only audit log and telemetry sink
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use snflash_core::config::SessionConfig;
//! use snflash_core::payload::DirectoryPayloadProvider;
//! use snflash_core::session::DeviceSession;
//! use snflash_core::transport::{PortDescriptor, SerialPortTransport};
//!
//! let config = SessionConfig::load_from_file("snflash.toml").unwrap();
//! let transport = SerialPortTransport::new(config.baud_rate)
//!     .with_write_timeout(config.ack_timeout());
//! let payloads = Arc::new(DirectoryPayloadProvider::new("payloads"));
//! let session = DeviceSession::new(
//!     config,
//!     PortDescriptor::new("/dev/ttyUSB0"),
//!     transport,
//!     payloads,
//! );
//! let handle = session.spawn().unwrap();
//! handle.submit_serial("C02123XYZQ6L").unwrap();
//! let report = handle.join().unwrap();
//! println!("{:?}", report.outcome);
//! ```

pub mod audit;
pub mod config;
pub mod crypto;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod serial_number;
pub mod session;
pub mod state;
pub mod transport;
pub mod vault;

// Re-exports for convenience
pub use audit::{AuditLog, AuditLogRecord, AuditOutcome, Telemetry, VersionStatus};
pub use config::SessionConfig;
pub use crypto::CryptoError;
pub use events::{LogLevel, SessionEvent, SessionObserver, TracingObserver};
pub use payload::{ChunkState, ExploitPayloadProvider};
pub use protocol::ProtocolError;
pub use serial_number::{SerialNumber, ValidationError};
pub use session::{DeviceSession, SessionError, SessionHandle, SessionOutcome, SessionReport};
pub use state::{AbortReason, SessionPhase, SessionState};
pub use transport::{MockTransport, SerialPortTransport, SerialTransport, TransportError};
pub use vault::{DecryptedImage, ImageVault, VaultError};
