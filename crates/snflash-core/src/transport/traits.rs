//! Serial transport abstraction.
//!
//! Defines the `SerialTransport` trait for byte-level I/O with the
//! controller, allowing different implementations (serialport, mock).

use std::fmt;
use std::sync::mpsc::Receiver;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("A connection is already open")]
    AlreadyConnected,

    #[error("No connection is open")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Failed to enumerate ports: {0}")]
    EnumerationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Usb { vid: u16, pid: u16 },
    Pci,
    Bluetooth,
    Unknown,
}

/// A port that can be handed to [`SerialTransport::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: String,
    pub kind: PortKind,
    pub product: Option<String>,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Unknown,
            product: None,
        }
    }

    pub fn is_usb(&self) -> bool {
        matches!(self.kind, PortKind::Usb { .. })
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.product) {
            (PortKind::Usb { vid, pid }, Some(product)) => {
                write!(f, "{} [USB {:04X}:{:04X} {}]", self.name, vid, pid, product)
            }
            (PortKind::Usb { vid, pid }, None) => {
                write!(f, "{} [USB {:04X}:{:04X}]", self.name, vid, pid)
            }
            _ => write!(f, "{}", self.name),
        }
    }
}

/// One item of the receive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// Bytes as they arrived; no framing applied.
    Data(Vec<u8>),
    /// The connection ended. Nothing follows.
    Closed,
}

/// Abstract serial transport interface.
///
/// One logical connection per instance. Sends are fire-and-forget; replies
/// arrive on the channel handed out by [`open`](SerialTransport::open) and
/// are correlated by the session layer.
pub trait SerialTransport: Send {
    /// Open the port and return the receive stream. The stream can only be
    /// restarted by closing and opening again.
    fn open(&mut self, port: &PortDescriptor) -> Result<Receiver<RxEvent>, TransportError>;

    /// Write raw bytes.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn open(&mut self, port: &PortDescriptor) -> Result<Receiver<RxEvent>, TransportError> {
        (**self).open(port)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
