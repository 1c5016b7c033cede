//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow a session without being coupled to the state
//! machine.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::serial_number::{SerialNumber, ValidationError};
use crate::state::machine::{AbortReason, SessionPhase};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Serial packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged { from: SessionPhase, to: SessionPhase },
    PortOpened { port: String },
    ModelDetected { model: String },
    /// A decrypted image was written to a temporary file.
    ImageStaged {
        label: String,
        path: PathBuf,
        bytes: u64,
    },
    Progress {
        phase: SessionPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// The serial currently on the device. The session now waits for a
    /// replacement.
    OldSerial { serial: SerialNumber },
    /// A candidate replacement failed validation; still waiting.
    SerialRejected {
        candidate: String,
        error: ValidationError,
    },
    SerialWritten { serial: SerialNumber },
    Packet {
        direction: PacketDirection,
        command: String,
        length: usize,
        data: Vec<u8>,
    },
    Log { level: LogLevel, message: String },
    Completed {
        old: SerialNumber,
        new: SerialNumber,
    },
    Aborted { reason: AbortReason },
}

/// Observer trait for receiving session events.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Forwards every event into a channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<SessionEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<SessionEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let Ok(tx) = self.tx.lock() {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            SessionEvent::PortOpened { port } => {
                tracing::info!(port = %port, "Port opened");
            }
            SessionEvent::ModelDetected { model } => {
                tracing::info!(model = %model, "Model detected");
            }
            SessionEvent::ImageStaged { label, path, bytes } => {
                tracing::debug!(label = %label, path = %path.display(), bytes, "Image staged");
            }
            SessionEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(
                    phase = %phase,
                    operation = %operation,
                    progress = %format!("{}%", pct),
                    "Progress"
                );
            }
            SessionEvent::OldSerial { serial } => {
                tracing::info!(serial = %serial, "Current serial read");
            }
            SessionEvent::SerialRejected { candidate, error } => {
                tracing::warn!(candidate = %candidate, error = %error, "Serial rejected");
            }
            SessionEvent::SerialWritten { serial } => {
                tracing::info!(serial = %serial, "Serial written");
            }
            SessionEvent::Packet {
                direction,
                command,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, command = %command, len = length, "Packet");
            }
            SessionEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            SessionEvent::Completed { old, new } => {
                tracing::info!(old = %old, new = %new, "Serial change complete");
            }
            SessionEvent::Aborted { reason } => {
                tracing::error!(reason = %reason, "Session aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_event(&SessionEvent::ModelDetected {
            model: "J680AP".into(),
        });
        match rx.try_recv().unwrap() {
            SessionEvent::ModelDetected { model } => assert_eq!(model, "J680AP"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_channel_observer_tolerates_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_event(&SessionEvent::Aborted {
            reason: AbortReason::UserCancelled,
        });
    }
}
