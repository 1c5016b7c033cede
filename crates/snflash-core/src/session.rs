//! Device session: the high-level orchestrator for one reprogramming run.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::audit::{AuditLog, AuditLogRecord, AuditOutcome, NullTelemetry, Telemetry};
use crate::config::SessionConfig;
use crate::events::{PacketDirection, SessionEvent, SessionObserver, TracingObserver};
use crate::payload::ExploitPayloadProvider;
use crate::protocol::constants::{
    FRAME_HEADER_SIZE, TAG_EXPLOIT, TAG_XFER_BEGIN, TAG_XFER_CHUNK, TAG_XFER_END,
};
use crate::serial_number::{self, SerialNumber, ValidationError};
use crate::state::handlers::{HandlerContext, SessionControl, handle_state, packet_preview};
use crate::state::machine::{AbortReason, SessionPhase, SessionState, StateMachineContext};
use crate::transport::{CancelToken, PortDescriptor, RxEvent, SerialTransport, TransportError};
use crate::vault::ImageVault;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Verification mismatch: wrote {expected}, device reports {actual}")]
    VerificationMismatch {
        expected: SerialNumber,
        actual: String,
    },

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Session aborted: {0}")]
    Aborted(AbortReason),

    #[error("Session worker panicked")]
    WorkerPanicked,
}

impl From<AbortReason> for SessionError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::VerificationMismatch { expected, actual } => {
                SessionError::VerificationMismatch { expected, actual }
            }
            AbortReason::UserCancelled => SessionError::UserCancelled,
            other => SessionError::Aborted(other),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { old: SerialNumber, new: SerialNumber },
    Aborted(AbortReason),
}

/// Everything known about a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub model: Option<String>,
    pub old_serial: Option<SerialNumber>,
    pub new_serial: Option<SerialNumber>,
    /// Phases visited, in order.
    pub history: Vec<SessionPhase>,
    /// Set when the audit record could not be written.
    pub audit_error: Option<String>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Completed { .. })
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.outcome {
            SessionOutcome::Aborted(reason) => Some(reason),
            SessionOutcome::Completed { .. } => None,
        }
    }

    /// `(old, new)` on success.
    pub fn into_result(self) -> Result<(SerialNumber, SerialNumber), SessionError> {
        match self.outcome {
            SessionOutcome::Completed { old, new } => Ok((old, new)),
            SessionOutcome::Aborted(reason) => Err(reason.into()),
        }
    }
}

/// Cloneable remote control for a session running elsewhere.
#[derive(Clone)]
pub struct SessionController {
    control: Sender<SessionControl>,
    cancel: CancelToken,
}

impl SessionController {
    /// Offer a replacement serial. The local check result is returned at
    /// once; the candidate is forwarded either way so the session reports a
    /// rejection too. Invalid candidates never reach the device.
    pub fn submit_serial(&self, candidate: &str) -> Result<SerialNumber, ValidationError> {
        let parsed = serial_number::parse(candidate);
        // A finished session has dropped its receiver.
        let _ = self
            .control
            .send(SessionControl::NewSerial(candidate.to_string()));
        parsed
    }

    /// Stop the session at the next opportunity.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.control.send(SessionControl::Cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A session running on its own worker thread.
pub struct SessionHandle {
    controller: SessionController,
    worker: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    pub fn submit_serial(&self, candidate: &str) -> Result<SerialNumber, ValidationError> {
        self.controller.submit_serial(candidate)
    }

    pub fn cancel(&self) {
        self.controller.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and return its report.
    pub fn join(self) -> Result<SessionReport, SessionError> {
        self.worker.join().map_err(|_| SessionError::WorkerPanicked)
    }
}

/// One reprogramming session against one port.
pub struct DeviceSession<T: SerialTransport, O: SessionObserver> {
    config: SessionConfig,
    port: PortDescriptor,
    transport: T,
    observer: Arc<O>,
    vault: ImageVault,
    payloads: Arc<dyn ExploitPayloadProvider>,
    audit: AuditLog,
    telemetry: Arc<dyn Telemetry>,
    cancel: CancelToken,
    control_tx: Sender<SessionControl>,
    control_rx: Receiver<SessionControl>,
}

impl<T: SerialTransport> DeviceSession<T, TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(
        config: SessionConfig,
        port: PortDescriptor,
        transport: T,
        payloads: Arc<dyn ExploitPayloadProvider>,
    ) -> Self {
        Self::with_observer(config, port, transport, payloads, Arc::new(TracingObserver))
    }
}

impl<T: SerialTransport, O: SessionObserver> DeviceSession<T, O> {
    /// Create a new session with a custom observer. The vault is built from
    /// the config's assets.
    pub fn with_observer(
        config: SessionConfig,
        port: PortDescriptor,
        transport: T,
        payloads: Arc<dyn ExploitPayloadProvider>,
        observer: Arc<O>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        Self {
            vault: config.build_vault(),
            audit: AuditLog::new(config.audit_log_path.clone()),
            config,
            port,
            transport,
            observer,
            payloads,
            telemetry: Arc::new(NullTelemetry),
            cancel: CancelToken::new(),
            control_tx,
            control_rx,
        }
    }

    pub fn with_vault(mut self, vault: ImageVault) -> Self {
        self.vault = vault;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn controller(&self) -> SessionController {
        SessionController {
            control: self.control_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run to a terminal state on the calling thread. Feed it through a
    /// [`SessionController`] from another thread.
    #[instrument(skip(self), fields(port = %self.port.name))]
    pub fn run(&mut self) -> SessionReport {
        let mut observed = ObservableTransport {
            inner: &mut self.transport,
            observer: self.observer.as_ref(),
        };
        let mut ctx = HandlerContext {
            transport: &mut observed,
            observer: self.observer.as_ref(),
            state: StateMachineContext::new(),
            config: &self.config,
            port: &self.port,
            vault: &self.vault,
            payloads: self.payloads.as_ref(),
            control: &self.control_rx,
            cancel: self.cancel.clone(),
            link: None,
            staged: Vec::new(),
        };

        while !ctx.state.is_finished() {
            let next = if ctx.cancel.is_cancelled() {
                SessionState::Aborted(AbortReason::UserCancelled)
            } else {
                handle_state(&mut ctx)
            };
            let from = ctx.state.state.phase();
            let to = next.phase();
            if ctx.state.goto_state(next) {
                ctx.emit(SessionEvent::PhaseChanged { from, to });
            } else {
                // Handlers only produce legal successors; refuse to spin.
                error!(from = %from, to = %to, "Session stuck, aborting");
                let stuck = SessionState::Aborted(AbortReason::ProtocolError(format!(
                    "illegal transition {} -> {}",
                    from, to
                )));
                ctx.state.goto_state(stuck);
                ctx.emit(SessionEvent::PhaseChanged {
                    from,
                    to: SessionPhase::Aborted,
                });
            }
        }

        // Exit path shared by success and every abort.
        ctx.link = None;
        ctx.transport.close();
        for image in ctx.staged.drain(..) {
            let path = image.path().to_path_buf();
            if let Err(e) = image.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove staged image");
            }
        }

        let state = ctx.state;
        let outcome = match (&state.state, &state.old_serial, &state.new_serial) {
            (SessionState::Completed, Some(old), Some(new)) => SessionOutcome::Completed {
                old: old.clone(),
                new: new.clone(),
            },
            (SessionState::Aborted(reason), _, _) => SessionOutcome::Aborted(reason.clone()),
            _ => SessionOutcome::Aborted(AbortReason::ProtocolError(
                "completed without serials".into(),
            )),
        };
        self.finish(state, outcome)
    }

    /// Run on a dedicated worker thread.
    pub fn spawn(mut self) -> std::io::Result<SessionHandle>
    where
        T: 'static,
        O: 'static,
    {
        let controller = self.controller();
        let worker = thread::Builder::new()
            .name("snflash-session".into())
            .spawn(move || self.run())?;
        Ok(SessionHandle { controller, worker })
    }

    fn finish(&self, state: StateMachineContext, outcome: SessionOutcome) -> SessionReport {
        let audit_outcome = match &outcome {
            SessionOutcome::Completed { .. } => AuditOutcome::Success,
            SessionOutcome::Aborted(reason) => AuditOutcome::from(reason),
        };
        let record = AuditLogRecord::now(
            state.old_serial.clone(),
            state.new_serial.clone(),
            audit_outcome,
        );
        let audit_error = match self.audit.append(&record) {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Failed to write audit record");
                Some(e.to_string())
            }
        };
        self.telemetry.publish(&record);

        match &outcome {
            SessionOutcome::Completed { old, new } => {
                info!(old = %old, new = %new, "Session completed");
                self.observer.on_event(&SessionEvent::Completed {
                    old: old.clone(),
                    new: new.clone(),
                });
            }
            SessionOutcome::Aborted(reason) => {
                warn!(reason = %reason, code = reason.code(), "Session aborted");
                self.observer.on_event(&SessionEvent::Aborted {
                    reason: reason.clone(),
                });
            }
        }

        SessionReport {
            outcome,
            model: state.model,
            old_serial: state.old_serial,
            new_serial: state.new_serial,
            history: state.history,
            audit_error,
        }
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: SerialTransport, O: SessionObserver> {
    inner: &'a mut T,
    observer: &'a O,
}

impl<'a, T: SerialTransport, O: SessionObserver> SerialTransport for ObservableTransport<'a, T, O> {
    fn open(&mut self, port: &PortDescriptor) -> Result<Receiver<RxEvent>, TransportError> {
        self.inner.open(port)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.send(data);
        if res.is_ok() {
            let command = command_label(data);
            self.observer.on_event(&SessionEvent::Packet {
                direction: PacketDirection::Tx,
                command,
                length: data.len(),
                data: packet_preview(data),
            });
        }
        res
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

/// Binary tag, or the text command up to its argument.
fn command_label(data: &[u8]) -> String {
    const TAGS: [[u8; 4]; 4] = [TAG_EXPLOIT, TAG_XFER_BEGIN, TAG_XFER_CHUNK, TAG_XFER_END];
    if data.len() >= FRAME_HEADER_SIZE && TAGS.iter().any(|tag| data.starts_with(tag)) {
        return String::from_utf8_lossy(&data[..4]).into_owned();
    }
    let end = data
        .iter()
        .position(|&b| matches!(b, b'=' | b'\r' | b'\n'))
        .map(|i| if data[i] == b'=' { i + 1 } else { i })
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, ImageKind};

    #[test]
    fn test_command_label() {
        assert_eq!(command_label(&Command::QueryModel.encode()), "MODEL?");
        let sn: SerialNumber = "C02123ABCQ6L".parse().unwrap();
        assert_eq!(command_label(&Command::WriteSerial(sn).encode()), "SN=");
        let begin = Command::TransferBegin {
            kind: ImageKind::Boot,
            total_len: 1,
            chunk_count: 1,
        };
        assert_eq!(command_label(&begin.encode()), "XFRB");
    }

    #[test]
    fn test_abort_reason_to_session_error() {
        assert_eq!(
            SessionError::from(AbortReason::UserCancelled),
            SessionError::UserCancelled
        );
        assert_eq!(
            SessionError::from(AbortReason::Timeout),
            SessionError::Aborted(AbortReason::Timeout)
        );
    }

    #[test]
    fn test_submit_serial_validates_locally() {
        let (tx, rx) = mpsc::channel();
        let controller = SessionController {
            control: tx,
            cancel: CancelToken::new(),
        };
        assert!(controller.submit_serial("C02-ABCD1234XZ").is_err());
        assert!(controller.submit_serial("C02123XYZQ6L").is_ok());
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionControl::NewSerial("C02-ABCD1234XZ".into())
        );
        controller.cancel();
        assert!(controller.is_cancelled());
    }
}
