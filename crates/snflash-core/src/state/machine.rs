//! Session states and transitions.
//!
//! Transitions are plain data: a handler returns the next [`SessionState`]
//! and [`StateMachineContext::goto_state`] applies it.

use std::fmt;

use crate::payload::PayloadError;
use crate::protocol::ProtocolError;
use crate::serial_number::SerialNumber;
use crate::transport::{LinkError, TransportError};
use crate::vault::VaultError;

/// State without payload, for events and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    ModelDetecting,
    ExploitEntering,
    DiagsDelivering,
    SerialReading,
    AwaitingNewSerial,
    SerialWriting,
    Verifying,
    Completed,
    Aborted,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::ModelDetecting => write!(f, "Model Detecting"),
            SessionPhase::ExploitEntering => write!(f, "Exploit Entering"),
            SessionPhase::DiagsDelivering => write!(f, "Diagnostics Delivering"),
            SessionPhase::SerialReading => write!(f, "Serial Reading"),
            SessionPhase::AwaitingNewSerial => write!(f, "Awaiting New Serial"),
            SessionPhase::SerialWriting => write!(f, "Serial Writing"),
            SessionPhase::Verifying => write!(f, "Verifying"),
            SessionPhase::Completed => write!(f, "Completed"),
            SessionPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Why a session ended without completing. Every variant is a distinct
/// user-facing status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Nothing, or nothing intelligible, came back from the model query.
    NoDeviceResponse,
    UnsupportedModel(String),
    /// A reply arrived that does not fit the command that was sent.
    UnexpectedFrame(String),
    /// A reply had the right shape but unusable content (e.g. a serial that
    /// does not parse).
    ProtocolError(String),
    /// The device answered with NAK or ERR.
    DeviceRejected(String),
    ImageUnavailable(String),
    PayloadUnavailable(String),
    ConnectionLost,
    Timeout,
    VerificationMismatch {
        expected: SerialNumber,
        actual: String,
    },
    UserCancelled,
    TransportFailure(String),
}

impl AbortReason {
    /// Stable short code for logs and the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            AbortReason::NoDeviceResponse => "no-device-response",
            AbortReason::UnsupportedModel(_) => "unsupported-model",
            AbortReason::UnexpectedFrame(_) => "unexpected-frame",
            AbortReason::ProtocolError(_) => "protocol-error",
            AbortReason::DeviceRejected(_) => "device-rejected",
            AbortReason::ImageUnavailable(_) => "image-unavailable",
            AbortReason::PayloadUnavailable(_) => "payload-unavailable",
            AbortReason::ConnectionLost => "connection-lost",
            AbortReason::Timeout => "timeout",
            AbortReason::VerificationMismatch { .. } => "verification-mismatch",
            AbortReason::UserCancelled => "user-cancelled",
            AbortReason::TransportFailure(_) => "transport-failure",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoDeviceResponse => write!(f, "No response from device"),
            AbortReason::UnsupportedModel(m) => write!(f, "Unsupported model: {}", m),
            AbortReason::UnexpectedFrame(d) => write!(f, "Unexpected frame: {}", d),
            AbortReason::ProtocolError(d) => write!(f, "Protocol error: {}", d),
            AbortReason::DeviceRejected(d) => write!(f, "Device rejected command: {}", d),
            AbortReason::ImageUnavailable(d) => write!(f, "Diagnostics image unavailable: {}", d),
            AbortReason::PayloadUnavailable(d) => write!(f, "Exploit payload unavailable: {}", d),
            AbortReason::ConnectionLost => write!(f, "Connection lost"),
            AbortReason::Timeout => write!(f, "Timed out waiting for device"),
            AbortReason::VerificationMismatch { expected, actual } => write!(
                f,
                "Verification mismatch: wrote {}, device reports {}",
                expected, actual
            ),
            AbortReason::UserCancelled => write!(f, "Cancelled by user"),
            AbortReason::TransportFailure(d) => write!(f, "Transport failure: {}", d),
        }
    }
}

impl From<TransportError> for AbortReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionLost | TransportError::NotConnected => {
                AbortReason::ConnectionLost
            }
            TransportError::Timeout { .. } => AbortReason::Timeout,
            other => AbortReason::TransportFailure(other.to_string()),
        }
    }
}

impl From<LinkError> for AbortReason {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Cancelled => AbortReason::UserCancelled,
            LinkError::Transport(t) => t.into(),
        }
    }
}

impl From<ProtocolError> for AbortReason {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::NoDeviceResponse => AbortReason::NoDeviceResponse,
            ProtocolError::UnsupportedModel(m) => AbortReason::UnsupportedModel(m),
            ProtocolError::UnexpectedFrame(d) => AbortReason::UnexpectedFrame(d),
        }
    }
}

impl From<PayloadError> for AbortReason {
    fn from(e: PayloadError) -> Self {
        AbortReason::PayloadUnavailable(e.to_string())
    }
}

impl From<VaultError> for AbortReason {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::UnsupportedModel(m) => AbortReason::UnsupportedModel(m),
            other => AbortReason::ImageUnavailable(other.to_string()),
        }
    }
}

/// Session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ModelDetecting,
    ExploitEntering,
    DiagsDelivering,
    SerialReading,
    AwaitingNewSerial,
    SerialWriting,
    Verifying,
    Completed,
    Aborted(AbortReason),
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::ModelDetecting => SessionPhase::ModelDetecting,
            SessionState::ExploitEntering => SessionPhase::ExploitEntering,
            SessionState::DiagsDelivering => SessionPhase::DiagsDelivering,
            SessionState::SerialReading => SessionPhase::SerialReading,
            SessionState::AwaitingNewSerial => SessionPhase::AwaitingNewSerial,
            SessionState::SerialWriting => SessionPhase::SerialWriting,
            SessionState::Verifying => SessionPhase::Verifying,
            SessionState::Completed => SessionPhase::Completed,
            SessionState::Aborted(_) => SessionPhase::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted(_))
    }

    /// Successor on the success path.
    pub fn next(&self) -> Option<SessionState> {
        let next = match self {
            SessionState::Idle => SessionState::ModelDetecting,
            SessionState::ModelDetecting => SessionState::ExploitEntering,
            SessionState::ExploitEntering => SessionState::DiagsDelivering,
            SessionState::DiagsDelivering => SessionState::SerialReading,
            SessionState::SerialReading => SessionState::AwaitingNewSerial,
            SessionState::AwaitingNewSerial => SessionState::SerialWriting,
            SessionState::SerialWriting => SessionState::Verifying,
            SessionState::Verifying => SessionState::Completed,
            SessionState::Completed | SessionState::Aborted(_) => return None,
        };
        Some(next)
    }

    /// Whether `to` is a legal transition from here.
    pub fn can_transition_to(&self, to: &SessionState) -> bool {
        match to {
            SessionState::Aborted(_) => !self.is_terminal(),
            other => self.next().as_ref() == Some(other),
        }
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            SessionState::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Aborted(reason) => write!(f, "Aborted ({})", reason.code()),
            other => write!(f, "{}", other.phase()),
        }
    }
}

/// Runtime data gathered while the session advances.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    pub state: SessionState,
    /// Model reported by the device.
    pub model: Option<String>,
    /// Serial read before any write.
    pub old_serial: Option<SerialNumber>,
    /// Serial accepted for writing.
    pub new_serial: Option<SerialNumber>,
    /// Phases visited, in order.
    pub history: Vec<SessionPhase>,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self {
            history: vec![SessionPhase::Idle],
            ..Default::default()
        }
    }

    /// Apply a transition. Illegal transitions are refused and logged;
    /// returns whether the state changed.
    pub fn goto_state(&mut self, new_state: SessionState) -> bool {
        if !self.state.can_transition_to(&new_state) {
            tracing::error!(
                from = %self.state,
                to = %new_state,
                "Illegal state transition refused"
            );
            return false;
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.history.push(new_state.phase());
        self.state = new_state;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_sequence() {
        let mut ctx = StateMachineContext::new();
        while let Some(next) = ctx.state.next() {
            assert!(ctx.goto_state(next));
        }
        assert_eq!(ctx.state, SessionState::Completed);
        assert_eq!(
            ctx.history,
            vec![
                SessionPhase::Idle,
                SessionPhase::ModelDetecting,
                SessionPhase::ExploitEntering,
                SessionPhase::DiagsDelivering,
                SessionPhase::SerialReading,
                SessionPhase::AwaitingNewSerial,
                SessionPhase::SerialWriting,
                SessionPhase::Verifying,
                SessionPhase::Completed,
            ]
        );
    }

    #[test]
    fn test_abort_from_any_non_terminal() {
        let mut state = SessionState::Idle;
        loop {
            assert!(state.can_transition_to(&SessionState::Aborted(AbortReason::UserCancelled)));
            match state.next() {
                Some(SessionState::Completed) | None => break,
                Some(next) => state = next,
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut ctx = StateMachineContext::new();
        assert!(ctx.goto_state(SessionState::Aborted(AbortReason::Timeout)));
        assert!(ctx.is_finished());
        assert!(!ctx.goto_state(SessionState::Aborted(AbortReason::ConnectionLost)));
        assert!(!ctx.goto_state(SessionState::ModelDetecting));
        assert_eq!(ctx.state.abort_reason(), Some(&AbortReason::Timeout));
    }

    #[test]
    fn test_skipping_states_refused() {
        let mut ctx = StateMachineContext::new();
        assert!(!ctx.goto_state(SessionState::SerialWriting));
        assert_eq!(ctx.state, SessionState::Idle);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            AbortReason::from(TransportError::ConnectionLost),
            AbortReason::ConnectionLost
        );
        assert_eq!(
            AbortReason::from(TransportError::Timeout { timeout_ms: 5 }),
            AbortReason::Timeout
        );
        assert_eq!(
            AbortReason::from(LinkError::Cancelled),
            AbortReason::UserCancelled
        );
        assert_eq!(
            AbortReason::from(TransportError::WriteFailed("x".into())).code(),
            "transport-failure"
        );
    }

    #[test]
    fn test_codes_distinct() {
        let sn: SerialNumber = "C02123ABCQ6L".parse().unwrap();
        let all = [
            AbortReason::NoDeviceResponse,
            AbortReason::UnsupportedModel(String::new()),
            AbortReason::UnexpectedFrame(String::new()),
            AbortReason::ProtocolError(String::new()),
            AbortReason::DeviceRejected(String::new()),
            AbortReason::ImageUnavailable(String::new()),
            AbortReason::PayloadUnavailable(String::new()),
            AbortReason::ConnectionLost,
            AbortReason::Timeout,
            AbortReason::VerificationMismatch {
                expected: sn,
                actual: String::new(),
            },
            AbortReason::UserCancelled,
            AbortReason::TransportFailure(String::new()),
        ];
        let codes: std::collections::HashSet<_> = all.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all.len());
    }
}
