//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandlerContext, SessionControl, StepResult, handle_state};
pub use machine::{AbortReason, SessionPhase, SessionState, StateMachineContext};
