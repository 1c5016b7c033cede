//! Wire protocol spoken by the controller's serial console.

pub mod constants;
pub mod frame;
pub mod reply;

pub use constants::*;
pub use frame::{AckFrame, Command, ImageKind};
pub use reply::TextReply;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No response from device")]
    NoDeviceResponse,

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}
