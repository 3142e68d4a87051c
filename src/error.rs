//! Error types for bus operations.
//!
//! Only genuine failures are errors. Expected conditions such as a duplicate
//! subscription or a transmit with no subscribers come back as success-class
//! values ([`crate::SubscribeStatus`], [`crate::TransmitReport`], ...).

use crate::config::ConfigError;
use crate::header::HeaderError;
use crate::identity::IdentityError;
use crate::ids::{AppId, BufferHandle, MsgId, PipeId};
use crate::mempool::PoolError;
use crate::queue::QueueError;

/// Result type alias for bus operations
pub type Result<T> = core::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Malformed request: zero depth, empty name, bad timeout, short message.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// Pipe id does not name a pipe that is currently in use.
    #[error("{0} does not exist")]
    InvalidPipe(PipeId),

    #[error("{pipe} is not owned by {caller}")]
    NotOwner { pipe: PipeId, caller: AppId },

    #[error("invalid message id {0}")]
    InvalidMsgId(MsgId),

    #[error("message size {size} exceeds maximum {max}")]
    MsgTooBig { size: usize, max: usize },

    #[error("pipe table full ({0} pipes)")]
    MaxPipesMet(usize),

    #[error("pipe name '{0}' already in use")]
    PipeNameTaken(String),

    #[error("pipe queue creation failed: {0}")]
    PipeCreateFailed(#[source] QueueError),

    #[error("routing table full ({0} message ids)")]
    MaxMsgsMet(usize),

    #[error("{msg_id} already has the maximum of {max} destinations")]
    MaxDestsMet { msg_id: MsgId, max: usize },

    /// Pool could not supply a buffer or destination block.
    #[error("buffer allocation failed: {0}")]
    BufferAllocFailed(#[from] PoolError),

    /// Handle is stale, or not a zero-copy buffer held by the caller.
    #[error("{0} is not a valid buffer")]
    BufferInvalid(BufferHandle),

    #[error("read from {pipe} failed: {cause}")]
    PipeReadError { pipe: PipeId, cause: QueueError },

    /// Every destination that was attempted failed.
    #[error("delivery of {msg_id} failed on all {failed} destinations")]
    DeliveryFailed { msg_id: MsgId, failed: u16 },

    #[error("identity lookup failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("message header error: {0}")]
    Header(#[from] HeaderError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// True for the resource-exhaustion family: tables full, pool exhausted.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::MaxPipesMet(_)
                | Self::MaxMsgsMet(_)
                | Self::MaxDestsMet { .. }
                | Self::BufferAllocFailed(_)
        )
    }

    /// True for errors caused by the caller's arguments rather than bus state.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::BadArgument(_)
                | Self::InvalidPipe(_)
                | Self::NotOwner { .. }
                | Self::InvalidMsgId(_)
                | Self::MsgTooBig { .. }
                | Self::BufferInvalid(_)
        )
    }
}
