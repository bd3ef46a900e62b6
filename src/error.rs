//! Error taxonomy for the dispatch daemon.
//!
//! Each module that can fail owns a `thiserror` enum scoped to its own
//! concerns (see `protocol`, `plan`, `config`, `net`). This module holds
//! the handful of error types shared across more than one of them.

use thiserror::Error;

/// Errors raised while driving a coupled device session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device is not coupled to an observation system")]
    NotCoupled,
    #[error("command is not valid in the current state: {0}")]
    InvalidCommand(String),
    #[error("device session closed: {0}")]
    SessionClosed(String),
}
