//! Client error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::MessageId;
use crate::events::ConnectionState;

/// Failure reported by the protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    /// Engine reason code.
    pub code: i32,
    /// Human readable description.
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid state: operation not allowed while {0}")]
    InvalidState(ConnectionState),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Unknown message id {0}")]
    UnknownMessageId(MessageId),

    #[error("Handler error: {0}")]
    Handler(String),

    /// Not produced by the session itself, where connect timeouts arrive as
    /// `ReasonCode::Timeout`. Kept for callers that block on completion.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("Too many publishes in flight (max {0})")]
    InflightLimit(u16),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Error returned by a host handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every host handler.
pub type HandlerResult = std::result::Result<(), HandlerError>;
