//! Session events and state types.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::engine::{MessageId, QoS};

/// An application message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Quality of Service level.
    pub qos: QoS,
    /// Whether this is a retained message.
    pub retain: bool,
    /// Message id (for QoS 1/2).
    pub message_id: Option<MessageId>,
}

impl Message {
    /// Create a QoS 0, non-retained message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            message_id: None,
        }
    }
}

/// Engine log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// Matching `log` crate level.
    pub fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Notice | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// `disconnect()` was called or the client was dropped.
    Requested,
    /// The connection was lost; carries the engine's reason code.
    ConnectionLost(i32),
    /// The broker refused the connection; carries the CONNACK return code.
    Refused(i32),
    /// No CONNACK arrived before the connect timeout.
    Timeout,
    /// The engine failed to start the connection.
    EngineFailure(i32),
    /// Automatic reconnection gave up after the configured attempts.
    ReconnectExhausted,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Requested => write!(f, "disconnect requested"),
            ReasonCode::ConnectionLost(rc) => write!(f, "connection lost (rc={})", rc),
            ReasonCode::Refused(rc) => write!(f, "connection refused (rc={})", rc),
            ReasonCode::Timeout => write!(f, "connect timeout"),
            ReasonCode::EngineFailure(rc) => write!(f, "engine failure (rc={})", rc),
            ReasonCode::ReconnectExhausted => write!(f, "reconnect attempts exhausted"),
        }
    }
}

/// Events carried from the network thread to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connected to broker.
    Connected {
        /// CONNACK return code (always 0 for an accepted connection).
        reason_code: i32,
    },
    /// Disconnected from broker.
    Disconnected {
        /// Why the connection ended.
        reason: ReasonCode,
        /// Whether an automatic reconnect is scheduled. `false` is terminal.
        will_reconnect: bool,
    },
    /// About to make an automatic reconnect attempt.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay waited before this attempt.
        delay: Duration,
    },
    /// Received an application message.
    MessageArrived(Message),
    /// QoS 1/2 publish acknowledged.
    PublishAcked { message_id: MessageId },
    /// Subscribe acknowledged.
    SubscribeAcked {
        message_id: MessageId,
        /// Granted QoS per filter (>= 0x80 = failure).
        granted_qos: Vec<u8>,
    },
    /// Unsubscribe acknowledged.
    UnsubscribeAcked { message_id: MessageId },
    /// Engine log line.
    LogEntry { level: LogLevel, text: String },
}

impl Event {
    /// The handler slot this event is delivered to.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected { .. } => EventKind::Connect,
            Event::Disconnected { .. } => EventKind::Disconnect,
            Event::Reconnecting { .. } => EventKind::Reconnecting,
            Event::MessageArrived(_) => EventKind::Message,
            Event::PublishAcked { .. } => EventKind::PublishComplete,
            Event::SubscribeAcked { .. } => EventKind::SubscribeComplete,
            Event::UnsubscribeAcked { .. } => EventKind::UnsubscribeComplete,
            Event::LogEntry { .. } => EventKind::Log,
        }
    }

    /// Whether this is a Disconnected event with no reconnect scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Disconnected {
                will_reconnect: false,
                ..
            }
        )
    }
}

/// Host handler slots, one per kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnecting,
    Message,
    PublishComplete,
    SubscribeComplete,
    UnsubscribeComplete,
    Log,
    /// Synthetic failure for an in-flight operation discarded on disconnect.
    OperationFailed,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Waiting for backoff before reconnecting.
    ReconnectPending,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::ReconnectPending => "reconnect pending",
        };
        f.write_str(name)
    }
}
