//! Protocol engine capability surface.
//!
//! The session never speaks MQTT itself. Framing, keep-alive pings and the
//! QoS handshakes belong to a protocol engine that exposes a small set of
//! operations plus a callback interface. One engine instance backs exactly
//! one connection attempt; a fresh one is created through an
//! [`EngineFactory`] every time the session (re)connects.

use std::time::Duration;

use crate::error::EngineError;
use crate::events::{LogLevel, Message};
use crate::will::Will;

/// Protocol-assigned correlation identifier for QoS > 0 operations.
pub type MessageId = u16;

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    AtMostOnce = 0,
    /// At least once delivery (acknowledged).
    AtLeastOnce = 1,
    /// Exactly once delivery (four-step handshake).
    ExactlyOnce = 2,
}

impl QoS {
    /// Convert a raw QoS level, returning `None` for anything above 2.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Raw QoS level.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Parameters for a single connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Ask the broker to discard session state on connect.
    pub clean_session: bool,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Last will message.
    pub will: Option<Will>,
    /// Cap on unacknowledged QoS > 0 publishes (0 = unlimited).
    pub max_inflight_messages: u16,
}

/// Engine-side callbacks.
///
/// The engine invokes these only from inside
/// [`ProtocolEngine::loop_iteration`], i.e. on the network thread.
pub trait EngineCallbacks {
    /// CONNACK received. `rc == 0` means the broker accepted the connection.
    fn on_connect(&mut self, rc: i32);

    /// The connection ended. Non-zero `rc` means it was lost unexpectedly.
    fn on_disconnect(&mut self, rc: i32);

    /// An application message arrived.
    fn on_message(&mut self, message: Message);

    /// A QoS > 0 publish completed its handshake.
    fn on_publish(&mut self, message_id: MessageId);

    /// SUBACK received. Each code is the granted QoS, or >= 0x80 on failure.
    fn on_subscribe(&mut self, message_id: MessageId, granted_qos: &[u8]);

    /// UNSUBACK received.
    fn on_unsubscribe(&mut self, message_id: MessageId);

    /// The engine produced a log line.
    fn on_log(&mut self, level: LogLevel, text: &str);
}

/// Opaque per-connection handle to an MQTT protocol engine.
///
/// Operations other than `loop_iteration` only queue work; their results
/// are observed later through [`EngineCallbacks`].
pub trait ProtocolEngine: Send {
    /// Start connecting to the broker. Completion arrives as `on_connect`.
    fn connect(&mut self, params: &ConnectParams) -> Result<(), EngineError>;

    /// Queue a PUBLISH and return the message id assigned to it.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, EngineError>;

    /// Queue a SUBSCRIBE for one topic filter.
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<MessageId, EngineError>;

    /// Queue an UNSUBSCRIBE for one topic filter.
    fn unsubscribe(&mut self, filter: &str) -> Result<MessageId, EngineError>;

    /// Queue a DISCONNECT.
    fn disconnect(&mut self) -> Result<(), EngineError>;

    /// Run one round of socket I/O, keep-alive and retry handling, waiting at
    /// most `timeout` for network activity. An error means the connection is
    /// gone.
    fn loop_iteration(
        &mut self,
        timeout: Duration,
        callbacks: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError>;
}

/// Creates a fresh engine for every connection attempt.
pub trait EngineFactory: Send + Sync {
    /// Create an engine for `client_id`.
    fn create(&self, client_id: &str) -> Result<Box<dyn ProtocolEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&str) -> Result<Box<dyn ProtocolEngine>, EngineError> + Send + Sync,
{
    fn create(&self, client_id: &str) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        self(client_id)
    }
}
