//! Last will carried in every connection attempt.

use bytes::Bytes;

use crate::engine::QoS;

/// Message the broker publishes on the session's behalf if the connection
/// ends without a DISCONNECT.
///
/// Set with `ClientHandle::set_will`; it travels in [`ConnectParams`] from
/// the next attempt on.
///
/// [`ConnectParams`]: crate::ConnectParams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Broker keeps the will as the topic's retained message.
    pub retain: bool,
}

impl Will {
    /// A QoS 0, non-retained will.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}
