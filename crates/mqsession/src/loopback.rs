//! In-process protocol engine.
//!
//! [`LoopbackBroker`] behaves like a tiny broker living inside the process:
//! every connection it hands out acknowledges publishes, grants
//! subscriptions and routes publishes back to its own matching
//! subscriptions. The broker side can refuse or fail connects, hold
//! CONNACKs or acknowledgments, drop the live connection and inject inbound
//! messages, which makes it possible to drive the real network and
//! dispatcher threads from tests and demos.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::engine::{
    ConnectParams, EngineCallbacks, EngineFactory, MessageId, ProtocolEngine, QoS,
};
use crate::error::EngineError;
use crate::events::{LogLevel, Message};
use crate::subscription::topic_matches_filter;

/// Invalid argument.
pub const ERR_INVAL: i32 = 3;
/// No connection.
pub const ERR_NO_CONN: i32 = 4;
/// Connection refused at the transport level.
pub const ERR_CONN_REFUSED: i32 = 5;
/// Connection lost.
pub const ERR_CONN_LOST: i32 = 7;

const IDLE_WAIT: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct BrokerState {
    refuse_rc: i32,
    fail_connects: u32,
    hold_connack: bool,
    hold_acks: bool,
    duplicate_acks: bool,
    reject_subscriptions: bool,
    drop_requested: bool,
    connected: bool,
    next_id: MessageId,
    inbound: VecDeque<Message>,
    connect_attempts: Vec<Instant>,
    last_connect: Option<ConnectParams>,
    published: Vec<Message>,
}

impl BrokerState {
    fn next_id(&mut self) -> MessageId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id
    }
}

/// Engine factory backed by an in-process broker.
///
/// Clones share the same broker, so a test keeps one clone for fault
/// injection and hands another to the client.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer future CONNECTs with return code `rc` (0 accepts).
    pub fn refuse(&self, rc: i32) {
        self.state.lock().refuse_rc = rc;
    }

    /// Make the next `count` engine connects fail outright.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_connects = count;
    }

    /// Withhold CONNACK while `hold` is set.
    pub fn hold_connack(&self, hold: bool) {
        self.state.lock().hold_connack = hold;
    }

    /// Withhold PUBACK/SUBACK/UNSUBACK while `hold` is set.
    pub fn hold_acks(&self, hold: bool) {
        self.state.lock().hold_acks = hold;
    }

    /// Send every PUBACK/SUBACK/UNSUBACK twice while `duplicate` is set.
    pub fn duplicate_acks(&self, duplicate: bool) {
        self.state.lock().duplicate_acks = duplicate;
    }

    /// Answer SUBSCRIBE with the failure code 0x80 while `reject` is set.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.state.lock().reject_subscriptions = reject;
    }

    /// Drop the live connection on its next loop iteration.
    pub fn drop_connection(&self) {
        self.state.lock().drop_requested = true;
    }

    /// Deliver `message` to the live connection, subscribed or not.
    pub fn inject(&self, message: Message) {
        self.state.lock().inbound.push_back(message);
    }

    /// When each engine connect was attempted.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.clone()
    }

    /// Parameters of the most recent connect attempt.
    pub fn last_connect(&self) -> Option<ConnectParams> {
        self.state.lock().last_connect.clone()
    }

    /// Every message clients published, in order.
    pub fn published(&self) -> Vec<Message> {
        self.state.lock().published.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

impl EngineFactory for LoopbackBroker {
    fn create(&self, client_id: &str) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        Ok(Box::new(LoopbackEngine {
            client_id: client_id.to_string(),
            broker: self.state.clone(),
            phase: Phase::Idle,
            outbox: VecDeque::new(),
            held: VecDeque::new(),
            subscriptions: Vec::new(),
            disconnect_requested: false,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingConnack,
    Connected,
    Closed,
}

#[derive(Debug)]
enum Outgoing {
    Log(LogLevel, String),
    Connack(i32),
    Puback(MessageId),
    Suback(MessageId, u8),
    Unsuback(MessageId),
    Deliver(Message),
}

impl Outgoing {
    fn is_ack(&self) -> bool {
        matches!(
            self,
            Outgoing::Puback(_) | Outgoing::Suback(..) | Outgoing::Unsuback(_)
        )
    }
}

/// One connection to a [`LoopbackBroker`].
pub struct LoopbackEngine {
    client_id: String,
    broker: Arc<Mutex<BrokerState>>,
    phase: Phase,
    outbox: VecDeque<Outgoing>,
    held: VecDeque<Outgoing>,
    subscriptions: Vec<(String, QoS)>,
    disconnect_requested: bool,
}

impl LoopbackEngine {
    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.phase == Phase::Connected && !self.disconnect_requested {
            Ok(())
        } else {
            Err(EngineError::new(ERR_NO_CONN, "not connected"))
        }
    }

    fn log(&mut self, level: LogLevel, text: String) {
        self.outbox.push_back(Outgoing::Log(level, text));
    }
}

impl ProtocolEngine for LoopbackEngine {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), EngineError> {
        if self.phase != Phase::Idle {
            return Err(EngineError::new(ERR_INVAL, "connect already started"));
        }

        {
            let mut broker = self.broker.lock();
            broker.connect_attempts.push(Instant::now());
            broker.last_connect = Some(params.clone());
            if broker.fail_connects > 0 {
                broker.fail_connects -= 1;
                return Err(EngineError::new(
                    ERR_CONN_REFUSED,
                    format!("connection to {}:{} refused", params.host, params.port),
                ));
            }
        }

        self.phase = Phase::AwaitingConnack;
        self.log(
            LogLevel::Debug,
            format!("Client {} sending CONNECT", self.client_id),
        );
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, EngineError> {
        self.ensure_connected()?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(EngineError::new(ERR_INVAL, format!("invalid topic '{}'", topic)));
        }

        let payload = Bytes::copy_from_slice(payload);
        let message_id = {
            let mut broker = self.broker.lock();
            let message_id = broker.next_id();
            broker.published.push(Message {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
                message_id: (qos != QoS::AtMostOnce).then_some(message_id),
            });
            message_id
        };

        if qos != QoS::AtMostOnce {
            self.outbox.push_back(Outgoing::Puback(message_id));
        }

        let granted = self
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches_filter(topic, filter))
            .map(|(_, sub_qos)| *sub_qos)
            .max();
        if let Some(sub_qos) = granted {
            let delivered_qos = qos.min(sub_qos);
            self.outbox.push_back(Outgoing::Deliver(Message {
                topic: topic.to_string(),
                payload,
                qos: delivered_qos,
                retain: false,
                message_id: (delivered_qos != QoS::AtMostOnce).then_some(message_id),
            }));
        }

        Ok(message_id)
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<MessageId, EngineError> {
        self.ensure_connected()?;
        if filter.is_empty() {
            return Err(EngineError::new(ERR_INVAL, "empty topic filter"));
        }

        let (message_id, reject) = {
            let mut broker = self.broker.lock();
            (broker.next_id(), broker.reject_subscriptions)
        };
        let code = if reject { 0x80 } else { qos.as_u8() };
        if !reject {
            self.subscriptions.retain(|(existing, _)| existing != filter);
            self.subscriptions.push((filter.to_string(), qos));
        }
        self.outbox.push_back(Outgoing::Suback(message_id, code));
        Ok(message_id)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<MessageId, EngineError> {
        self.ensure_connected()?;
        let message_id = self.broker.lock().next_id();
        self.subscriptions.retain(|(existing, _)| existing != filter);
        self.outbox.push_back(Outgoing::Unsuback(message_id));
        Ok(message_id)
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::AwaitingConnack | Phase::Connected => {
                self.disconnect_requested = true;
                self.log(
                    LogLevel::Debug,
                    format!("Client {} sending DISCONNECT", self.client_id),
                );
                Ok(())
            }
            _ => Err(EngineError::new(ERR_NO_CONN, "not connected")),
        }
    }

    fn loop_iteration(
        &mut self,
        timeout: Duration,
        callbacks: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        match self.phase {
            Phase::Idle => return Err(EngineError::new(ERR_NO_CONN, "not connected")),
            Phase::Closed => return Err(EngineError::new(ERR_CONN_LOST, "connection closed")),
            _ => {}
        }

        let (dropped, hold_acks, duplicate_acks) = {
            let mut broker = self.broker.lock();
            if self.phase == Phase::AwaitingConnack && !broker.hold_connack {
                let rc = broker.refuse_rc;
                self.outbox.push_back(Outgoing::Log(
                    LogLevel::Debug,
                    format!("Client {} received CONNACK ({})", self.client_id, rc),
                ));
                self.outbox.push_back(Outgoing::Connack(rc));
                if rc == 0 {
                    self.phase = Phase::Connected;
                    broker.connected = true;
                } else {
                    self.phase = Phase::Closed;
                }
            }

            let dropped = self.phase == Phase::Connected && broker.drop_requested;
            if dropped {
                broker.drop_requested = false;
                broker.connected = false;
                self.phase = Phase::Closed;
            } else if self.phase == Phase::Connected {
                let inbound: Vec<_> = broker.inbound.drain(..).collect();
                self.outbox.extend(inbound.into_iter().map(Outgoing::Deliver));
            }
            (dropped, broker.hold_acks, broker.duplicate_acks)
        };

        if dropped {
            self.outbox.clear();
            self.held.clear();
            callbacks.on_log(
                LogLevel::Notice,
                &format!("Client {} lost connection", self.client_id),
            );
            callbacks.on_disconnect(ERR_CONN_LOST);
            return Ok(());
        }

        let mut activity = false;
        if !hold_acks {
            while let Some(item) = self.held.pop_back() {
                self.outbox.push_front(item);
            }
        }
        while let Some(item) = self.outbox.pop_front() {
            if hold_acks && item.is_ack() {
                self.held.push_back(item);
                continue;
            }
            activity = true;
            let repeat = if duplicate_acks && item.is_ack() { 2 } else { 1 };
            match item {
                Outgoing::Log(level, text) => callbacks.on_log(level, &text),
                Outgoing::Connack(rc) => callbacks.on_connect(rc),
                Outgoing::Puback(id) => (0..repeat).for_each(|_| callbacks.on_publish(id)),
                Outgoing::Suback(id, code) => {
                    (0..repeat).for_each(|_| callbacks.on_subscribe(id, &[code]))
                }
                Outgoing::Unsuback(id) => (0..repeat).for_each(|_| callbacks.on_unsubscribe(id)),
                Outgoing::Deliver(message) => callbacks.on_message(message),
            }
        }

        if self.disconnect_requested && self.phase != Phase::Closed {
            self.phase = Phase::Closed;
            self.broker.lock().connected = false;
            callbacks.on_disconnect(0);
            return Ok(());
        }

        if !activity {
            thread::sleep(timeout.min(IDLE_WAIT));
        }
        Ok(())
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        if self.phase == Phase::Connected {
            self.broker.lock().connected = false;
        }
    }
}
