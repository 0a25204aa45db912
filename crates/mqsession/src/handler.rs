//! Host handler slots.
//!
//! One slot per [`EventKind`]. Handlers run on the dispatcher thread and
//! receive a [`ClientHandle`] so they can publish, subscribe or disconnect
//! from inside the callback.

use std::time::Duration;

use ahash::AHashMap;

use crate::engine::MessageId;
use crate::error::HandlerResult;
use crate::events::{EventKind, LogLevel, Message, ReasonCode};
use crate::inflight::InFlightOperation;
use crate::session::ClientHandle;

/// Called with the CONNACK return code once the session is connected.
pub type ConnectHandler = Box<dyn FnMut(&ClientHandle, i32) -> HandlerResult + Send>;
/// Called with the reason and whether a reconnect is scheduled.
pub type DisconnectHandler =
    Box<dyn FnMut(&ClientHandle, ReasonCode, bool) -> HandlerResult + Send>;
/// Called with the attempt number and the delay waited before it.
pub type ReconnectingHandler =
    Box<dyn FnMut(&ClientHandle, u32, Duration) -> HandlerResult + Send>;
pub type MessageHandler = Box<dyn FnMut(&ClientHandle, &Message) -> HandlerResult + Send>;
pub type PublishHandler = Box<dyn FnMut(&ClientHandle, MessageId) -> HandlerResult + Send>;
/// Called with the message id and the granted QoS codes.
pub type SubscribeHandler =
    Box<dyn FnMut(&ClientHandle, MessageId, &[u8]) -> HandlerResult + Send>;
pub type UnsubscribeHandler = Box<dyn FnMut(&ClientHandle, MessageId) -> HandlerResult + Send>;
pub type LogHandler = Box<dyn FnMut(&ClientHandle, LogLevel, &str) -> HandlerResult + Send>;
/// Called for each in-flight operation discarded on disconnect.
pub type OperationFailedHandler =
    Box<dyn FnMut(&ClientHandle, &InFlightOperation, ReasonCode) -> HandlerResult + Send>;

/// A host handler for one kind of event.
pub enum Handler {
    Connect(ConnectHandler),
    Disconnect(DisconnectHandler),
    Reconnecting(ReconnectingHandler),
    Message(MessageHandler),
    PublishComplete(PublishHandler),
    SubscribeComplete(SubscribeHandler),
    UnsubscribeComplete(UnsubscribeHandler),
    Log(LogHandler),
    OperationFailed(OperationFailedHandler),
}

impl Handler {
    /// The slot this handler occupies.
    pub fn kind(&self) -> EventKind {
        match self {
            Handler::Connect(_) => EventKind::Connect,
            Handler::Disconnect(_) => EventKind::Disconnect,
            Handler::Reconnecting(_) => EventKind::Reconnecting,
            Handler::Message(_) => EventKind::Message,
            Handler::PublishComplete(_) => EventKind::PublishComplete,
            Handler::SubscribeComplete(_) => EventKind::SubscribeComplete,
            Handler::UnsubscribeComplete(_) => EventKind::UnsubscribeComplete,
            Handler::Log(_) => EventKind::Log,
            Handler::OperationFailed(_) => EventKind::OperationFailed,
        }
    }

    pub(crate) fn invoke(&mut self, client: &ClientHandle, call: &Invocation<'_>) -> HandlerResult {
        match (self, call) {
            (Handler::Connect(f), Invocation::Connect(rc)) => f(client, *rc),
            (Handler::Disconnect(f), Invocation::Disconnect(reason, again)) => {
                f(client, *reason, *again)
            }
            (Handler::Reconnecting(f), Invocation::Reconnecting(attempt, delay)) => {
                f(client, *attempt, *delay)
            }
            (Handler::Message(f), Invocation::Message(msg)) => f(client, *msg),
            (Handler::PublishComplete(f), Invocation::PublishComplete(id)) => f(client, *id),
            (Handler::SubscribeComplete(f), Invocation::SubscribeComplete(id, granted)) => {
                f(client, *id, *granted)
            }
            (Handler::UnsubscribeComplete(f), Invocation::UnsubscribeComplete(id)) => {
                f(client, *id)
            }
            (Handler::Log(f), Invocation::Log(level, text)) => f(client, *level, *text),
            (Handler::OperationFailed(f), Invocation::OperationFailed(op, reason)) => {
                f(client, *op, *reason)
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// Arguments for one handler call.
#[derive(Debug)]
pub(crate) enum Invocation<'a> {
    Connect(i32),
    Disconnect(ReasonCode, bool),
    Reconnecting(u32, Duration),
    Message(&'a Message),
    PublishComplete(MessageId),
    SubscribeComplete(MessageId, &'a [u8]),
    UnsubscribeComplete(MessageId),
    Log(LogLevel, &'a str),
    OperationFailed(&'a InFlightOperation, ReasonCode),
}

impl Invocation<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Invocation::Connect(_) => EventKind::Connect,
            Invocation::Disconnect(..) => EventKind::Disconnect,
            Invocation::Reconnecting(..) => EventKind::Reconnecting,
            Invocation::Message(_) => EventKind::Message,
            Invocation::PublishComplete(_) => EventKind::PublishComplete,
            Invocation::SubscribeComplete(..) => EventKind::SubscribeComplete,
            Invocation::UnsubscribeComplete(_) => EventKind::UnsubscribeComplete,
            Invocation::Log(..) => EventKind::Log,
            Invocation::OperationFailed(..) => EventKind::OperationFailed,
        }
    }
}

/// Registered handlers.
///
/// While a handler runs it is taken out of its slot, so the slot lock is
/// never held across host code and a handler may replace or clear itself.
#[derive(Debug, Default)]
pub(crate) struct HandlerSlots {
    slots: AHashMap<EventKind, Handler>,
    /// Kinds whose handler is running, and whether it was cleared meanwhile.
    running: AHashMap<EventKind, bool>,
}

impl HandlerSlots {
    /// Install a handler, returning the one it replaced.
    pub fn set(&mut self, handler: Handler) -> Option<Handler> {
        self.slots.insert(handler.kind(), handler)
    }

    pub fn clear(&mut self, kind: EventKind) -> Option<Handler> {
        if let Some(cleared) = self.running.get_mut(&kind) {
            *cleared = true;
        }
        self.slots.remove(&kind)
    }

    pub fn take(&mut self, kind: EventKind) -> Option<Handler> {
        let handler = self.slots.remove(&kind)?;
        self.running.insert(kind, false);
        Some(handler)
    }

    /// Put a handler back after a call unless the slot was refilled or
    /// cleared meanwhile.
    pub fn restore(&mut self, handler: Handler) {
        let kind = handler.kind();
        if self.running.remove(&kind).unwrap_or(false) {
            return;
        }
        self.slots.entry(kind).or_insert(handler);
    }

    #[cfg(test)]
    pub fn is_set(&self, kind: EventKind) -> bool {
        self.slots.contains_key(&kind)
    }
}
