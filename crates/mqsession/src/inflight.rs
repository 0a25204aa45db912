//! In-flight operation tracking.
//!
//! Correlates acknowledgments with the publish/subscribe/unsubscribe call
//! that caused them. An entry exists only for a message id the engine
//! handed back to this session; it leaves the table when the matching ack
//! is dispatched or when the disconnect policy discards it.

use std::time::Instant;

use ahash::AHashMap;

use crate::engine::{MessageId, QoS};
use crate::error::ClientError;

/// What kind of operation is awaiting acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// QoS 1/2 PUBLISH awaiting PUBACK/PUBCOMP.
    Publish,
    /// SUBSCRIBE awaiting SUBACK.
    Subscribe,
    /// UNSUBSCRIBE awaiting UNSUBACK.
    Unsubscribe,
}

/// A pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightOperation {
    /// Engine-assigned message id.
    pub message_id: MessageId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Publish topic or subscription filter.
    pub topic: String,
    /// Publish QoS or requested subscription QoS.
    pub qos: QoS,
    /// When the operation was handed to the engine.
    pub submitted_at: Instant,
}

impl InFlightOperation {
    pub fn new(message_id: MessageId, kind: OperationKind, topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            message_id,
            kind,
            topic: topic.into(),
            qos,
            submitted_at: Instant::now(),
        }
    }
}

/// Pending operations keyed by message id.
#[derive(Debug, Default)]
pub struct InFlightTable {
    ops: AHashMap<MessageId, (u64, InFlightOperation)>,
    next_seq: u64,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outstanding operation.
    ///
    /// Returns the entry it replaced if the engine reused a message id that
    /// was still pending.
    pub fn register(&mut self, op: InFlightOperation) -> Option<InFlightOperation> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops
            .insert(op.message_id, (seq, op))
            .map(|(_, replaced)| replaced)
    }

    /// Remove the entry matching an acknowledgment.
    ///
    /// Fails with `UnknownMessageId` when no entry exists, or when the entry
    /// is for a different kind of operation (which stays in the table).
    pub fn resolve(
        &mut self,
        message_id: MessageId,
        kind: OperationKind,
    ) -> Result<InFlightOperation, ClientError> {
        match self.ops.get(&message_id) {
            Some((_, op)) if op.kind == kind => {}
            _ => return Err(ClientError::UnknownMessageId(message_id)),
        }
        self.ops
            .remove(&message_id)
            .map(|(_, op)| op)
            .ok_or(ClientError::UnknownMessageId(message_id))
    }

    /// Look up a pending operation.
    pub fn get(&self, message_id: MessageId) -> Option<&InFlightOperation> {
        self.ops.get(&message_id).map(|(_, op)| op)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.ops.contains_key(&message_id)
    }

    /// Number of pending operations of `kind`.
    pub fn count(&self, kind: OperationKind) -> usize {
        self.ops.values().filter(|(_, op)| op.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<InFlightOperation> {
        let mut entries: Vec<_> = self.ops.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, op)| op).collect()
    }

    /// Copy of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<InFlightOperation> {
        let mut entries: Vec<_> = self.ops.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, op)| op.clone()).collect()
    }
}
