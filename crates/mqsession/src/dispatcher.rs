//! Callback dispatcher thread.
//!
//! Consumes the event queue in order, keeps the in-flight table and the
//! subscription registry in step with acknowledgments, and runs the host
//! handler for each event. A handler that fails or panics is reported and
//! dispatch carries on with the next event.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, error, info, log, warn};

use crate::engine::QoS;
use crate::error::{ClientError, Result};
use crate::events::{ConnectionState, Event, EventKind, LogLevel, ReasonCode};
use crate::handler::Invocation;
use crate::inflight::OperationKind;
use crate::queue::{event_queue, EventReceiver, EventSender};
use crate::session::ClientHandle;
use crate::subscription::Subscription;

/// Handle kept by the session for the running dispatcher.
pub(crate) struct DispatcherControl {
    pub queue: EventSender,
    pub handle: JoinHandle<()>,
    pub thread: ThreadId,
}

pub(crate) struct Dispatcher {
    client: ClientHandle,
    rx: EventReceiver,
}

impl Dispatcher {
    /// Create the event queue and start the dispatcher thread on it.
    pub fn spawn(client: ClientHandle, depth: usize) -> Result<DispatcherControl> {
        let (queue, rx) = event_queue(depth);
        let dispatcher = Dispatcher { client, rx };
        let handle = thread::Builder::new()
            .name("mqsession-dispatch".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|source| ClientError::Spawn {
                name: "dispatcher",
                source,
            })?;
        Ok(DispatcherControl {
            queue,
            thread: handle.thread().id(),
            handle,
        })
    }

    fn run(self) {
        debug!("Dispatcher started for '{}'", self.client.client_id());

        while let Some((epoch, event)) = self.rx.pop() {
            self.dispatch(epoch, event);
        }

        // Nothing will acknowledge or resubscribe once the session is gone
        self.discard_in_flight(ReasonCode::Requested);
        self.client.shared().subscriptions.lock().clear();
        debug!("Dispatcher stopped for '{}'", self.client.client_id());
    }

    fn dispatch(&self, epoch: u64, event: Event) {
        let shared = self.client.shared();
        match event {
            Event::Connected { reason_code } => {
                let current = {
                    let mut state = shared.state.lock();
                    let current =
                        state.epoch == epoch && state.connection == ConnectionState::Connecting;
                    if current {
                        state.connection = ConnectionState::Connected;
                    }
                    current
                };
                if current {
                    self.resubscribe();
                }
                self.invoke(Invocation::Connect(reason_code));
            }
            Event::Disconnected {
                reason,
                will_reconnect,
            } => {
                if shared.config.clean_session() {
                    self.discard_in_flight(reason);
                }
                self.invoke(Invocation::Disconnect(reason, will_reconnect));
            }
            Event::Reconnecting { attempt, delay } => {
                self.invoke(Invocation::Reconnecting(attempt, delay));
            }
            Event::MessageArrived(message) => {
                if !shared.subscriptions.lock().matches(&message.topic) {
                    debug!("Message on '{}' matches no subscription", message.topic);
                }
                self.invoke(Invocation::Message(&message));
            }
            Event::PublishAcked { message_id } => {
                let resolved = shared
                    .inflight
                    .lock()
                    .resolve(message_id, OperationKind::Publish);
                match resolved {
                    Ok(_) => self.invoke(Invocation::PublishComplete(message_id)),
                    Err(e) => warn!("Ignoring PUBACK: {}", e),
                }
            }
            Event::SubscribeAcked {
                message_id,
                granted_qos,
            } => {
                let resolved = shared
                    .inflight
                    .lock()
                    .resolve(message_id, OperationKind::Subscribe);
                let op = match resolved {
                    Ok(op) => op,
                    Err(e) => {
                        warn!("Ignoring SUBACK: {}", e);
                        return;
                    }
                };
                match granted_qos.first().copied().and_then(QoS::from_u8) {
                    Some(granted) => {
                        debug!("Subscribed to '{}' (granted {:?})", op.topic, granted);
                        shared.subscriptions.lock().upsert(Subscription {
                            topic_filter: op.topic,
                            requested_qos: op.qos,
                            granted_qos: Some(granted),
                        });
                    }
                    None => warn!(
                        "Subscription to '{}' rejected (codes {:?})",
                        op.topic, granted_qos
                    ),
                }
                self.invoke(Invocation::SubscribeComplete(message_id, &granted_qos));
            }
            Event::UnsubscribeAcked { message_id } => {
                let resolved = shared
                    .inflight
                    .lock()
                    .resolve(message_id, OperationKind::Unsubscribe);
                match resolved {
                    Ok(op) => {
                        shared.subscriptions.lock().remove(&op.topic);
                        self.invoke(Invocation::UnsubscribeComplete(message_id));
                    }
                    Err(e) => warn!("Ignoring UNSUBACK: {}", e),
                }
            }
            Event::LogEntry { level, text } => {
                log!(target: "mqsession::engine", level.to_log_level(), "{}", text);
                self.invoke(Invocation::Log(level, &text));
            }
        }
    }

    /// Re-issue every registered subscription after a clean reconnect.
    fn resubscribe(&self) {
        let shared = self.client.shared();
        if !shared.config.clean_session() || !shared.config.resubscribe_on_reconnect {
            return;
        }
        let subscriptions = shared.subscriptions.lock().snapshot();
        if subscriptions.is_empty() {
            return;
        }

        info!("Restoring {} subscriptions", subscriptions.len());
        for sub in subscriptions {
            if let Err(e) = self.client.subscribe(&sub.topic_filter, sub.requested_qos) {
                warn!("Resubscribe to '{}' failed: {}", sub.topic_filter, e);
            }
        }
    }

    /// Drop every pending operation, reporting each one as failed.
    fn discard_in_flight(&self, reason: ReasonCode) {
        let ops = self.client.shared().inflight.lock().drain();
        if ops.is_empty() {
            return;
        }

        warn!("Discarding {} in-flight operations ({})", ops.len(), reason);
        for op in &ops {
            self.invoke(Invocation::OperationFailed(op, reason));
        }
    }

    /// Run the handler for `call`, isolating errors and panics.
    fn invoke(&self, call: Invocation<'_>) {
        let kind = call.kind();
        let handlers = &self.client.shared().handlers;
        let Some(mut handler) = handlers.lock().take(kind) else {
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.invoke(&self.client, &call)
        }));
        handlers.lock().restore(handler);

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        let err = ClientError::Handler(format!("{:?} handler failed: {}", kind, failure));
        error!("{}", err);

        if kind != EventKind::Log {
            self.invoke(Invocation::Log(LogLevel::Error, &err.to_string()));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
