//! Network loop thread.
//!
//! Drives the protocol engine and turns every engine callback into an
//! [`Event`] on the event queue. It never runs host code. Engine callbacks
//! are staged while the engine lock is held and pushed once it is released,
//! so queue backpressure never blocks a caller waiting on the engine.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::backoff::ReconnectBackoff;
use crate::engine::{ConnectParams, EngineCallbacks, MessageId};
use crate::events::{ConnectionState, Event, LogLevel, Message, ReasonCode};
use crate::queue::{EventSender, QueueClosed};
use crate::session::{Endpoint, Shared, SharedEngine};

/// Stop flag that can be waited on.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        *self.raised.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Sleep for `timeout` or until raised. Returns whether it was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock();
        while !*raised {
            if self.cond.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        *raised
    }
}

/// Handle kept by the session for a running loop.
pub(crate) struct NetworkControl {
    pub stop: Arc<StopSignal>,
    pub handle: JoinHandle<()>,
}

/// Engine callback captured during one iteration.
#[derive(Debug)]
enum Staged {
    Connack(i32),
    Closed(i32),
    Event(Event),
}

#[derive(Debug, Default)]
struct Staging {
    records: Vec<Staged>,
}

impl Staging {
    fn take(&mut self) -> Vec<Staged> {
        std::mem::take(&mut self.records)
    }
}

impl EngineCallbacks for Staging {
    fn on_connect(&mut self, rc: i32) {
        self.records.push(Staged::Connack(rc));
    }

    fn on_disconnect(&mut self, rc: i32) {
        self.records.push(Staged::Closed(rc));
    }

    fn on_message(&mut self, message: Message) {
        self.records.push(Staged::Event(Event::MessageArrived(message)));
    }

    fn on_publish(&mut self, message_id: MessageId) {
        self.records
            .push(Staged::Event(Event::PublishAcked { message_id }));
    }

    fn on_subscribe(&mut self, message_id: MessageId, granted_qos: &[u8]) {
        self.records.push(Staged::Event(Event::SubscribeAcked {
            message_id,
            granted_qos: granted_qos.to_vec(),
        }));
    }

    fn on_unsubscribe(&mut self, message_id: MessageId) {
        self.records
            .push(Staged::Event(Event::UnsubscribeAcked { message_id }));
    }

    fn on_log(&mut self, level: LogLevel, text: &str) {
        self.records.push(Staged::Event(Event::LogEntry {
            level,
            text: text.to_string(),
        }));
    }
}

/// How one connection attempt ended.
#[derive(Debug)]
enum Exit {
    /// Stop was raised (disconnect or teardown).
    Stopped,
    /// A newer loop replaced this one.
    Superseded,
    /// The attempt failed or the connection dropped.
    Failed {
        reason: ReasonCode,
        was_connected: bool,
    },
}

enum Gate {
    Go(ConnectParams),
    Stopped,
    Superseded,
}

/// One network thread. Owns the reconnect cycle for a single `connect()`.
pub(crate) struct NetworkLoop {
    shared: Arc<Shared>,
    loop_id: u64,
    epoch: u64,
    stop: Arc<StopSignal>,
    queue: EventSender,
    endpoint: Endpoint,
    previous: Option<JoinHandle<()>>,
    backoff: ReconnectBackoff,
    staged: Staging,
}

impl NetworkLoop {
    pub fn new(
        shared: Arc<Shared>,
        loop_id: u64,
        stop: Arc<StopSignal>,
        queue: EventSender,
        endpoint: Endpoint,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let backoff = ReconnectBackoff::from_config(&shared.config);
        Self {
            shared,
            loop_id,
            epoch: 0,
            stop,
            queue,
            endpoint,
            previous,
            backoff,
            staged: Staging::default(),
        }
    }

    /// Start the loop in a background thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("mqsession-net-{}", self.loop_id))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        if let Some(previous) = self.previous.take() {
            if previous.join().is_err() {
                error!("Previous network thread panicked");
            }
        }
        debug!(
            "Network loop {} started for '{}'",
            self.loop_id, self.shared.client_id
        );

        let mut reconnecting = false;
        loop {
            match self.run_connection() {
                Exit::Superseded => {
                    debug!("Network loop {} superseded", self.loop_id);
                    break;
                }
                Exit::Stopped => {
                    self.finish(ReasonCode::Requested);
                    break;
                }
                Exit::Failed {
                    reason,
                    was_connected,
                } => {
                    let retry = self.shared.config.auto_reconnect
                        && !matches!(reason, ReasonCode::Refused(_))
                        && (was_connected || reconnecting);
                    if !retry {
                        self.finish(reason);
                        break;
                    }
                    if !self.schedule_reconnect(reason, was_connected) {
                        break;
                    }
                    reconnecting = true;
                }
            }
        }

        debug!("Network loop {} stopped", self.loop_id);
    }

    /// Wait out the next backoff delay. Returns false when the loop must exit.
    fn schedule_reconnect(&mut self, reason: ReasonCode, was_connected: bool) -> bool {
        let Some((attempt, delay)) = self.backoff.next_delay() else {
            warn!(
                "'{}' giving up after {} reconnect attempts",
                self.shared.client_id,
                self.backoff.attempt()
            );
            self.finish(ReasonCode::ReconnectExhausted);
            return false;
        };

        match self.gate(ConnectionState::ReconnectPending) {
            Gate::Superseded => return false,
            Gate::Stopped => {
                self.finish(ReasonCode::Requested);
                return false;
            }
            Gate::Go(_) => {}
        }

        if was_connected {
            warn!("'{}' lost connection: {}", self.shared.client_id, reason);
            let lost = Event::Disconnected {
                reason,
                will_reconnect: true,
            };
            if self.emit(lost).is_err() {
                return false;
            }
        }
        info!(
            "'{}' reconnecting in {:?} (attempt {})",
            self.shared.client_id, delay, attempt
        );
        if self.emit(Event::Reconnecting { attempt, delay }).is_err() {
            return false;
        }

        if self.stop.wait_timeout(delay) {
            if !self.superseded() {
                self.finish(ReasonCode::Requested);
            }
            return false;
        }
        true
    }

    /// Run one connection attempt until it fails, stops or is superseded.
    fn run_connection(&mut self) -> Exit {
        let params = match self.gate(ConnectionState::Connecting) {
            Gate::Go(params) => params,
            Gate::Stopped => return Exit::Stopped,
            Gate::Superseded => return Exit::Superseded,
        };

        info!(
            "Connecting '{}' to {}:{}",
            self.shared.client_id, params.host, params.port
        );

        let engine: SharedEngine = match self.shared.factory.create(&self.shared.client_id) {
            Ok(engine) => Arc::new(Mutex::new(engine)),
            Err(e) => {
                warn!("Failed to create engine: {}", e);
                return Exit::Failed {
                    reason: ReasonCode::EngineFailure(e.code),
                    was_connected: false,
                };
            }
        };
        if let Err(e) = engine.lock().connect(&params) {
            warn!("Connect to {}:{} failed: {}", params.host, params.port, e);
            return Exit::Failed {
                reason: ReasonCode::EngineFailure(e.code),
                was_connected: false,
            };
        }

        {
            let mut state = self.shared.state.lock();
            if state.loop_id != self.loop_id {
                return Exit::Superseded;
            }
            state.engine = Some(engine.clone());
        }

        let exit = self.drive(&engine);

        let mut state = self.shared.state.lock();
        if state.loop_id == self.loop_id
            && state
                .engine
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &engine))
        {
            state.engine = None;
        }
        exit
    }

    /// Iterate the engine until the connection ends.
    fn drive(&mut self, engine: &SharedEngine) -> Exit {
        let loop_timeout = self.shared.config.loop_timeout();
        // No deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(self.endpoint.timeout);
        let mut connected = false;

        loop {
            if self.stop.is_raised() {
                return self.close(engine, connected);
            }

            let wait = match deadline {
                Some(deadline) if !connected => {
                    loop_timeout.min(deadline.saturating_duration_since(Instant::now()))
                }
                _ => loop_timeout,
            };
            let result = engine.lock().loop_iteration(wait, &mut self.staged);

            let mut exit = None;
            for record in self.staged.take() {
                match record {
                    Staged::Connack(0) if !connected => {
                        connected = true;
                        self.backoff.reset();
                        info!("'{}' connected", self.shared.client_id);
                        if self.emit(Event::Connected { reason_code: 0 }).is_err() {
                            return Exit::Stopped;
                        }
                    }
                    Staged::Connack(0) => {}
                    Staged::Connack(rc) => {
                        warn!("'{}' connection refused (rc={})", self.shared.client_id, rc);
                        exit.get_or_insert(Exit::Failed {
                            reason: ReasonCode::Refused(rc),
                            was_connected: connected,
                        });
                    }
                    Staged::Closed(rc) => {
                        if !self.stop.is_raised() {
                            exit.get_or_insert(Exit::Failed {
                                reason: ReasonCode::ConnectionLost(rc),
                                was_connected: connected,
                            });
                        }
                    }
                    Staged::Event(event) => {
                        if self.emit(event).is_err() {
                            return Exit::Stopped;
                        }
                    }
                }
            }
            if let Some(exit) = exit {
                return exit;
            }

            if let Err(e) = result {
                if self.stop.is_raised() {
                    continue;
                }
                return Exit::Failed {
                    reason: ReasonCode::ConnectionLost(e.code),
                    was_connected: connected,
                };
            }

            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if !connected && expired {
                warn!(
                    "'{}' got no CONNACK within {:?}",
                    self.shared.client_id, self.endpoint.timeout
                );
                return Exit::Failed {
                    reason: ReasonCode::Timeout,
                    was_connected: false,
                };
            }
        }
    }

    /// Send DISCONNECT and flush whatever the engine still reports.
    fn close(&mut self, engine: &SharedEngine, connected: bool) -> Exit {
        if connected {
            let mut guard = engine.lock();
            if let Err(e) = guard.disconnect() {
                debug!("Engine disconnect failed: {}", e);
            }
            let flush = guard.loop_iteration(self.shared.config.loop_timeout(), &mut self.staged);
            drop(guard);
            if let Err(e) = flush {
                debug!("Final engine iteration failed: {}", e);
            }
            for record in self.staged.take() {
                if let Staged::Event(event) = record {
                    if self.emit(event).is_err() {
                        break;
                    }
                }
            }
        } else {
            self.staged.take();
        }

        if self.superseded() {
            Exit::Superseded
        } else {
            Exit::Stopped
        }
    }

    /// Move the session into `to` if this loop is still current and not stopped.
    fn gate(&mut self, to: ConnectionState) -> Gate {
        let mut state = self.shared.state.lock();
        if state.loop_id != self.loop_id {
            return Gate::Superseded;
        }
        if self.stop.is_raised() {
            return Gate::Stopped;
        }
        state.connection = to;
        if to == ConnectionState::Connecting {
            state.epoch += 1;
            self.epoch = state.epoch;
        }
        Gate::Go(ConnectParams {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            keep_alive: self.endpoint.keep_alive,
            clean_session: self.shared.config.clean_session(),
            username: state.username.clone(),
            password: state.password.clone(),
            will: state.will.clone(),
            max_inflight_messages: self.shared.config.max_inflight_messages,
        })
    }

    fn superseded(&self) -> bool {
        self.shared.state.lock().loop_id != self.loop_id
    }

    /// Mark the session disconnected and queue the terminal event.
    fn finish(&mut self, reason: ReasonCode) {
        {
            let mut state = self.shared.state.lock();
            if state.loop_id != self.loop_id {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.engine = None;
        }

        match reason {
            ReasonCode::Requested => info!("'{}' disconnected", self.shared.client_id),
            other => warn!("'{}' disconnected: {}", self.shared.client_id, other),
        }
        let _ = self.emit(Event::Disconnected {
            reason,
            will_reconnect: false,
        });
    }

    fn emit(&self, event: Event) -> Result<(), QueueClosed> {
        if self.queue.len() >= self.queue.capacity() {
            debug!(
                "Event queue full ({}), waiting for dispatcher",
                self.queue.capacity()
            );
        }
        self.queue.push(self.epoch, event).map_err(|e| {
            error!("Dispatcher is gone, network loop {} stopping", self.loop_id);
            e
        })
    }
}
