//! Client session.
//!
//! [`Client`] owns a session: its network thread, its dispatcher thread and
//! the tables they share. [`ClientHandle`] is a cheap clone of the same
//! session that handlers receive, so they can publish or disconnect from
//! inside a callback.
//!
//! State transitions happen under the session state lock. Lock order is
//! state, then engine, then the in-flight table; the network thread never
//! takes the state lock while it holds the engine lock.

use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, DispatcherControl};
use crate::engine::{EngineFactory, MessageId, ProtocolEngine, QoS};
use crate::error::{ClientError, HandlerResult, Result};
use crate::events::{ConnectionState, EventKind, LogLevel, Message, ReasonCode};
use crate::handler::{Handler, HandlerSlots};
use crate::inflight::{InFlightOperation, InFlightTable, OperationKind};
use crate::network::{NetworkControl, NetworkLoop, StopSignal};
use crate::queue::EventSender;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::will::Will;

pub(crate) type SharedEngine = Arc<Mutex<Box<dyn ProtocolEngine>>>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub keep_alive: u16,
    pub timeout: Duration,
}

/// Everything guarded by the session state lock.
pub(crate) struct SessionState {
    pub connection: ConnectionState,
    /// Engine of the current connection attempt.
    pub engine: Option<SharedEngine>,
    pub endpoint: Option<Endpoint>,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bumped by every `connect()`; a loop whose id is stale has been superseded.
    pub loop_id: u64,
    /// Bumped by every connection attempt.
    pub epoch: u64,
    pub network: Option<NetworkControl>,
    pub dispatcher: Option<DispatcherControl>,
    /// Set once teardown has started.
    pub closed: bool,
}

/// State shared by the owner, its handles and both threads.
pub(crate) struct Shared {
    pub client_id: String,
    pub config: ClientConfig,
    pub factory: Box<dyn EngineFactory>,
    pub state: Mutex<SessionState>,
    pub inflight: Mutex<InFlightTable>,
    pub subscriptions: Mutex<SubscriptionRegistry>,
    pub handlers: Mutex<HandlerSlots>,
}

/// An MQTT client session.
///
/// Dropping the client disconnects, waits for the network thread to stop and
/// delivers every queued event before returning.
///
/// ```ignore
/// use mqsession::{Client, ClientConfig, QoS};
/// use mqsession::loopback::LoopbackBroker;
///
/// let client = Client::new("sensor-7", ClientConfig::default(), LoopbackBroker::new())?;
/// client.on_connect(|client, _rc| {
///     client.subscribe("sensors/#", QoS::AtLeastOnce)?;
///     Ok(())
/// });
/// client.on_message(|_, msg| {
///     println!("{}: {:?}", msg.topic, msg.payload);
///     Ok(())
/// });
/// client.connect("localhost", 1883, 60)?;
/// ```
pub struct Client {
    handle: ClientHandle,
}

impl Client {
    /// Create a session that builds its engines with `factory`.
    pub fn new(
        client_id: impl Into<String>,
        config: ClientConfig,
        factory: impl EngineFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let state = SessionState {
            connection: ConnectionState::Disconnected,
            engine: None,
            endpoint: None,
            will: None,
            username: config.username.clone(),
            password: config.password.clone(),
            loop_id: 0,
            epoch: 0,
            network: None,
            dispatcher: None,
            closed: false,
        };
        let shared = Arc::new(Shared {
            client_id: client_id.into(),
            config,
            factory: Box::new(factory),
            state: Mutex::new(state),
            inflight: Mutex::new(InFlightTable::new()),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            handlers: Mutex::new(HandlerSlots::default()),
        });

        Ok(Self {
            handle: ClientHandle { shared },
        })
    }

    /// A handle to this session.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }
}

impl Deref for Client {
    type Target = ClientHandle;

    fn deref(&self) -> &ClientHandle {
        &self.handle
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// Shared access to a session.
///
/// Every operation can be called from any thread, including from inside a
/// handler on the dispatcher thread.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Snapshot of the acknowledged subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subscriptions.lock().snapshot()
    }

    /// Snapshot of the operations awaiting acknowledgment, oldest first.
    pub fn in_flight(&self) -> Vec<InFlightOperation> {
        self.shared.inflight.lock().snapshot()
    }

    /// Install a handler, replacing the one registered for the same kind.
    pub fn set_handler(&self, handler: Handler) -> Option<Handler> {
        self.shared.handlers.lock().set(handler)
    }

    /// Remove the handler for `kind`.
    pub fn clear_handler(&self, kind: EventKind) -> Option<Handler> {
        self.shared.handlers.lock().clear(kind)
    }

    pub fn on_connect<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, i32) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::Connect(Box::new(f)));
    }

    pub fn on_disconnect<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, ReasonCode, bool) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::Disconnect(Box::new(f)));
    }

    pub fn on_reconnecting<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, u32, Duration) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::Reconnecting(Box::new(f)));
    }

    pub fn on_message<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, &Message) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::Message(Box::new(f)));
    }

    pub fn on_publish<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, MessageId) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::PublishComplete(Box::new(f)));
    }

    pub fn on_subscribe<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, MessageId, &[u8]) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::SubscribeComplete(Box::new(f)));
    }

    pub fn on_unsubscribe<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, MessageId) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::UnsubscribeComplete(Box::new(f)));
    }

    pub fn on_log<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, LogLevel, &str) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::Log(Box::new(f)));
    }

    pub fn on_operation_failed<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle, &InFlightOperation, ReasonCode) -> HandlerResult + Send + 'static,
    {
        self.set_handler(Handler::OperationFailed(Box::new(f)));
    }

    /// Set the last will used from the next connection attempt on.
    pub fn set_will(&self, will: Will) {
        self.shared.state.lock().will = Some(will);
    }

    pub fn clear_will(&self) {
        self.shared.state.lock().will = None;
    }

    /// Set credentials used from the next connection attempt on.
    pub fn set_credentials(&self, username: impl Into<String>, password: Option<String>) {
        let mut state = self.shared.state.lock();
        state.username = Some(username.into());
        state.password = password;
    }

    /// Connect using the configured keep-alive and connect timeout.
    pub fn connect_to(&self, host: &str, port: u16) -> Result<()> {
        self.connect(host, port, self.shared.config.keep_alive)
    }

    /// Connect using the configured connect timeout.
    pub fn connect(&self, host: &str, port: u16, keep_alive: u16) -> Result<()> {
        self.connect_with_timeout(host, port, keep_alive, self.shared.config.connect_timeout())
    }

    /// Start connecting to `host:port`.
    ///
    /// Returns once the network thread is running; the outcome arrives as a
    /// connect or disconnect event. Valid from `Disconnected` and
    /// `ReconnectPending`; in the latter case the pending retry is abandoned.
    pub fn connect_with_timeout(
        &self,
        host: &str,
        port: u16,
        keep_alive: u16,
        timeout: Duration,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let endpoint = Endpoint {
            host: host.to_string(),
            port,
            keep_alive,
            timeout,
        };
        self.start(&mut state, endpoint)
    }

    /// Connect again to the last endpoint.
    pub fn reconnect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let endpoint = state
            .endpoint
            .clone()
            .ok_or(ClientError::InvalidState(state.connection))?;
        self.start(&mut state, endpoint)
    }

    fn start(&self, state: &mut SessionState, endpoint: Endpoint) -> Result<()> {
        if state.closed {
            return Err(ClientError::InvalidState(state.connection));
        }
        match state.connection {
            ConnectionState::Disconnected | ConnectionState::ReconnectPending => {}
            other => return Err(ClientError::InvalidState(other)),
        }

        let queue = self.ensure_dispatcher(state)?;

        let previous = state.network.take().map(|control| {
            control.stop.raise();
            control.handle
        });
        let prior_state = state.connection;
        state.loop_id += 1;
        state.connection = ConnectionState::Connecting;
        state.endpoint = Some(endpoint.clone());

        let stop = Arc::new(StopSignal::new());
        let network = NetworkLoop::new(
            self.shared.clone(),
            state.loop_id,
            stop.clone(),
            queue,
            endpoint,
            previous,
        );
        match network.spawn() {
            Ok(handle) => {
                state.network = Some(NetworkControl { stop, handle });
                Ok(())
            }
            Err(source) => {
                error!("Failed to spawn network thread: {}", source);
                state.connection = if prior_state == ConnectionState::ReconnectPending {
                    ConnectionState::Disconnected
                } else {
                    prior_state
                };
                Err(ClientError::Spawn {
                    name: "network",
                    source,
                })
            }
        }
    }

    fn ensure_dispatcher(&self, state: &mut SessionState) -> Result<EventSender> {
        if let Some(dispatcher) = &state.dispatcher {
            return Ok(dispatcher.queue.clone());
        }
        let control = Dispatcher::spawn(self.clone(), self.shared.config.max_queue_depth)?;
        let queue = control.queue.clone();
        state.dispatcher = Some(control);
        Ok(queue)
    }

    /// Engine of the established connection.
    fn connected_engine(state: &SessionState) -> Result<SharedEngine> {
        if state.connection != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        state.engine.clone().ok_or(ClientError::NotConnected)
    }

    fn track(&self, op: InFlightOperation) {
        if let Some(replaced) = self.shared.inflight.lock().register(op) {
            warn!(
                "Engine reused message id {} while still in flight",
                replaced.message_id
            );
        }
    }

    /// Publish a message and return its message id.
    ///
    /// QoS 0 messages are not tracked and produce no completion event.
    /// A QoS > 0 publish fails with `InflightLimit` while
    /// `max_inflight_messages` publishes are awaiting acknowledgment.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl AsRef<[u8]>,
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId> {
        let state = self.shared.state.lock();
        let engine = Self::connected_engine(&state)?;
        let mut guard = engine.lock();
        let limit = self.shared.config.max_inflight_messages;
        if qos != QoS::AtMostOnce
            && limit != 0
            && self.shared.inflight.lock().count(OperationKind::Publish) >= usize::from(limit)
        {
            return Err(ClientError::InflightLimit(limit));
        }
        let message_id = guard.publish(topic, payload.as_ref(), qos, retain)?;
        if qos != QoS::AtMostOnce {
            self.track(InFlightOperation::new(
                message_id,
                OperationKind::Publish,
                topic,
                qos,
            ));
        }
        Ok(message_id)
    }

    /// Subscribe to a topic filter.
    pub fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<MessageId> {
        let state = self.shared.state.lock();
        let engine = Self::connected_engine(&state)?;
        let mut guard = engine.lock();
        let message_id = guard.subscribe(topic_filter, qos)?;
        self.track(InFlightOperation::new(
            message_id,
            OperationKind::Subscribe,
            topic_filter,
            qos,
        ));
        debug!("SUBSCRIBE '{}' sent (id {})", topic_filter, message_id);
        Ok(message_id)
    }

    /// Unsubscribe from a topic filter.
    pub fn unsubscribe(&self, topic_filter: &str) -> Result<MessageId> {
        let state = self.shared.state.lock();
        let engine = Self::connected_engine(&state)?;
        let mut guard = engine.lock();
        let message_id = guard.unsubscribe(topic_filter)?;
        self.track(InFlightOperation::new(
            message_id,
            OperationKind::Unsubscribe,
            topic_filter,
            QoS::AtMostOnce,
        ));
        Ok(message_id)
    }

    /// Ask the network thread to disconnect.
    ///
    /// Returns immediately. The network thread is joined by the next
    /// `connect()` or by teardown, so this is safe to call from a handler.
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.connection {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::ReconnectPending => {
                state.connection = ConnectionState::Disconnecting;
                if let Some(network) = &state.network {
                    network.stop.raise();
                }
                info!("Disconnecting '{}'", self.shared.client_id);
                Ok(())
            }
            other => Err(ClientError::InvalidState(other)),
        }
    }

    /// Stop both threads. Every event queued before this call is delivered.
    fn shutdown(&self) {
        let (network, dispatcher) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if matches!(
                state.connection,
                ConnectionState::Connected
                    | ConnectionState::Connecting
                    | ConnectionState::ReconnectPending
            ) {
                state.connection = ConnectionState::Disconnecting;
            }
            (state.network.take(), state.dispatcher.take())
        };

        if let Some(network) = &network {
            network.stop.raise();
        }

        let on_dispatcher = dispatcher
            .as_ref()
            .is_some_and(|d| d.thread == thread::current().id());
        if on_dispatcher {
            // The dispatcher cannot join itself; hand the joins to another thread
            let reaper = thread::Builder::new()
                .name("mqsession-reaper".to_string())
                .spawn(move || stop_threads(network, dispatcher, false));
            if let Err(e) = reaper {
                error!("Failed to spawn teardown thread: {}", e);
            }
            return;
        }

        stop_threads(network, dispatcher, true);
        debug!("Session '{}' torn down", self.shared.client_id);
    }
}

/// Join the network thread, then drain and stop the dispatcher.
fn stop_threads(
    network: Option<NetworkControl>,
    dispatcher: Option<DispatcherControl>,
    join_dispatcher: bool,
) {
    if let Some(network) = network {
        if network.handle.join().is_err() {
            error!("Network thread panicked");
        }
    }
    if let Some(dispatcher) = dispatcher {
        if dispatcher.queue.request_stop().is_err() {
            debug!("Dispatcher already stopped");
        }
        if join_dispatcher && dispatcher.handle.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::config::SessionPersistence;
    use crate::loopback::{LoopbackBroker, ERR_CONN_LOST};

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(200);

    fn init_logger() {
        let _ = env_logger::Builder::new()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .loop_timeout_ms(5)
            .connect_timeout_ms(2_000)
            .reconnect_backoff(
                Duration::from_millis(20),
                2.0,
                Duration::from_millis(80),
            )
    }

    fn new_client(config: ClientConfig) -> (Client, LoopbackBroker) {
        init_logger();
        let broker = LoopbackBroker::new();
        let client = Client::new("test-client", config, broker.clone()).unwrap();
        (client, broker)
    }

    /// Forward every connect callback to a channel.
    fn connect_events(client: &ClientHandle) -> Receiver<i32> {
        let (tx, rx) = unbounded();
        client.on_connect(move |_, rc| {
            let _ = tx.send(rc);
            Ok(())
        });
        rx
    }

    fn disconnect_events(client: &ClientHandle) -> Receiver<(ReasonCode, bool)> {
        let (tx, rx) = unbounded();
        client.on_disconnect(move |_, reason, again| {
            let _ = tx.send((reason, again));
            Ok(())
        });
        rx
    }

    fn connect(client: &Client) -> Receiver<i32> {
        let connected = connect_events(client);
        client.connect("broker", 1883, 60).unwrap();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        connected
    }

    fn wait_for_state(client: &ClientHandle, expected: ConnectionState) {
        let deadline = Instant::now() + WAIT;
        while client.state() != expected {
            assert!(
                Instant::now() < deadline,
                "state stuck at {}, expected {}",
                client.state(),
                expected
            );
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_subscribe_updates_registry() {
        let (client, _broker) = new_client(fast_config());
        let (tx, acks) = unbounded();
        client.on_subscribe(move |_, id, granted| {
            let _ = tx.send((id, granted.to_vec()));
            Ok(())
        });
        connect(&client);
        assert_eq!(client.state(), ConnectionState::Connected);

        let id = client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
        assert_eq!(id, 1);
        assert_eq!(acks.recv_timeout(WAIT).unwrap(), (1, vec![1]));

        assert_eq!(
            client.subscriptions(),
            vec![Subscription {
                topic_filter: "a/b".to_string(),
                requested_qos: QoS::AtLeastOnce,
                granted_qos: Some(QoS::AtLeastOnce),
            }]
        );
        assert!(client.in_flight().is_empty());
    }

    #[test]
    fn test_operations_require_connection() {
        let (client, _broker) = new_client(fast_config());

        assert!(matches!(
            client.publish("a/b", "hi", QoS::AtLeastOnce, false),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("a/b", QoS::AtLeastOnce),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.unsubscribe("a/b"),
            Err(ClientError::NotConnected)
        ));
        assert!(client.in_flight().is_empty());

        assert!(matches!(
            client.disconnect(),
            Err(ClientError::InvalidState(ConnectionState::Disconnected))
        ));
        assert!(matches!(
            client.reconnect(),
            Err(ClientError::InvalidState(ConnectionState::Disconnected))
        ));
    }

    #[test]
    fn test_publish_acks_exactly_once() {
        let (client, _broker) = new_client(fast_config());
        let (tx, acks) = unbounded();
        client.on_publish(move |_, id| {
            let _ = tx.send(id);
            Ok(())
        });
        connect(&client);

        let mut ids: Vec<_> = (0..5)
            .map(|i| {
                client
                    .publish("data/raw", format!("{}", i), QoS::AtLeastOnce, false)
                    .unwrap()
            })
            .collect();
        let fire_and_forget = client
            .publish("data/raw", "x", QoS::AtMostOnce, false)
            .unwrap();
        assert!(client
            .in_flight()
            .iter()
            .all(|op| op.message_id != fire_and_forget));

        let mut acked: Vec<_> = (0..5).map(|_| acks.recv_timeout(WAIT).unwrap()).collect();
        assert!(acks.recv_timeout(QUIET).is_err());

        ids.sort_unstable();
        acked.sort_unstable();
        assert_eq!(ids, acked);
        assert!(client.in_flight().is_empty());
    }

    #[test]
    fn test_disconnect_from_handler() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        client.on_message(|client, _| {
            client.disconnect()?;
            Ok(())
        });
        connect(&client);

        broker.inject(Message::new("cmd/stop", "now"));
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Requested, false)
        );
        wait_for_state(&client, ConnectionState::Disconnected);

        drop(client);
        assert!(disconnects.recv_timeout(QUIET).is_err());
    }

    /// Drop the connection after `errors - 1` failing connects are armed.
    fn run_reconnects(
        errors: u32,
        max_attempts: u32,
    ) -> (Vec<(u32, Duration)>, Vec<(ReasonCode, bool)>, LoopbackBroker) {
        let config = fast_config().reconnect_max_attempts(max_attempts);
        let (client, broker) = new_client(config);
        let disconnects = disconnect_events(&client);
        let (tx, reconnects) = unbounded();
        client.on_reconnecting(move |_, attempt, delay| {
            let _ = tx.send((attempt, delay));
            Ok(())
        });
        let connected = connect(&client);

        broker.fail_next_connects(errors - 1);
        broker.drop_connection();

        let mut seen = vec![disconnects.recv_timeout(WAIT).unwrap()];
        if errors <= max_attempts {
            assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        } else {
            seen.push(disconnects.recv_timeout(WAIT).unwrap());
        }
        drop(client);

        (reconnects.try_iter().collect(), seen, broker)
    }

    #[test]
    fn test_reconnect_until_success() {
        let (attempts, disconnects, broker) = run_reconnects(3, 5);

        let numbers: Vec<_> = attempts.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(
            disconnects,
            vec![(ReasonCode::ConnectionLost(ERR_CONN_LOST), true)]
        );
        assert_eq!(broker.connect_attempts().len(), 1 + 3);
    }

    #[test]
    fn test_reconnect_exhausted() {
        let (attempts, disconnects, broker) = run_reconnects(6, 3);

        let delays: Vec<_> = attempts.iter().map(|(_, d)| *d).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
        assert_eq!(
            disconnects,
            vec![
                (ReasonCode::ConnectionLost(ERR_CONN_LOST), true),
                (ReasonCode::ReconnectExhausted, false),
            ]
        );

        let instants = broker.connect_attempts();
        assert_eq!(instants.len(), 1 + 3);
        for (pair, delay) in instants[1..].windows(2).zip(&delays[1..]) {
            assert!(pair[1] - pair[0] >= *delay);
        }
    }

    #[test]
    fn test_events_dispatched_in_order() {
        let config = fast_config().max_queue_depth(4);
        let (client, broker) = new_client(config);
        let (tx, received) = unbounded();
        client.on_message(move |_, msg| {
            // Slow consumer so the network thread hits backpressure
            thread::sleep(Duration::from_micros(200));
            let _ = tx.send(String::from_utf8_lossy(&msg.payload).into_owned());
            Ok(())
        });
        connect(&client);

        for i in 0..200 {
            broker.inject(Message::new("seq", i.to_string()));
        }

        let got: Vec<_> = (0..200)
            .map(|_| received.recv_timeout(WAIT).unwrap())
            .collect();
        let expected: Vec<_> = (0..200).map(|i: i32| i.to_string()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_connect_timeout() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        broker.hold_connack(true);

        client
            .connect_with_timeout("broker", 1883, 60, Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Timeout, false)
        );
        wait_for_state(&client, ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[test]
    fn test_connect_twice_is_invalid() {
        let (client, broker) = new_client(fast_config());
        broker.hold_connack(true);

        client.connect("broker", 1883, 60).unwrap();
        assert!(matches!(
            client.connect("broker", 1883, 60),
            Err(ClientError::InvalidState(ConnectionState::Connecting))
        ));

        let disconnects = disconnect_events(&client);
        client.disconnect().unwrap();
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Requested, false)
        );
    }

    #[test]
    fn test_handler_failures_are_isolated() {
        let (client, broker) = new_client(fast_config());
        let (tx, delivered) = unbounded();
        client.on_message(move |_, msg| {
            match &msg.payload[..] {
                b"panic" => panic!("handler blew up"),
                b"error" => return Err("bad payload".into()),
                _ => {}
            }
            let _ = tx.send(msg.topic.clone());
            Ok(())
        });
        let (log_tx, logs) = unbounded();
        client.on_log(move |_, level, text| {
            if level == LogLevel::Error {
                let _ = log_tx.send(text.to_string());
            }
            Ok(())
        });
        connect(&client);

        broker.inject(Message::new("first", "panic"));
        broker.inject(Message::new("second", "error"));
        broker.inject(Message::new("third", "ok"));

        assert_eq!(delivered.recv_timeout(WAIT).unwrap(), "third");
        let reports: Vec<_> = (0..2).map(|_| logs.recv_timeout(WAIT).unwrap()).collect();
        assert!(reports[0].contains("handler blew up"), "{}", reports[0]);
        assert!(reports[1].contains("bad payload"), "{}", reports[1]);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_clean_session_fails_pending_operations() {
        let config = fast_config().auto_reconnect(false);
        let (client, broker) = new_client(config);
        let (tx, order) = unbounded();
        let failures = tx.clone();
        client.on_operation_failed(move |_, op, reason| {
            let _ = failures.send(format!("{:?}:{}:{}", op.kind, op.message_id, reason));
            Ok(())
        });
        client.on_disconnect(move |_, reason, _| {
            let _ = tx.send(format!("disconnect:{}", reason));
            Ok(())
        });
        connect(&client);

        broker.hold_acks(true);
        let p1 = client.publish("t", "1", QoS::AtLeastOnce, false).unwrap();
        let s1 = client.subscribe("t/#", QoS::ExactlyOnce).unwrap();
        let p2 = client.publish("t", "2", QoS::ExactlyOnce, false).unwrap();
        assert_eq!(client.in_flight().len(), 3);

        broker.drop_connection();
        let lost = ReasonCode::ConnectionLost(ERR_CONN_LOST);
        let got: Vec<_> = (0..4).map(|_| order.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                format!("Publish:{}:{}", p1, lost),
                format!("Subscribe:{}:{}", s1, lost),
                format!("Publish:{}:{}", p2, lost),
                format!("disconnect:{}", lost),
            ]
        );
        assert!(client.in_flight().is_empty());
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn test_persistent_session_keeps_pending_operations() {
        let config = fast_config()
            .auto_reconnect(false)
            .session_persistence(SessionPersistence::Persistent);
        let (client, broker) = new_client(config);
        let disconnects = disconnect_events(&client);
        let (tx, failures) = unbounded();
        client.on_operation_failed(move |_, op, reason| {
            let _ = tx.send((op.message_id, reason));
            Ok(())
        });
        connect(&client);
        assert!(!broker.last_connect().unwrap().clean_session);

        broker.hold_acks(true);
        let id = client.publish("t", "1", QoS::AtLeastOnce, false).unwrap();
        broker.drop_connection();

        assert_eq!(disconnects.recv_timeout(WAIT).unwrap().1, false);
        assert!(failures.recv_timeout(QUIET).is_err());
        assert_eq!(client.in_flight().len(), 1);

        drop(client);
        assert_eq!(
            failures.recv_timeout(WAIT).unwrap(),
            (id, ReasonCode::Requested)
        );
    }

    #[test]
    fn test_resubscribe_after_reconnect() {
        let (client, broker) = new_client(fast_config());
        let (tx, acks) = unbounded();
        client.on_subscribe(move |_, id, _| {
            let _ = tx.send(id);
            Ok(())
        });
        let (msg_tx, messages) = unbounded();
        client.on_message(move |_, msg| {
            let _ = msg_tx.send(msg.topic.clone());
            Ok(())
        });
        let connected = connect(&client);

        client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
        acks.recv_timeout(WAIT).unwrap();

        broker.drop_connection();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        acks.recv_timeout(WAIT).unwrap();
        assert_eq!(client.subscriptions().len(), 1);

        client.publish("a/b", "again", QoS::AtMostOnce, false).unwrap();
        assert_eq!(messages.recv_timeout(WAIT).unwrap(), "a/b");
    }

    #[test]
    fn test_unsubscribe_and_rejected_subscribe() {
        let (client, broker) = new_client(fast_config());
        let (tx, done) = unbounded();
        let sub_tx = tx.clone();
        client.on_subscribe(move |_, id, _| {
            let _ = sub_tx.send(id);
            Ok(())
        });
        client.on_unsubscribe(move |_, id| {
            let _ = tx.send(id);
            Ok(())
        });
        connect(&client);

        let id = client.subscribe("keep/+", QoS::AtMostOnce).unwrap();
        assert_eq!(done.recv_timeout(WAIT).unwrap(), id);
        assert_eq!(client.subscriptions().len(), 1);

        let id = client.unsubscribe("keep/+").unwrap();
        assert_eq!(done.recv_timeout(WAIT).unwrap(), id);
        assert!(client.subscriptions().is_empty());

        broker.reject_subscriptions(true);
        let id = client.subscribe("forbidden/#", QoS::AtLeastOnce).unwrap();
        assert_eq!(done.recv_timeout(WAIT).unwrap(), id);
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn test_refused_connection_is_terminal() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        let (tx, reconnects) = unbounded();
        client.on_reconnecting(move |_, attempt, _| {
            let _ = tx.send(attempt);
            Ok(())
        });
        broker.refuse(5);

        client.connect("broker", 1883, 60).unwrap();
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Refused(5), false)
        );
        assert!(reconnects.recv_timeout(QUIET).is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_supersedes_pending_reconnect() {
        let config = ClientConfig::default()
            .loop_timeout_ms(5)
            .reconnect_backoff(Duration::from_secs(30), 2.0, Duration::from_secs(60));
        let (client, broker) = new_client(config);
        let disconnects = disconnect_events(&client);
        let (tx, reconnects) = unbounded();
        client.on_reconnecting(move |_, attempt, _| {
            let _ = tx.send(attempt);
            Ok(())
        });
        let connected = connect(&client);

        broker.drop_connection();
        assert_eq!(reconnects.recv_timeout(WAIT).unwrap(), 1);
        wait_for_state(&client, ConnectionState::ReconnectPending);

        client.connect("other-broker", 1884, 30).unwrap();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        assert_eq!(broker.connect_attempts().len(), 2);
        let params = broker.last_connect().unwrap();
        assert_eq!((params.host.as_str(), params.port), ("other-broker", 1884));

        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::ConnectionLost(ERR_CONN_LOST), true)
        );
        assert!(disconnects.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_will_and_credentials_reach_engine() {
        let (client, broker) = new_client(fast_config());
        client.set_will(Will::new("status/test-client", "offline").retain(true));
        client.set_credentials("device", Some("secret".to_string()));
        connect(&client);

        let params = broker.last_connect().unwrap();
        assert_eq!(params.username.as_deref(), Some("device"));
        assert_eq!(params.password.as_deref(), Some("secret"));
        assert_eq!(params.keep_alive, 60);
        let will = params.will.unwrap();
        assert_eq!(will.topic, "status/test-client");
        assert!(will.retain);
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        let connected = connect(&client);

        client.disconnect().unwrap();
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Requested, false)
        );
        wait_for_state(&client, ConnectionState::Disconnected);

        client.clear_will();
        client.reconnect().unwrap();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        assert_eq!(broker.connect_attempts().len(), 2);
        assert!(broker.last_connect().unwrap().will.is_none());
    }

    #[test]
    fn test_drop_delivers_final_disconnect() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        let (tx, acks) = unbounded();
        client.on_subscribe(move |_, id, _| {
            let _ = tx.send(id);
            Ok(())
        });
        let handle = client.handle();
        connect(&client);
        client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
        acks.recv_timeout(WAIT).unwrap();
        assert_eq!(handle.subscriptions().len(), 1);

        drop(client);
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Requested, false)
        );
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(handle.subscriptions().is_empty());
        assert!(matches!(
            handle.connect("broker", 1883, 60),
            Err(ClientError::InvalidState(_))
        ));
        assert!(!broker.is_connected());
    }

    #[test]
    fn test_engine_log_forwarded() {
        let (client, _broker) = new_client(fast_config());
        let (tx, logs) = unbounded();
        client.on_log(move |_, level, text| {
            let _ = tx.send((level, text.to_string()));
            Ok(())
        });
        connect(&client);

        let (level, text) = logs.recv_timeout(WAIT).unwrap();
        assert_eq!(level, LogLevel::Debug);
        assert!(text.contains("CONNECT"), "{}", text);
    }

    #[test]
    fn test_unbounded_connect_timeout() {
        let (client, broker) = new_client(fast_config());
        let disconnects = disconnect_events(&client);
        let connected = connect_events(&client);
        broker.hold_connack(true);

        client
            .connect_with_timeout("broker", 1883, 60, Duration::MAX)
            .unwrap();
        assert!(connected.recv_timeout(QUIET).is_err());
        assert_eq!(client.state(), ConnectionState::Connecting);

        broker.hold_connack(false);
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);

        client.disconnect().unwrap();
        assert_eq!(
            disconnects.recv_timeout(WAIT).unwrap(),
            (ReasonCode::Requested, false)
        );
        wait_for_state(&client, ConnectionState::Disconnected);
        client.connect("broker", 1883, 60).unwrap();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
    }

    #[test]
    fn test_handler_can_clear_itself() {
        let (client, broker) = new_client(fast_config());
        let (tx, received) = unbounded();
        client.on_message(move |client, msg| {
            let _ = tx.send(msg.topic.clone());
            client.clear_handler(EventKind::Message);
            Ok(())
        });
        connect(&client);

        broker.inject(Message::new("one", ""));
        assert_eq!(received.recv_timeout(WAIT).unwrap(), "one");
        broker.inject(Message::new("two", ""));
        assert!(received.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_connect_to_uses_configured_keep_alive() {
        let (client, broker) = new_client(fast_config().keep_alive(15));
        let connected = connect_events(&client);

        client.connect_to("broker", 1883).unwrap();
        assert_eq!(connected.recv_timeout(WAIT).unwrap(), 0);
        let params = broker.last_connect().unwrap();
        assert_eq!(params.keep_alive, 15);
        assert_eq!(params.max_inflight_messages, 20);
    }

    #[test]
    fn test_inflight_limit() {
        let (client, broker) = new_client(fast_config().max_inflight_messages(2));
        let (tx, acks) = unbounded();
        client.on_publish(move |_, id| {
            let _ = tx.send(id);
            Ok(())
        });
        connect(&client);
        assert_eq!(broker.last_connect().unwrap().max_inflight_messages, 2);

        broker.hold_acks(true);
        client.publish("t", "1", QoS::AtLeastOnce, false).unwrap();
        client.publish("t", "2", QoS::ExactlyOnce, false).unwrap();
        assert!(matches!(
            client.publish("t", "3", QoS::AtLeastOnce, false),
            Err(ClientError::InflightLimit(2))
        ));
        client.publish("t", "4", QoS::AtMostOnce, false).unwrap();
        assert_eq!(client.in_flight().len(), 2);
        assert_eq!(broker.published().len(), 3);

        broker.hold_acks(false);
        acks.recv_timeout(WAIT).unwrap();
        acks.recv_timeout(WAIT).unwrap();
        client.publish("t", "5", QoS::AtLeastOnce, false).unwrap();
        acks.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_duplicate_acks_complete_once() {
        let (client, broker) = new_client(fast_config());
        let (tx, completions) = unbounded();
        let sub_tx = tx.clone();
        client.on_publish(move |_, id| {
            let _ = tx.send(("publish", id));
            Ok(())
        });
        client.on_subscribe(move |_, id, _| {
            let _ = sub_tx.send(("subscribe", id));
            Ok(())
        });
        connect(&client);
        broker.duplicate_acks(true);

        let pub_id = client.publish("t", "1", QoS::AtLeastOnce, false).unwrap();
        let sub_id = client.subscribe("s/#", QoS::AtLeastOnce).unwrap();

        assert_eq!(completions.recv_timeout(WAIT).unwrap(), ("publish", pub_id));
        assert_eq!(completions.recv_timeout(WAIT).unwrap(), ("subscribe", sub_id));
        assert!(completions.recv_timeout(QUIET).is_err());
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.in_flight().is_empty());
        assert_eq!(client.subscriptions().len(), 1);
    }
}
