//! mqsession - Thread-bridged MQTT client session.
//!
//! The MQTT wire protocol is delegated to a [`ProtocolEngine`]. This crate
//! runs that engine on a dedicated network thread, carries every engine
//! callback through a bounded FIFO queue, and invokes host handlers on a
//! separate dispatcher thread, so slow handlers never stall socket I/O and
//! handlers may call back into the client (including `disconnect()`).
//!
//! Acknowledgments are correlated with the call that caused them through
//! an in-flight table, and acknowledged subscriptions are kept in a
//! registry that is restored after a clean-session reconnect.
//!
//! # Example
//!
//! ```ignore
//! use mqsession::loopback::LoopbackBroker;
//! use mqsession::{Client, ClientConfig, QoS};
//!
//! let config = ClientConfig::load("mqsession.toml")?;
//! let client = Client::new("my-client", config, LoopbackBroker::new())?;
//!
//! client.on_connect(|client, _rc| {
//!     client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//!     Ok(())
//! });
//! client.on_message(|_, msg| {
//!     println!("{} -> {} bytes", msg.topic, msg.payload.len());
//!     Ok(())
//! });
//!
//! client.connect("localhost", 1883, 60)?;
//! client.publish("sensors/temp", b"25.5", QoS::AtLeastOnce, false)?;
//! ```
//!
//! # Configuration
//!
//! [`ClientConfig`] loads from TOML with `${VAR:-default}` substitution and
//! `MQSESSION__` environment overrides:
//!
//! ```toml
//! max_queue_depth = 256
//! reconnect_base_delay_ms = 500
//! reconnect_max_delay_ms = 10000
//! reconnect_max_attempts = 20
//! session_persistence = "clean"
//! ```

mod backoff;
mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
mod handler;
mod inflight;
pub mod loopback;
mod network;
mod queue;
mod session;
mod subscription;
mod will;

pub use backoff::ReconnectBackoff;
pub use crate::config::{ClientConfig, ConfigError, SessionPersistence};
pub use engine::{
    ConnectParams, EngineCallbacks, EngineFactory, MessageId, ProtocolEngine, QoS,
};
pub use error::{ClientError, EngineError, HandlerError, HandlerResult, Result};
pub use events::{ConnectionState, Event, EventKind, LogLevel, Message, ReasonCode};
pub use handler::Handler;
pub use inflight::{InFlightOperation, InFlightTable, OperationKind};
pub use session::{Client, ClientHandle};
pub use subscription::{topic_matches_filter, Subscription, SubscriptionRegistry};
pub use will::Will;
