//! `gestura-middleware` – shared state and fan-out plumbing.
//!
//! Routes robot/gesture updates from every producer into one authoritative
//! state and out to every consumer, without caring which transport carried
//! them.
//!
//! # Modules
//!
//! - [`store`] – [`StateStore`]: owner of the canonical
//!   [`RobotState`][gestura_types::RobotState] with an atomic partial-merge
//!   contract and a bounded window of recent updates.
//! - [`registry`] – [`ConnectionRegistry`]: the open set of dashboard
//!   push-channels and the broadcast coordinator that prunes failed ones.
//! - [`broker`] – [`BrokerClient`]: link state machine, inline reconnect and
//!   at-least-once publish towards the pub/sub broker.
//! - [`mqtt_adapter`] – [`MqttConnector`]: the `rumqttc` transport behind the
//!   broker client.
//! - [`relay`] – [`StateRelay`]: merge → queue publish → broadcast pipeline used by
//!   every ingress path.

pub mod broker;
pub mod mqtt_adapter;
pub mod registry;
pub mod relay;
pub mod store;

pub use broker::{BrokerClient, BrokerConfig, BrokerStatus, LinkState};
pub use mqtt_adapter::{MqttConnector, mqtt_options};
pub use registry::{BroadcastReport, ConnectionId, ConnectionRegistry, PushChannel};
pub use relay::{IngestOutcome, StateRelay};
pub use store::StateStore;
