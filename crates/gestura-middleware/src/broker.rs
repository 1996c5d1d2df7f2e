//! Broker client adapter.
//!
//! The relay never talks to the pub/sub broker directly.  It goes through a
//! [`BrokerClient`], which owns:
//!
//! * a [`BrokerSession`] – the link state machine
//!   (`Disconnected → Connecting → Connected`).  Its state is written only by
//!   the connector's event-loop callbacks and read everywhere else through a
//!   [`tokio::sync::watch`] channel;
//! * a [`BrokerLink`] – the publish capability of the active transport;
//! * a [`BrokerConnector`] – the factory that starts a transport for a
//!   session (see [`MqttConnector`][crate::mqtt_adapter::MqttConnector]).
//!
//! Publishing while disconnected wakes the event loop for one inline
//! reconnect and waits at most `reconnect_wait_ms` for it.  Messages that
//! still cannot be handed over are reported as
//! [`RelayError::BrokerUnavailable`] and dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gestura_types::{RelayError, RobotState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default topic the snapshot is published to.
pub const DEFAULT_TOPIC: &str = "robot";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// `[broker]` table of the configuration file.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Topic every accepted snapshot is published to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Optional upstream topic whose messages are merged like any other
    /// update.  Must differ from `topic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_topic: Option<String>,

    /// Fixed client identity.  Empty means `gestura-<random>` per session.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connect over TLS using the platform root store.
    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Upper bound on the inline reconnect attempted by a publish.
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_reconnect_wait_ms() -> u64 {
    2_000
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            topic: default_topic(),
            subscribe_topic: None,
            client_id: String::new(),
            username: None,
            password: None,
            tls: false,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("subscribe_topic", &self.subscribe_topic)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("tls", &self.tls)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("reconnect_wait_ms", &self.reconnect_wait_ms)
            .finish()
    }
}

impl BrokerConfig {
    /// Reject configurations the adapter cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("broker host must not be empty".to_string());
        }
        if self.topic.trim().is_empty() {
            return Err("broker topic must not be empty".to_string());
        }
        if self.subscribe_topic.as_deref() == Some(self.topic.as_str()) {
            return Err(format!(
                "subscribe_topic must differ from the publish topic '{}'",
                self.topic
            ));
        }
        Ok(())
    }

    /// Client identity for a new session.
    pub fn session_client_id(&self) -> String {
        if self.client_id.is_empty() {
            let id = Uuid::new_v4().simple().to_string();
            format!("gestura-{}", &id[..8])
        } else {
            self.client_id.clone()
        }
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Connectivity of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// What readers observe through [`BrokerSession::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Last connect/disconnect result reported by the transport.
    pub last_result: Option<String>,
}

/// The adapter's relationship to the broker: identity plus link state.
pub struct BrokerSession {
    client_id: String,
    status: watch::Sender<LinkStatus>,
}

impl BrokerSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: LinkState::Disconnected,
            last_result: None,
        });
        Self {
            client_id: client_id.into(),
            status,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> LinkState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn last_result(&self) -> Option<String> {
        self.status.borrow().last_result.clone()
    }

    /// Subscribe to link-state transitions.
    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    // Transition callbacks. Called by the connector's event loop and nowhere
    // else; every other component reads the state through the accessors.

    pub fn on_connecting(&self) {
        self.status.send_modify(|s| s.state = LinkState::Connecting);
        debug!(client_id = %self.client_id, "broker connecting");
    }

    pub fn on_connect(&self, result: impl Into<String>) {
        let result = result.into();
        info!(client_id = %self.client_id, %result, "broker connected");
        self.status.send_modify(|s| {
            s.state = LinkState::Connected;
            s.last_result = Some(result);
        });
    }

    pub fn on_disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let was_connected = self.is_connected();
        self.status.send_modify(|s| {
            s.state = LinkState::Disconnected;
            s.last_result = Some(reason.clone());
        });
        if was_connected {
            warn!(client_id = %self.client_id, %reason, "broker disconnected");
        } else {
            debug!(client_id = %self.client_id, %reason, "broker connect attempt failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential delay between background reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Transport seams
// ---------------------------------------------------------------------------

/// Publish capability of a running broker transport.
///
/// Implementations must request at-least-once delivery from the broker.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RelayError>;
}

/// A transport started for one session.
pub struct Started {
    pub link: Arc<dyn BrokerLink>,
    /// Background event loop, aborted when the session is replaced.
    pub driver: Option<JoinHandle<()>>,
}

/// Starts a transport for a session.
///
/// The returned event loop reports transitions through the session's
/// callbacks and treats a notification on `wake` as a request to retry a
/// lost connection immediately.
pub trait BrokerConnector: Send + Sync {
    fn start(&self, session: Arc<BrokerSession>, wake: Arc<Notify>) -> Started;
}

// ---------------------------------------------------------------------------
// BrokerClient
// ---------------------------------------------------------------------------

/// Snapshot of the adapter for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub connected: bool,
    pub client_initialized: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub state: LinkState,
    pub client_id: Option<String>,
    pub last_result: Option<String>,
}

impl BrokerStatus {
    /// Status reported when no broker is configured.
    pub fn not_configured() -> Self {
        Self {
            connected: false,
            client_initialized: false,
            host: None,
            port: None,
            topic: None,
            state: LinkState::Disconnected,
            client_id: None,
            last_result: None,
        }
    }
}

struct Attached {
    session: Arc<BrokerSession>,
    link: Arc<dyn BrokerLink>,
    driver: Option<JoinHandle<()>>,
}

/// Resilient publisher of [`RobotState`] snapshots.
pub struct BrokerClient {
    config: BrokerConfig,
    connector: Arc<dyn BrokerConnector>,
    wake: Arc<Notify>,
    attached: RwLock<Attached>,
}

impl BrokerClient {
    /// Create a session and start its transport through `connector`.
    ///
    /// Must be called from within a Tokio runtime when the connector spawns
    /// an event loop.
    pub fn new(config: BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let wake = Arc::new(Notify::new());
        let attached = Self::start(&config, connector.as_ref(), &wake);
        Self {
            config,
            connector,
            wake,
            attached: RwLock::new(attached),
        }
    }

    fn start(config: &BrokerConfig, connector: &dyn BrokerConnector, wake: &Arc<Notify>) -> Attached {
        let session = Arc::new(BrokerSession::new(config.session_client_id()));
        let Started { link, driver } = connector.start(Arc::clone(&session), Arc::clone(wake));
        info!(
            host = %config.host,
            port = config.port,
            topic = %config.topic,
            client_id = %session.client_id(),
            "broker client started"
        );
        Attached {
            session,
            link,
            driver,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// The current session.  Replaced by [`reinitialize`][Self::reinitialize].
    pub fn session(&self) -> Arc<BrokerSession> {
        Arc::clone(&self.attached.read().session)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_connected()
    }

    pub fn status(&self) -> BrokerStatus {
        let session = self.session();
        BrokerStatus {
            connected: session.is_connected(),
            client_initialized: true,
            host: Some(self.config.host.clone()),
            port: Some(self.config.port),
            topic: Some(self.config.topic.clone()),
            state: session.state(),
            client_id: Some(session.client_id().to_string()),
            last_result: session.last_result(),
        }
    }

    /// Publish `snapshot` to the configured topic.
    ///
    /// # Errors
    ///
    /// [`RelayError::BrokerUnavailable`] when the link is down and the inline
    /// reconnect does not complete within `reconnect_wait_ms`, or when the
    /// transport refuses the message.
    pub async fn publish(&self, snapshot: &RobotState) -> Result<(), RelayError> {
        let payload =
            serde_json::to_vec(snapshot).map_err(|e| RelayError::Unexpected(e.to_string()))?;

        let (session, link) = {
            let attached = self.attached.read();
            (Arc::clone(&attached.session), Arc::clone(&attached.link))
        };

        if !session.is_connected() {
            debug!(client_id = %session.client_id(), "publish while disconnected; reconnecting inline");
            self.wake.notify_one();
            if !wait_connected(&session, self.config.reconnect_wait()).await {
                return Err(RelayError::BrokerUnavailable(format!(
                    "not connected to {}:{} within {} ms",
                    self.config.host, self.config.port, self.config.reconnect_wait_ms
                )));
            }
        }

        link.publish(&self.config.topic, payload).await
    }

    /// Wait up to `reconnect_wait_ms` for the current session to connect.
    pub async fn wait_connected(&self) -> bool {
        wait_connected(&self.session(), self.config.reconnect_wait()).await
    }

    /// Drop the current session and start a fresh one.
    pub fn reinitialize(&self) {
        let fresh = Self::start(&self.config, self.connector.as_ref(), &self.wake);
        let old = std::mem::replace(&mut *self.attached.write(), fresh);
        if let Some(driver) = old.driver {
            driver.abort();
        }
        info!(old_client_id = %old.session.client_id(), "broker client reinitialized");
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(driver) = self.attached.get_mut().driver.take() {
            driver.abort();
        }
    }
}

async fn wait_connected(session: &BrokerSession, wait: Duration) -> bool {
    let mut rx = session.watch();
    let connected = async { rx.wait_for(|s| s.state == LinkState::Connected).await.is_ok() };
    matches!(tokio::time::timeout(wait, connected).await, Ok(true))
}
