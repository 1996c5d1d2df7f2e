//! MQTT transport for the [`BrokerClient`][crate::broker::BrokerClient].
//!
//! [`MqttConnector`] builds a `rumqttc` client per session and spawns the
//! event loop that drives it:
//!
//! * **ConnAck (success)** – session → `Connected`, backoff reset, the
//!   optional upstream topic is (re-)subscribed at QoS 1.
//! * **Transport error / broker Disconnect** – session → `Disconnected`; the
//!   loop then sleeps for the next backoff delay, or less if a publish wakes
//!   it, before moving to `Connecting` and polling again.
//! * **Inbound Publish** – the raw payload is forwarded to the ingress
//!   channel so the relay can merge it like any other update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gestura_types::RelayError;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::broker::{Backoff, BrokerConfig, BrokerConnector, BrokerLink, BrokerSession, Started};

/// Capacity of the request queue between [`AsyncClient`] and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// [`BrokerLink`] over a `rumqttc` client.
pub struct MqttLink {
    client: AsyncClient,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| RelayError::BrokerUnavailable(format!("publish rejected: {e}")))
    }
}

/// Connection options for one client identity.
///
/// Also used by tools that talk to the broker without going through a
/// [`BrokerClient`][crate::broker::BrokerClient].
pub fn mqtt_options(config: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Starts `rumqttc` sessions from a [`BrokerConfig`].
pub struct MqttConnector {
    config: BrokerConfig,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
}

impl MqttConnector {
    /// `inbound` receives the payload of every message arriving on
    /// `config.subscribe_topic`.
    pub fn new(config: BrokerConfig, inbound: Option<mpsc::Sender<Vec<u8>>>) -> Self {
        Self { config, inbound }
    }
}

impl BrokerConnector for MqttConnector {
    fn start(&self, session: Arc<BrokerSession>, wake: Arc<Notify>) -> Started {
        let options = mqtt_options(&self.config, session.client_id());
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            session,
            wake,
            EventLoopSettings {
                subscribe_topic: self.config.subscribe_topic.clone(),
                inbound: self.inbound.clone(),
                backoff: Backoff::from_config(&self.config),
            },
        ));
        Started {
            link: Arc::new(MqttLink { client }),
            driver: Some(driver),
        }
    }
}

struct EventLoopSettings {
    subscribe_topic: Option<String>,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    backoff: Backoff,
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    session: Arc<BrokerSession>,
    wake: Arc<Notify>,
    mut settings: EventLoopSettings,
) {
    session.on_connecting();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    session.on_connect(format!("{:?}", ack.code));
                    settings.backoff.reset();
                    if let Some(topic) = &settings.subscribe_topic
                        && let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce)
                    {
                        warn!(%topic, error = %e, "broker subscribe failed");
                    }
                } else {
                    session.on_disconnect(format!("{:?}", ack.code));
                    pause(&wake, &mut settings.backoff).await;
                    session.on_connecting();
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(inbound) = &settings.inbound
                    && inbound.try_send(publish.payload.to_vec()).is_err()
                {
                    debug!(topic = %publish.topic, "inbound broker message dropped; ingress busy");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                session.on_disconnect("disconnected by broker");
                pause(&wake, &mut settings.backoff).await;
                session.on_connecting();
            }
            Ok(_) => {}
            Err(e) => {
                session.on_disconnect(e.to_string());
                pause(&wake, &mut settings.backoff).await;
                session.on_connecting();
            }
        }
    }
}

/// Sleep for the next backoff delay, cut short by a publish-triggered wake.
async fn pause(wake: &Notify, backoff: &mut Backoff) {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = wake.notified() => debug!("inline reconnect requested"),
        _ = tokio::time::sleep(delay) => debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff elapsed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, LinkState};

    fn unreachable_config() -> BrokerConfig {
        BrokerConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            // Port 1 is reserved and refuses connections on loopback.
            port: 1,
            reconnect_wait_ms: 200,
            backoff_initial_ms: 50,
            backoff_max_ms: 100,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn options_carry_identity_and_credentials() {
        let config = BrokerConfig {
            username: Some("operator".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 30,
            ..BrokerConfig::default()
        };
        let options = mqtt_options(&config, "gestura-abc");

        assert_eq!(options.client_id(), "gestura-abc");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("operator".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn unreachable_broker_reports_unavailable() {
        let client = BrokerClient::new(
            unreachable_config(),
            Arc::new(MqttConnector::new(unreachable_config(), None)),
        );

        let err = client
            .publish(&gestura_types::RobotState::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::BrokerUnavailable(_)));
        assert_ne!(client.session().state(), LinkState::Connected);
        assert!(client.session().last_result().is_some());
    }
}
