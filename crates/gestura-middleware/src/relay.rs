//! [`StateRelay`] – the ingress pipeline shared by every producer.
//!
//! An accepted update is merged into the [`StateStore`], queued for the
//! broker and broadcast to every dashboard push-channel in one step that
//! never yields, so dashboards always end on the stored snapshot and a
//! caller that goes away after the merge cannot stop the propagation.
//!
//! Broker publishes run on a single background task in merge order.  When
//! several snapshots queue up behind a slow broker only the newest one is
//! sent, and every waiting caller receives its result.  A broker failure is
//! reported in the [`IngestOutcome`] but never affects the broadcast.

use std::sync::Arc;

use gestura_types::{RelayError, RobotState, UpdateSource};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::registry::{ConnectionId, ConnectionRegistry, PushChannel};
use crate::store::StateStore;

/// Result of a successful [`StateRelay::ingest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub snapshot: RobotState,
    /// `None` when no broker is configured.
    pub broker_published: Option<bool>,
    pub broker_connected: Option<bool>,
}

struct PublishJob {
    snapshot: RobotState,
    done: oneshot::Sender<bool>,
}

/// Broker client plus the queue feeding its publisher task.
#[derive(Clone)]
struct Publisher {
    broker: Arc<BrokerClient>,
    jobs: mpsc::UnboundedSender<PublishJob>,
}

impl Publisher {
    /// Spawn the publisher task.  It ends once every relay clone is gone.
    fn spawn(broker: Arc<BrokerClient>) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<PublishJob>();
        let worker = Arc::clone(&broker);
        tokio::spawn(async move {
            while let Some(first) = queue.recv().await {
                let mut latest = first.snapshot;
                let mut waiters = vec![first.done];
                while let Ok(job) = queue.try_recv() {
                    latest = job.snapshot;
                    waiters.push(job.done);
                }
                if waiters.len() > 1 {
                    debug!(superseded = waiters.len() - 1, "publishing newest queued snapshot only");
                }

                let published = match worker.publish(&latest).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "broker publish failed");
                        false
                    }
                };
                for done in waiters {
                    let _ = done.send(published);
                }
            }
            debug!("broker publisher stopped");
        });
        Self { broker, jobs }
    }

    fn enqueue(&self, snapshot: RobotState) -> oneshot::Receiver<bool> {
        let (done, result) = oneshot::channel();
        if self.jobs.send(PublishJob { snapshot, done }).is_err() {
            warn!("broker publisher is gone; snapshot not published");
        }
        result
    }
}

/// Store, registry and optional broker wired into one pipeline.
#[derive(Clone)]
pub struct StateRelay {
    store: Arc<StateStore>,
    registry: Arc<ConnectionRegistry>,
    publisher: Option<Publisher>,
    /// Serializes merge + enqueue + broadcast across producers.
    order: Arc<Mutex<()>>,
}

impl StateRelay {
    pub fn new(store: Arc<StateStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            publisher: None,
            order: Arc::new(Mutex::new(())),
        }
    }

    /// Attach a broker client (builder-style).
    ///
    /// Spawns the publisher task, so it must be called inside a Tokio
    /// runtime.
    pub fn with_broker(mut self, broker: Arc<BrokerClient>) -> Self {
        self.publisher = Some(Publisher::spawn(broker));
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> Option<&Arc<BrokerClient>> {
        self.publisher.as_ref().map(|p| &p.broker)
    }

    /// Merge `payload`, queue the snapshot for the broker, then broadcast it.
    ///
    /// Everything up to the broadcast happens before the first await point;
    /// the returned future only waits for the broker result.
    ///
    /// # Errors
    ///
    /// Only the merge can fail ([`RelayError::InvalidPayload`]); nothing is
    /// published or broadcast in that case.
    pub async fn ingest(&self, payload: &Value, source: UpdateSource) -> Result<IngestOutcome, RelayError> {
        let (snapshot, pending) = {
            let _order = self.order.lock();
            let snapshot = self.store.merge(payload, source)?;
            let pending = self.publisher.as_ref().map(|p| p.enqueue(snapshot.clone()));
            let report = self.registry.broadcast(&snapshot);
            debug!(%source, delivered = report.delivered, pruned = report.pruned, "update relayed");
            (snapshot, pending)
        };

        let (broker_published, broker_connected) = match (&self.publisher, pending) {
            (Some(publisher), Some(pending)) => {
                let published = pending.await.unwrap_or(false);
                (Some(published), Some(publisher.broker.is_connected()))
            }
            _ => (None, None),
        };

        Ok(IngestOutcome {
            snapshot,
            broker_published,
            broker_connected,
        })
    }

    /// Lenient ingest for message-oriented producers.
    ///
    /// Text that is not JSON, or JSON that fails to merge, is dropped and
    /// `None` is returned.
    pub async fn ingest_text(&self, text: &str, source: UpdateSource) -> Option<IngestOutcome> {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%source, error = %e, "ignoring non-JSON message");
                return None;
            }
        };
        match self.ingest(&payload, source).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                debug!(%source, error = %e, "ignoring malformed update");
                None
            }
        }
    }

    /// Register a push-channel whose first frame is the current snapshot.
    pub fn attach(&self) -> PushChannel {
        let _order = self.order.lock();
        self.registry.register_with(|| {
            serde_json::to_string(&self.store.read()).unwrap_or_default()
        })
    }

    pub fn detach(&self, id: ConnectionId) -> bool {
        self.registry.unregister(id)
    }

    /// Merge every payload arriving from the upstream broker topic.
    ///
    /// The task ends when the sending side (the broker event loop) is gone.
    pub fn spawn_broker_ingress(&self, mut inbound: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                match std::str::from_utf8(&payload) {
                    Ok(text) => {
                        relay.ingest_text(text, UpdateSource::Broker).await;
                    }
                    Err(e) => debug!(error = %e, "ignoring non-UTF-8 broker payload"),
                }
            }
            debug!("broker ingress closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, BrokerConnector, BrokerLink, BrokerSession, Started};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Link that always refuses and a connector that never connects.
    struct DeadBroker;

    #[async_trait]
    impl BrokerLink for DeadBroker {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), RelayError> {
            Err(RelayError::BrokerUnavailable("dead".to_string()))
        }
    }

    impl BrokerConnector for DeadBroker {
        fn start(&self, _session: Arc<BrokerSession>, _wake: Arc<Notify>) -> Started {
            Started {
                link: Arc::new(DeadBroker),
                driver: None,
            }
        }
    }

    /// Connected link whose first publish stalls for `first_delay`.
    struct SlowFirstLink {
        first_delay: Duration,
        published: Mutex<Vec<RobotState>>,
    }

    #[async_trait]
    impl BrokerLink for SlowFirstLink {
        async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<(), RelayError> {
            let first = self.published.lock().is_empty();
            if first {
                tokio::time::sleep(self.first_delay).await;
            }
            let state: RobotState =
                serde_json::from_slice(&payload).map_err(|e| RelayError::Unexpected(e.to_string()))?;
            self.published.lock().push(state);
            Ok(())
        }
    }

    struct ConnectedBroker(Arc<SlowFirstLink>);

    impl BrokerConnector for ConnectedBroker {
        fn start(&self, session: Arc<BrokerSession>, _wake: Arc<Notify>) -> Started {
            session.on_connect("Success");
            Started {
                link: self.0.clone(),
                driver: None,
            }
        }
    }

    fn slow_first_broker(first_delay: Duration) -> (Arc<BrokerClient>, Arc<SlowFirstLink>) {
        let link = Arc::new(SlowFirstLink {
            first_delay,
            published: Mutex::new(Vec::new()),
        });
        let config = BrokerConfig {
            enabled: true,
            ..BrokerConfig::default()
        };
        let client = BrokerClient::new(config, Arc::new(ConnectedBroker(link.clone())));
        (Arc::new(client), link)
    }

    fn drain(ch: &mut PushChannel) -> Vec<RobotState> {
        let mut frames = Vec::new();
        while let Ok(frame) = ch.frames.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn relay() -> StateRelay {
        StateRelay::new(Arc::new(StateStore::default()), Arc::new(ConnectionRegistry::default()))
    }

    fn dead_broker() -> Arc<BrokerClient> {
        let config = BrokerConfig {
            enabled: true,
            reconnect_wait_ms: 20,
            ..BrokerConfig::default()
        };
        Arc::new(BrokerClient::new(config, Arc::new(DeadBroker)))
    }

    #[tokio::test]
    async fn ingest_merges_and_broadcasts() {
        let relay = relay();
        let mut ch = relay.attach();
        let initial: RobotState = serde_json::from_str(&ch.frames.recv().await.unwrap()).unwrap();
        assert_eq!(initial, RobotState::default());

        let outcome = relay
            .ingest(&json!({ "stopped": true }), UpdateSource::Http)
            .await
            .unwrap();

        assert!(outcome.snapshot.stopped);
        assert_eq!(outcome.broker_published, None);
        assert_eq!(outcome.broker_connected, None);
        let pushed: RobotState = serde_json::from_str(&ch.frames.recv().await.unwrap()).unwrap();
        assert_eq!(pushed, outcome.snapshot);
        assert_eq!(relay.store().read(), outcome.snapshot);
    }

    #[tokio::test]
    async fn broker_failure_does_not_block_state_or_broadcast() {
        let relay = relay().with_broker(dead_broker());
        let mut ch = relay.attach();
        let _initial = ch.frames.recv().await.unwrap();

        let outcome = relay
            .ingest(&json!({ "hand": { "right": { "horizontal": "left" } } }), UpdateSource::PushChannel)
            .await
            .unwrap();

        assert_eq!(outcome.broker_published, Some(false));
        assert_eq!(outcome.broker_connected, Some(false));
        assert_eq!(relay.store().read().hand.right.horizontal, "left");
        let pushed: RobotState = serde_json::from_str(&ch.frames.recv().await.unwrap()).unwrap();
        assert_eq!(pushed.hand.right.horizontal, "left");
    }

    #[tokio::test]
    async fn slow_publish_does_not_leave_dashboards_on_a_stale_snapshot() {
        let (broker, link) = slow_first_broker(Duration::from_millis(200));
        let relay = relay().with_broker(broker);
        let mut ch = relay.attach();

        let first = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.ingest(&json!({ "stopped": true }), UpdateSource::Http).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = relay
            .ingest(&json!({ "stopped": false }), UpdateSource::Http)
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.broker_published, Some(true));
        assert_eq!(second.broker_published, Some(true));

        let frames = drain(&mut ch);
        assert_eq!(frames.len(), 3, "initial snapshot plus one frame per update");
        assert!(frames[1].stopped);
        assert_eq!(frames.last(), Some(&relay.store().read()));

        let published = link.published.lock();
        assert_eq!(published.last(), Some(&relay.store().read()), "broker ends on the stored snapshot");
        assert!(published[0].stopped, "publishes follow merge order");
    }

    #[tokio::test]
    async fn abandoned_ingest_still_broadcasts_and_publishes() {
        let (broker, link) = slow_first_broker(Duration::from_millis(200));
        let relay = relay().with_broker(broker);
        let mut ch = relay.attach();
        let _initial = ch.frames.recv().await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            relay.ingest(&json!({ "stopped": true }), UpdateSource::Http),
        )
        .await;
        assert!(abandoned.is_err(), "caller gave up during the publish");

        let pushed: RobotState = serde_json::from_str(&ch.frames.try_recv().unwrap()).unwrap();
        assert!(pushed.stopped);

        tokio::time::timeout(Duration::from_secs(1), async {
            while link.published.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("publish must complete without its caller");
        assert!(link.published.lock()[0].stopped);
    }

    #[tokio::test]
    async fn invalid_payload_is_not_propagated() {
        let relay = relay();
        let mut ch = relay.attach();
        let _initial = ch.frames.recv().await.unwrap();

        let err = relay.ingest(&json!([1, 2, 3]), UpdateSource::Http).await.unwrap_err();

        assert!(matches!(err, RelayError::InvalidPayload(_)));
        assert!(ch.frames.try_recv().is_err(), "nothing may be broadcast");
        assert_eq!(relay.store().revision(), 0);
    }

    #[tokio::test]
    async fn ingest_text_ignores_garbage() {
        let relay = relay();
        assert!(relay.ingest_text("hello robot", UpdateSource::PushChannel).await.is_none());
        assert!(relay.ingest_text("\"left\"", UpdateSource::PushChannel).await.is_none());
        assert_eq!(relay.store().read(), RobotState::default());

        let outcome = relay.ingest_text("{}", UpdateSource::PushChannel).await;
        assert_eq!(outcome.map(|o| o.snapshot), Some(RobotState::default()));
    }

    #[tokio::test]
    async fn detach_removes_connection() {
        let relay = relay();
        let ch = relay.attach();
        assert_eq!(relay.registry().len(), 1);
        assert!(relay.detach(ch.id));
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn broker_ingress_merges_upstream_payloads() {
        let relay = relay();
        let (tx, rx) = mpsc::channel(8);
        let task = relay.spawn_broker_ingress(rx);

        tx.send(b"not json".to_vec()).await.unwrap();
        tx.send(vec![0xff, 0xfe]).await.unwrap();
        tx.send(br#"{"hand":{"left":{"vertical":"up"}}}"#.to_vec()).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(relay.store().read().hand.left.vertical, "up");
        let history = relay.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, UpdateSource::Broker);
    }
}
