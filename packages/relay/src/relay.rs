// packages/relay/src/relay.rs
//! Relay service
//!
//! Wires the catalog, pools, execution engine and announcer to a bus
//! session and keeps them running until shutdown.
//!
//! ```text
//!                 ┌──────────── session loop ────────────┐
//! bus inbox ────▶ │ commands ─▶ WorkQueue ─▶ workers ──┐  │
//!                 │ receipts ─▶ announcer              │  │
//!                 │ dynconfig ─▶ DynamicConfigStore    │  │
//!                 │ refresh tick ─▶ catalog ─▶ announce│  │
//!                 │ reap tick ─▶ pools                 │  │
//! bus publish ◀── │ responses ◀────────────────────────┘  │
//!                 └──────────────────────────────────────┘
//! ```
//!
//! Workers hand responses back to the session loop, so a response produced
//! while the bus is reconnecting is published on the next session.

use crate::announcer::{Announcement, AnnouncementReceipt, Announcer, AnnouncerConfig, AnnouncerHandle};
use crate::bus::{
    announcer_topic, commands_topic, dynconfig_topic, BusConnector, BusMessage, ConnectOptions,
    MessageBus, DISCOVERY_TOPIC,
};
use crate::catalog::{load_bundles, BundleCatalog};
use crate::executor::{
    recover_reply_to, DynamicConfigStore, DynamicConfigUpdate, ExecutionEngine, ExecutionRequest,
    ExecutionResponse, WorkQueue,
};
use crate::pool::{PoolConfig, PoolRegistry};
use crate::runtime::{ContainerRuntime, ContainerTemplate, Environment, EnvironmentFactory};
use crate::utils::config::RelayConfig;
use crate::utils::errors::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between reconnect attempts after the bus session drops
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

enum SessionEnd {
    Shutdown,
    ConnectionLost,
}

struct Session {
    bus: Arc<dyn MessageBus>,
    inbox: mpsc::UnboundedReceiver<BusMessage>,
    announcer: AnnouncerHandle,
}

pub struct Relay {
    config: RelayConfig,
    catalog: Arc<BundleCatalog>,
    pools: Arc<PoolRegistry<Environment>>,
    engine: Arc<ExecutionEngine>,
    dynamic: DynamicConfigStore,
    queue: Arc<WorkQueue<ExecutionRequest>>,
}

impl Relay {
    /// `runtime` is absent on hosts without a container engine
    pub fn new(config: RelayConfig, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        let catalog = Arc::new(BundleCatalog::new());

        let factory = EnvironmentFactory::new(
            runtime,
            ContainerTemplate {
                relay_id: config.relay.id.clone(),
                driver_path: config.docker.driver_path.clone(),
            },
        );
        let pools = Arc::new(PoolRegistry::new(
            PoolConfig::from(&config.pool),
            Arc::new(factory),
        ));

        let dynamic = DynamicConfigStore::new(config.execution.dynamic_config_root.clone());
        let engine = ExecutionEngine::new(catalog.clone(), pools.clone())
            .with_dynamic_config(dynamic.clone())
            .with_extra_env(config.extra_env())
            .with_timeout(config.execution_timeout());

        let queue = Arc::new(WorkQueue::new(config.relay.queue_capacity));

        Self {
            config,
            catalog,
            pools,
            engine: Arc::new(engine),
            dynamic,
            queue,
        }
    }

    pub fn catalog(&self) -> &Arc<BundleCatalog> {
        &self.catalog
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// The first connection failure is returned; later session losses are
    /// retried.
    pub async fn run(self, connector: Arc<dyn BusConnector>, shutdown: CancellationToken) -> Result<()> {
        self.refresh().await;

        let (responses, mut outbox) = mpsc::unbounded_channel();
        let workers = self.spawn_workers(responses);

        let mut session = match self.connect(connector.as_ref()).await {
            Ok(session) => session,
            Err(e) => {
                self.stop_workers(workers).await;
                self.pools.close_all().await;
                return Err(e);
            }
        };

        loop {
            match self.serve(&mut session, &mut outbox, &shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::ConnectionLost => {
                    warn!("Bus connection lost, reconnecting");
                    session.announcer.stop();
                    self.catalog.reconnected();

                    session = loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                self.stop_workers(workers).await;
                                self.pools.close_all().await;
                                return Ok(());
                            }
                            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        }
                        match self.connect(connector.as_ref()).await {
                            Ok(session) => break session,
                            Err(e) => warn!("Reconnect failed: {}", e),
                        }
                    };
                }
            }
        }

        self.shutdown(session, workers, outbox).await;
        Ok(())
    }

    async fn connect(&self, connector: &dyn BusConnector) -> Result<Session> {
        let relay_id = &self.config.relay.id;
        let will = Announcement::offline(relay_id, self.catalog.epoch()).to_payload()?;
        let options = ConnectOptions::from_settings(&self.config.bus, self.config.client_id())
            .with_last_will(BusMessage::new(DISCOVERY_TOPIC, will));

        let (bus, inbox) = connector.connect(options).await?;
        bus.subscribe(&announcer_topic(relay_id)).await?;
        bus.subscribe(&commands_topic(relay_id)).await?;
        if self.dynamic.is_enabled() {
            bus.subscribe(&dynconfig_topic(relay_id)).await?;
        }

        let announcer = Announcer::spawn(
            AnnouncerConfig::new(relay_id.clone(), &self.config.announcer),
            self.catalog.clone(),
            bus.clone(),
        );
        announcer.start();
        announcer.announce();

        info!("Relay {} connected to {}:{}", relay_id, self.config.bus.host, self.config.bus.port);
        Ok(Session { bus, inbox, announcer })
    }

    async fn serve(
        &self,
        session: &mut Session,
        outbox: &mut mpsc::UnboundedReceiver<BusMessage>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let refresh_every = self.config.refresh_interval();
        let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let max_idle = Duration::from_secs(self.config.pool.max_idle_secs);
        let reap_every = max_idle.max(Duration::from_secs(1));
        let mut reap = interval_at(Instant::now() + reap_every, reap_every);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                message = session.inbox.recv() => match message {
                    Some(message) => self.dispatch(session, message).await,
                    None => return SessionEnd::ConnectionLost,
                },
                Some(response) = outbox.recv() => {
                    if let Err(e) = session.bus.publish(&response.topic, response.payload).await {
                        error!("Publishing response to {} failed: {}", response.topic, e);
                    }
                }
                _ = refresh.tick() => {
                    if self.refresh().await {
                        session.announcer.announce();
                    }
                }
                _ = reap.tick(), if !max_idle.is_zero() => {
                    let reaped = self.pools.reap_idle(max_idle).await;
                    if reaped > 0 {
                        debug!("Reaped {} idle environments", reaped);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, session: &Session, message: BusMessage) {
        let relay_id = &self.config.relay.id;

        if message.topic == commands_topic(relay_id) {
            match ExecutionRequest::from_slice(&message.payload) {
                Ok(request) => {
                    debug!(command = %request.command, "Queueing request");
                    if let Err(request) = self.queue.push(request).await {
                        let response = ExecutionResponse::error("relay is shutting down");
                        publish_response(session.bus.as_ref(), &request.reply_to, &response).await;
                    }
                }
                Err(e) => match recover_reply_to(&message.payload) {
                    Some(reply_to) => {
                        warn!("Rejecting malformed request: {}", e);
                        let response = ExecutionResponse::error(e.to_string());
                        publish_response(session.bus.as_ref(), &reply_to, &response).await;
                    }
                    None => warn!("Dropping malformed request without reply_to: {}", e),
                },
            }
        } else if message.topic == announcer_topic(relay_id) {
            match AnnouncementReceipt::from_slice(&message.payload) {
                Ok(receipt) => session.announcer.receipt(receipt),
                Err(e) => warn!("Dropping malformed announcement receipt: {}", e),
            }
        } else if message.topic == dynconfig_topic(relay_id) {
            match serde_json::from_slice::<DynamicConfigUpdate>(&message.payload) {
                Ok(update) => {
                    if let Err(e) = self.dynamic.store(&update).await {
                        warn!("Storing dynamic config for {} failed: {}", update.bundle_name, e);
                    }
                }
                Err(e) => warn!("Dropping malformed dynamic config update: {}", e),
            }
        } else {
            debug!("Ignoring message on {}", message.topic);
        }
    }

    /// Rescan the bundle directory. Returns whether the catalog changed.
    async fn refresh(&self) -> bool {
        let bundles = match load_bundles(&self.config.relay.bundles_dir).await {
            Ok(bundles) => bundles,
            Err(e) => {
                warn!("Bundle refresh failed: {}", e);
                return false;
            }
        };

        if !self.catalog.replace(bundles) {
            return false;
        }
        self.pools.retain(&self.catalog.versions()).await;
        true
    }

    fn spawn_workers(&self, responses: mpsc::UnboundedSender<BusMessage>) -> Vec<JoinHandle<()>> {
        (0..self.config.relay.workers)
            .map(|worker| {
                let queue = self.queue.clone();
                let engine = self.engine.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    while let Some(request) = queue.pop().await {
                        let response = engine.execute(&request).await;
                        match response.to_json() {
                            Ok(payload) => {
                                let message = BusMessage::new(request.reply_to.clone(), payload);
                                if responses.send(message).is_err() {
                                    warn!("Response for {} dropped, relay stopping", request.reply_to);
                                }
                            }
                            Err(e) => error!("Encoding response for {} failed: {}", request.reply_to, e),
                        }
                    }
                    debug!("Worker {} exiting", worker);
                })
            })
            .collect()
    }

    async fn stop_workers(&self, workers: Vec<JoinHandle<()>>) {
        self.queue.close();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
    }

    async fn shutdown(
        &self,
        session: Session,
        workers: Vec<JoinHandle<()>>,
        mut outbox: mpsc::UnboundedReceiver<BusMessage>,
    ) {
        info!("Relay {} shutting down", self.config.relay.id);
        session.announcer.stop();

        // In-flight executions finish and their responses still go out
        self.stop_workers(workers).await;
        while let Ok(response) = outbox.try_recv() {
            if let Err(e) = session.bus.publish(&response.topic, response.payload).await {
                warn!("Publishing response to {} failed: {}", response.topic, e);
            }
        }

        let offline = Announcement::offline(&self.config.relay.id, self.catalog.epoch());
        match offline.to_payload() {
            Ok(payload) => {
                if let Err(e) = session.bus.publish(DISCOVERY_TOPIC, payload).await {
                    warn!("Publishing offline announcement failed: {}", e);
                }
            }
            Err(e) => warn!("Encoding offline announcement failed: {}", e),
        }

        session.announcer.shutdown().await;
        if let Err(e) = session.bus.disconnect().await {
            debug!("Bus disconnect failed: {}", e);
        }
        self.pools.close_all().await;
    }
}

async fn publish_response(bus: &dyn MessageBus, reply_to: &str, response: &ExecutionResponse) {
    let payload = match response.to_json() {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            error!("Encoding response for {} failed: {}", reply_to, e);
            return;
        }
    };
    if let Err(e) = bus.publish(reply_to, payload).await {
        error!("Publishing response to {} failed: {}", reply_to, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Credentials, MemoryBroker};
    use crate::utils::errors::RelayError;
    use crate::executor::ResponseStatus;
    use serde_json::{json, Value};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(bundles_dir: &std::path::Path) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.relay.id = "relay-1".into();
        config.relay.workers = 2;
        config.relay.bundles_dir = bundles_dir.to_path_buf();
        config
    }

    async fn upstream(broker: &MemoryBroker) -> (Arc<dyn MessageBus>, mpsc::UnboundedReceiver<BusMessage>) {
        let (bus, inbox) = broker
            .connect(ConnectOptions {
                client_id: "upstream".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        bus.subscribe(DISCOVERY_TOPIC).await.unwrap();
        bus.subscribe("/bot/pipelines/#").await.unwrap();
        (bus, inbox)
    }

    async fn next_on(inbox: &mut mpsc::UnboundedReceiver<BusMessage>, topic: &str) -> BusMessage {
        timeout(WAIT, async {
            loop {
                let message = inbox.recv().await.unwrap();
                if message.topic == topic {
                    return message;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_relay_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sys.yml"),
            "name: sys\nversion: 1.0.0\ncommands:\n  env:\n    executable: /usr/bin/env\n",
        )
        .unwrap();

        let broker = MemoryBroker::new();
        let (upstream, mut inbox) = upstream(&broker).await;

        let relay = Relay::new(config(dir.path()), None);
        let catalog = relay.catalog().clone();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(relay.run(Arc::new(broker.clone()), shutdown.clone()));

        let announced = next_on(&mut inbox, DISCOVERY_TOPIC).await;
        let announcement = Announcement::from_payload(&announced.payload).unwrap();
        assert!(announcement.online);
        assert_eq!(announcement.bundles[0].name, "sys");

        let receipt = serde_json::to_vec(&AnnouncementReceipt::success(announcement.announcement_id)).unwrap();
        upstream
            .publish(&announcer_topic("relay-1"), Bytes::from(receipt))
            .await
            .unwrap();

        let request = json!({
            "command": "sys:env",
            "args": ["hi"],
            "reply_to": "/bot/pipelines/p1/replies",
            "requestor": {"handle": "vanstee"},
            "room": {"name": "ops"}
        });
        upstream
            .publish(&commands_topic("relay-1"), Bytes::from(request.to_string()))
            .await
            .unwrap();

        let reply = next_on(&mut inbox, "/bot/pipelines/p1/replies").await;
        let response: ExecutionResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        let lines = response.body.unwrap()[0]["body"].clone();
        assert!(lines.as_array().unwrap().contains(&Value::from("COG_ARGV_0=hi")));
        assert!(!catalog.changed());

        shutdown.cancel();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();

        let last = broker.published_to(DISCOVERY_TOPIC).pop().unwrap();
        assert!(!Announcement::from_payload(&last.payload).unwrap().online);
        assert!(!broker.is_connected("relay-1"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let (upstream, mut inbox) = upstream(&broker).await;

        let relay = Relay::new(config(dir.path()), None);
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(relay.run(Arc::new(broker.clone()), shutdown.clone()));
        next_on(&mut inbox, DISCOVERY_TOPIC).await;

        upstream
            .publish(
                &commands_topic("relay-1"),
                Bytes::from_static(br#"{"command": 5, "reply_to": "/bot/pipelines/p2/replies"}"#),
            )
            .await
            .unwrap();
        upstream
            .publish(
                &commands_topic("relay-1"),
                Bytes::from_static(br#"{"command": "nope:nope", "reply_to": "/bot/pipelines/p3/replies"}"#),
            )
            .await
            .unwrap();

        let reply = next_on(&mut inbox, "/bot/pipelines/p2/replies").await;
        let response: ExecutionResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);

        let reply = next_on(&mut inbox, "/bot/pipelines/p3/replies").await;
        let response: ExecutionResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.status_message.contains("nope"));

        shutdown.cancel();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_session_leaves_last_will() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let (_upstream, mut inbox) = upstream(&broker).await;

        let relay = Relay::new(config(dir.path()), None);
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(relay.run(Arc::new(broker.clone()), shutdown.clone()));
        next_on(&mut inbox, DISCOVERY_TOPIC).await;

        broker.drop_session("relay-1");
        let will = next_on(&mut inbox, DISCOVERY_TOPIC).await;
        assert!(!Announcement::from_payload(&will.payload).unwrap().online);

        shutdown.cancel();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new().with_credentials(Credentials {
            username: "u".into(),
            password: "p".into(),
        });

        let relay = Relay::new(config(dir.path()), None);
        let result = relay.run(Arc::new(broker), CancellationToken::new()).await;
        assert!(matches!(result, Err(RelayError::Bus(_))));
    }
}
