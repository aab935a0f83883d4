// packages/relay/src/announcer/announcer.rs
//! Announcement state machine
//!
//! Runs as its own task and is driven through [`AnnouncerHandle`]. At most
//! one announcement is outstanding at a time; triggers that arrive while one
//! is in flight are coalesced into a single follow-up.

use crate::announcer::messages::{Announcement, AnnouncementReceipt};
use crate::bus::{MessageBus, DISCOVERY_TOPIC};
use crate::catalog::BundleCatalog;
use crate::observability::{ANNOUNCEMENTS_PUBLISHED, RECEIPTS_IGNORED};
use crate::utils::config::AnnouncerSettings;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerState {
    /// Not connected; announcements are ignored
    Stopped,
    /// Connected with nothing outstanding
    Waiting,
    /// An announcement is awaiting its receipt
    ReceiptWaiting,
}

/// Point-in-time view of the announcer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncerStatus {
    pub state: AnnouncerState,
    pub outstanding: Option<String>,
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub relay_id: String,

    /// Re-publish interval while awaiting a receipt
    pub retry_interval: Duration,

    /// Delay before retrying a failed publish
    pub publish_backoff: Duration,
}

impl AnnouncerConfig {
    pub fn new(relay_id: impl Into<String>, settings: &AnnouncerSettings) -> Self {
        Self {
            relay_id: relay_id.into(),
            retry_interval: Duration::from_millis(settings.retry_interval_ms),
            publish_backoff: Duration::from_millis(settings.publish_backoff_ms),
        }
    }
}

enum Command {
    Start,
    Announce,
    Receipt(AnnouncementReceipt),
    Stop,
    Status(oneshot::Sender<AnnouncerStatus>),
}

struct Outstanding {
    id: String,
    epoch: u64,
    payload: Bytes,
}

/// Control handle for a running announcer task
pub struct AnnouncerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<AnnouncerState>,
    task: JoinHandle<()>,
}

impl AnnouncerHandle {
    /// Connected: leave Stopped
    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn announce(&self) {
        self.send(Command::Announce);
    }

    pub fn receipt(&self, receipt: AnnouncementReceipt) {
        self.send(Command::Receipt(receipt));
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Status after every command sent so far has been handled
    pub async fn status(&self) -> Option<AnnouncerStatus> {
        let (reply, status) = oneshot::channel();
        self.send(Command::Status(reply));
        status.await.ok()
    }

    pub fn state(&self) -> AnnouncerState {
        *self.state.borrow()
    }

    /// End the task once queued commands are handled
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            warn!("Announcer task ended abnormally: {}", e);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Announcer task is gone; command dropped");
        }
    }
}

pub struct Announcer {
    config: AnnouncerConfig,
    catalog: Arc<BundleCatalog>,
    bus: Arc<dyn MessageBus>,
    state: watch::Sender<AnnouncerState>,
    outstanding: Option<Outstanding>,
    pending: bool,
    retry_at: Option<Instant>,
}

impl Announcer {
    /// Spawn the announcer task in the Stopped state
    pub fn spawn(
        config: AnnouncerConfig,
        catalog: Arc<BundleCatalog>,
        bus: Arc<dyn MessageBus>,
    ) -> AnnouncerHandle {
        let (state, state_rx) = watch::channel(AnnouncerState::Stopped);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let announcer = Self {
            config,
            catalog,
            bus,
            state,
            outstanding: None,
            pending: false,
            retry_at: None,
        };
        let task = tokio::spawn(announcer.run(commands_rx));

        AnnouncerHandle {
            commands,
            state: state_rx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry().await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        debug!("Announcer for {} exiting", self.config.relay_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start => {
                if self.current() == AnnouncerState::Stopped {
                    self.set_state(AnnouncerState::Waiting);
                }
            }
            Command::Announce => self.announce().await,
            Command::Receipt(receipt) => self.receipt(receipt).await,
            Command::Stop => {
                self.outstanding = None;
                self.pending = false;
                self.retry_at = None;
                self.set_state(AnnouncerState::Stopped);
                info!("Announcer stopped");
            }
            Command::Status(reply) => {
                let _ = reply.send(AnnouncerStatus {
                    state: self.current(),
                    outstanding: self.outstanding.as_ref().map(|o| o.id.clone()),
                    pending: self.pending,
                });
            }
        }
    }

    async fn announce(&mut self) {
        match self.current() {
            AnnouncerState::Stopped => {
                debug!("Ignoring announce while stopped");
            }
            AnnouncerState::ReceiptWaiting => {
                debug!("Announcement outstanding, coalescing trigger");
                self.pending = true;
            }
            AnnouncerState::Waiting => {
                let snapshot = self.catalog.snapshot();
                let announcement = Announcement::online(&self.config.relay_id, &snapshot);
                let payload = match announcement.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode announcement: {}", e);
                        return;
                    }
                };

                info!(
                    "Announcing {} bundles as {}",
                    snapshot.bundles.len(),
                    announcement.announcement_id
                );
                self.outstanding = Some(Outstanding {
                    id: announcement.announcement_id,
                    epoch: snapshot.epoch,
                    payload,
                });
                self.set_state(AnnouncerState::ReceiptWaiting);
                self.publish().await;
            }
        }
    }

    async fn receipt(&mut self, receipt: AnnouncementReceipt) {
        let epoch = match &self.outstanding {
            Some(outstanding) if outstanding.id == receipt.announcement_id => outstanding.epoch,
            _ => {
                warn!(
                    "Ignoring receipt for {} (outstanding: {:?})",
                    receipt.announcement_id,
                    self.outstanding.as_ref().map(|o| o.id.as_str())
                );
                metrics::counter!(RECEIPTS_IGNORED).increment(1);
                return;
            }
        };

        if !receipt.is_success() {
            warn!(
                "Announcement {} rejected: {}",
                receipt.announcement_id,
                receipt.message.as_deref().unwrap_or("no reason given")
            );
            return;
        }

        debug!("Announcement {} acknowledged", receipt.announcement_id);
        self.outstanding = None;
        self.retry_at = None;
        self.catalog.epoch_acked(epoch);
        self.set_state(AnnouncerState::Waiting);

        if std::mem::take(&mut self.pending) {
            self.announce().await;
        }
    }

    async fn retry(&mut self) {
        if let Some(outstanding) = &self.outstanding {
            debug!("No receipt for {}, re-publishing", outstanding.id);
        }
        self.publish().await;
    }

    async fn publish(&mut self) {
        let Some(outstanding) = &self.outstanding else {
            self.retry_at = None;
            return;
        };

        match self.bus.publish(DISCOVERY_TOPIC, outstanding.payload.clone()).await {
            Ok(()) => {
                metrics::counter!(ANNOUNCEMENTS_PUBLISHED).increment(1);
                self.retry_at = Some(Instant::now() + self.config.retry_interval);
            }
            Err(e) => {
                warn!("Publishing announcement {} failed: {}", outstanding.id, e);
                self.retry_at = Some(Instant::now() + self.config.publish_backoff);
            }
        }
    }

    fn current(&self) -> AnnouncerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: AnnouncerState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConnector, ConnectOptions, MemoryBroker};
    use crate::catalog::test_support::bundle;
    use crate::utils::errors::{RelayError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn config() -> AnnouncerConfig {
        AnnouncerConfig {
            relay_id: "relay-1".into(),
            retry_interval: Duration::from_secs(5),
            publish_backoff: Duration::from_secs(1),
        }
    }

    async fn setup() -> (AnnouncerHandle, MemoryBroker, Arc<BundleCatalog>) {
        let broker = MemoryBroker::new();
        let options = ConnectOptions {
            client_id: "relay-1".into(),
            ..Default::default()
        };
        let (bus, _inbox) = broker.connect(options).await.unwrap();

        let catalog = Arc::new(BundleCatalog::new());
        catalog.replace(vec![bundle("echo", "1.0.0")]);

        let handle = Announcer::spawn(config(), catalog.clone(), bus);
        handle.start();
        (handle, broker, catalog)
    }

    fn announcements(broker: &MemoryBroker) -> Vec<Announcement> {
        broker
            .published_to(DISCOVERY_TOPIC)
            .iter()
            .map(|message| Announcement::from_payload(&message.payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_and_acknowledge() {
        let (handle, broker, catalog) = setup().await;
        assert!(catalog.changed());

        handle.announce();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::ReceiptWaiting);
        assert_eq!(status.outstanding.as_deref(), Some("1"));

        let sent = announcements(&broker);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].online);
        assert_eq!(sent[0].bundles[0].name, "echo");

        handle.receipt(AnnouncementReceipt::success("1"));
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::Waiting);
        assert_eq!(catalog.last_acked(), 1);
        assert!(!catalog.changed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_coalesce_while_outstanding() {
        let (handle, broker, catalog) = setup().await;

        handle.announce();
        handle.status().await.unwrap();
        catalog.replace(vec![bundle("echo", "1.0.0"), bundle("date", "1.0.0")]);
        handle.announce();
        handle.announce();

        let status = handle.status().await.unwrap();
        assert!(status.pending);
        assert_eq!(announcements(&broker).len(), 1);

        handle.receipt(AnnouncementReceipt::success("1"));
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::ReceiptWaiting);
        assert_eq!(status.outstanding.as_deref(), Some("2"));
        assert!(!status.pending);

        let sent = announcements(&broker);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].bundles.len(), 2);
        assert_eq!(catalog.last_acked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_receipt() {
        let (handle, broker, _catalog) = setup().await;
        handle.announce();
        handle.status().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let sent = announcements(&broker);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|a| a.announcement_id == "1"));

        handle.receipt(AnnouncementReceipt::success("1"));
        handle.status().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(announcements(&broker).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_failed_receipts_are_ignored() {
        let (handle, broker, catalog) = setup().await;
        handle.announce();

        handle.receipt(AnnouncementReceipt::success("99"));
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::ReceiptWaiting);

        handle.receipt(AnnouncementReceipt::from_slice(br#"{"id":"1","status":"failure"}"#).unwrap());
        let status = handle.status().await.unwrap();
        assert_eq!(status.outstanding.as_deref(), Some("1"));
        assert_eq!(catalog.last_acked(), 0);

        // Still retrying after the rejection
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(announcements(&broker).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_announcer() {
        let (handle, broker, _catalog) = setup().await;
        handle.announce();
        handle.stop();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::Stopped);
        assert!(status.outstanding.is_none());

        handle.announce();
        handle.status().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(announcements(&broker).len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_before_start_is_ignored() {
        let broker = MemoryBroker::new();
        let (bus, _inbox) = broker
            .connect(ConnectOptions {
                client_id: "relay-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let handle = Announcer::spawn(config(), Arc::new(BundleCatalog::new()), bus);

        handle.announce();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AnnouncerState::Stopped);
        assert!(broker.history().is_empty());
    }

    struct FlakyBus {
        failures: Mutex<usize>,
        published: Mutex<Vec<(Instant, Bytes)>>,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, _topic: &str, payload: Bytes) -> Result<()> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(RelayError::Bus("broker unavailable".into()));
            }
            self.published.lock().push((Instant::now(), payload));
            Ok(())
        }

        async fn subscribe(&self, _filter: &str) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_backs_off() {
        let bus = Arc::new(FlakyBus {
            failures: Mutex::new(2),
            published: Mutex::new(Vec::new()),
        });
        let started = Instant::now();
        let handle = Announcer::spawn(config(), Arc::new(BundleCatalog::new()), bus.clone());
        handle.start();
        handle.announce();
        handle.status().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let published = bus.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0 - started, Duration::from_secs(2));
    }
}
