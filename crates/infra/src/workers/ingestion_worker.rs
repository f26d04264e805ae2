use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use tally_events::{Delivery, EventBus, Subscription};

use crate::projections::{EventIngestor, IngestError, IngestedEventStore};

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Feeds every message from a bus subscription into an [`EventIngestor`].
///
/// - runs on its own OS thread, driving the async store through `runtime`
/// - a message is acknowledged once it is stored or recognised as a duplicate
/// - malformed messages are logged, acknowledged and dropped
/// - store failures keep the same message and retry it with exponential
///   backoff; on shutdown it is left unacknowledged so a tracking transport
///   (Redis consumer group) hands it out again after restart
#[derive(Debug)]
pub struct IngestionWorker;

impl IngestionWorker {
    /// Subscribe now and start consuming on a thread named `name`.
    ///
    /// The subscription is taken before this returns, so nothing published
    /// afterwards is missed.
    pub fn spawn<B, S>(
        name: &'static str,
        bus: B,
        ingestor: Arc<EventIngestor<S>>,
        runtime: Handle,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<String> + 'static,
        S: IngestedEventStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<String> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &ingestor, &runtime))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<S>(
    name: &'static str,
    sub: Subscription<String>,
    shutdown_rx: mpsc::Receiver<()>,
    ingestor: &EventIngestor<S>,
    runtime: &Handle,
) where
    S: IngestedEventStore,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(delivery) => {
                if !settle(name, delivery, &shutdown_rx, ingestor, runtime) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, "ingestion worker stopped");
}

/// Ingest one delivery until it is durable or rejected.
///
/// Returns `false` if shutdown was requested while retrying.
fn settle<S>(
    name: &'static str,
    delivery: Delivery<String>,
    shutdown_rx: &mpsc::Receiver<()>,
    ingestor: &EventIngestor<S>,
    runtime: &Handle,
) -> bool
where
    S: IngestedEventStore,
{
    let mut backoff = RETRY_INITIAL_BACKOFF;

    loop {
        match runtime.block_on(ingestor.ingest(delivery.message())) {
            Ok(outcome) => {
                debug!(worker = name, ?outcome, "message ingested");
                delivery.ack();
                return true;
            }
            Err(IngestError::MalformedPayload(error)) => {
                warn!(worker = name, %error, "dropping malformed account event");
                delivery.ack();
                return true;
            }
            Err(IngestError::Store(error)) => {
                warn!(
                    worker = name,
                    %error,
                    retry_in_ms = backoff.as_millis() as u64,
                    "projection store failed; retrying message"
                );
                match shutdown_rx.recv_timeout(backoff) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(backoff),
                    Ok(()) => {
                        debug!(worker = name, "shutdown while retrying; message left unacknowledged");
                        return false;
                    }
                }
                backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tally_core::{AccountNumber, MoneyAmount};
    use tally_events::{AccountEvent, Event, InMemoryEventBus};
    use thiserror::Error;
    use uuid::Uuid;

    use crate::projections::{
        IngestedEventRecord, InMemoryIngestedEventStore, ProjectionStoreError,
    };

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn created_event() -> AccountEvent {
        AccountEvent::created(
            AccountNumber::parse("0000000001").unwrap(),
            MoneyAmount::from_minor(1_000),
        )
    }

    /// Rejects the first `failures` inserts with a backend error.
    #[derive(Debug, Default)]
    struct StumblingStore {
        inner: InMemoryIngestedEventStore,
        failures: AtomicUsize,
    }

    impl StumblingStore {
        fn failing(failures: usize) -> Self {
            Self {
                inner: InMemoryIngestedEventStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl IngestedEventStore for StumblingStore {
        async fn contains(&self, event_id: Uuid) -> Result<bool, ProjectionStoreError> {
            self.inner.contains(event_id).await
        }

        async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ProjectionStoreError::Backend("transient".into()));
            }
            self.inner.insert(record).await
        }

        async fn latest(
            &self,
            limit: i64,
        ) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
            self.inner.latest(limit).await
        }
    }

    #[derive(Debug, Error)]
    #[error("no subscriber")]
    struct NoSubscriber;

    /// Hands out deliveries that count their acknowledgments, like a
    /// consumer-group transport.
    #[derive(Debug, Default)]
    struct TrackingBus {
        outlet: Mutex<Option<mpsc::Sender<Delivery<String>>>>,
        acked: Arc<AtomicUsize>,
    }

    impl EventBus<String> for TrackingBus {
        type Error = NoSubscriber;

        fn publish(&self, message: String) -> Result<(), Self::Error> {
            let outlet = self.outlet.lock().unwrap();
            let acked = Arc::clone(&self.acked);
            outlet
                .as_ref()
                .ok_or(NoSubscriber)?
                .send(Delivery::with_ack(message, move || {
                    acked.fetch_add(1, Ordering::SeqCst);
                }))
                .map_err(|_| NoSubscriber)
        }

        fn subscribe(&self) -> Subscription<String> {
            let (tx, rx) = mpsc::channel();
            *self.outlet.lock().unwrap() = Some(tx);
            Subscription::new(rx)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_ingests_published_messages_and_skips_garbage() {
        let bus = Arc::new(InMemoryEventBus::<String>::new());
        let ingestor = Arc::new(EventIngestor::new(InMemoryIngestedEventStore::new()));
        let worker = IngestionWorker::spawn(
            "test-ingestion",
            Arc::clone(&bus),
            Arc::clone(&ingestor),
            Handle::current(),
        )
        .unwrap();

        let event = created_event();
        let raw = event.encode().unwrap();
        bus.publish("{not json".to_string()).unwrap();
        bus.publish(raw.clone()).unwrap();
        bus.publish(raw).unwrap();

        let store = ingestor.store();
        tokio::task::spawn_blocking({
            let ingestor = Arc::clone(&ingestor);
            move || wait_until(|| ingestor.store().len() == 1)
        })
        .await
        .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get(event.event_id()).is_some());

        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_store_failure_is_retried_until_stored() {
        let bus = Arc::new(TrackingBus::default());
        let ingestor = Arc::new(EventIngestor::new(StumblingStore::failing(2)));
        let worker = IngestionWorker::spawn(
            "test-retry",
            Arc::clone(&bus),
            Arc::clone(&ingestor),
            Handle::current(),
        )
        .unwrap();

        let event = created_event();
        bus.publish(event.encode().unwrap()).unwrap();

        tokio::task::spawn_blocking({
            let ingestor = Arc::clone(&ingestor);
            move || wait_until(|| ingestor.store().inner.len() == 1)
        })
        .await
        .unwrap();

        assert!(ingestor.store().inner.get(event.event_id()).is_some());
        assert_eq!(ingestor.store().failures.load(Ordering::SeqCst), 0);
        assert_eq!(bus.acked.load(Ordering::SeqCst), 1);

        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn message_failing_at_shutdown_stays_unacknowledged() {
        let bus = Arc::new(TrackingBus::default());
        let ingestor = Arc::new(EventIngestor::new(StumblingStore::failing(usize::MAX)));
        let worker = IngestionWorker::spawn(
            "test-unacked",
            Arc::clone(&bus),
            Arc::clone(&ingestor),
            Handle::current(),
        )
        .unwrap();

        bus.publish(created_event().encode().unwrap()).unwrap();

        tokio::task::spawn_blocking({
            let ingestor = Arc::clone(&ingestor);
            move || wait_until(|| ingestor.store().failures.load(Ordering::SeqCst) < usize::MAX - 1)
        })
        .await
        .unwrap();

        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .unwrap();

        assert!(ingestor.store().inner.is_empty());
        assert_eq!(bus.acked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_messages_are_acknowledged() {
        let bus = Arc::new(TrackingBus::default());
        let ingestor = Arc::new(EventIngestor::new(InMemoryIngestedEventStore::new()));
        let worker = IngestionWorker::spawn(
            "test-malformed",
            Arc::clone(&bus),
            Arc::clone(&ingestor),
            Handle::current(),
        )
        .unwrap();

        bus.publish("{\"type\":\"DEPOSITED\"}".to_string()).unwrap();

        tokio::task::spawn_blocking({
            let bus = Arc::clone(&bus);
            move || wait_until(|| bus.acked.load(Ordering::SeqCst) == 1)
        })
        .await
        .unwrap();

        assert_eq!(bus.acked.load(Ordering::SeqCst), 1);
        assert!(ingestor.store().is_empty());

        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .unwrap();
    }
}
