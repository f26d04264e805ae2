//! Transactional outbox relay.
//!
//! Ledger mutations stage their event in the same unit of work as the balance
//! change and then try to publish straight away. Anything that did not make it
//! out (transport down, crash between commit and publish) stays undispatched
//! in the outbox until the dispatcher delivers it.
//!
//! Entries are published in staging order. A round stops at the first
//! transport failure so a down broker is not hammered; the next round retries
//! from the same entry.
//!
//! Dispatched entries are kept for the configured retention window and then
//! deleted by [`OutboxDispatcher::prune`]. Without a retention window the
//! table grows by one row per ledger event.

use std::time::{Duration, Instant};

use chrono::Utc;
use tally_events::{Event, EventBus};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account_store::{Outbox, StoreError};
use crate::event_bus::EventPublisher;

/// What one `drain_once` round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub published: usize,
    /// The round ended early on a transport failure.
    pub stalled: bool,
}

/// Minimum gap between two prune passes inside [`OutboxDispatcher::run`].
const PRUNE_EVERY: Duration = Duration::from_secs(60);

pub struct OutboxDispatcher<O, B> {
    outbox: O,
    publisher: EventPublisher<B>,
    batch_size: usize,
    retention: Option<Duration>,
}

impl<O, B> OutboxDispatcher<O, B>
where
    O: Outbox,
    B: EventBus<String>,
{
    pub fn new(outbox: O, publisher: EventPublisher<B>, batch_size: usize) -> Self {
        Self {
            outbox,
            publisher,
            batch_size: batch_size.max(1),
            retention: None,
        }
    }

    /// Delete dispatched entries once they are older than `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Remove entries dispatched more than the retention window ago.
    /// Returns `0` without touching storage when no window is set.
    pub async fn prune(&self) -> Result<u64, StoreError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let window = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let pruned = self.outbox.prune_dispatched(cutoff).await?;
        if pruned > 0 {
            info!(pruned, %cutoff, "dispatched outbox entries pruned");
        }
        Ok(pruned)
    }

    /// Publish up to one batch of undispatched entries.
    ///
    /// Storage failures are returned; transport failures end the round and
    /// are reported through [`DrainReport::stalled`].
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let pending = self.outbox.pending(self.batch_size).await?;
        let mut report = DrainReport::default();

        for entry in pending {
            if !self.publisher.safe_publish(&entry.event) {
                report.stalled = true;
                break;
            }
            self.outbox.mark_dispatched(entry.event.event_id()).await?;
            report.published += 1;
        }

        if report.published > 0 {
            info!(
                published = report.published,
                stalled = report.stalled,
                "outbox entries dispatched"
            );
        }
        Ok(report)
    }

    /// Drain every `poll_interval` until `shutdown` flips to `true` or its
    /// sender is dropped.
    ///
    /// A full batch is followed immediately by another round instead of
    /// waiting for the next tick.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            loop {
                match self.drain_once().await {
                    Ok(report) if report.published == self.batch_size && !report.stalled => {
                        continue;
                    }
                    Ok(_) => break,
                    Err(error) => {
                        warn!(%error, "outbox drain failed");
                        break;
                    }
                }
            }

            let prune_due = last_prune.map_or(true, |at| at.elapsed() >= PRUNE_EVERY);
            if self.retention.is_some() && prune_due {
                if let Err(error) = self.prune().await {
                    warn!(%error, "outbox prune failed");
                }
                last_prune = Some(Instant::now());
            }
        }

        debug!("outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tally_accounts::Account;
    use tally_core::{AccountNumber, MoneyAmount};
    use tally_events::{AccountEvent, InMemoryEventBus, Subscription};

    use crate::account_store::{AccountStore, InMemoryAccountStore, UnitOfWork};

    #[derive(Debug, thiserror::Error)]
    #[error("transport down")]
    struct Down;

    /// Accepts `budget` messages, then fails until reset.
    #[derive(Debug, Default)]
    struct BudgetBus {
        budget: AtomicUsize,
        unlimited: AtomicBool,
        inner: InMemoryEventBus<String>,
    }

    impl EventBus<String> for BudgetBus {
        type Error = Down;

        fn publish(&self, message: String) -> Result<(), Self::Error> {
            if !self.unlimited.load(Ordering::SeqCst) {
                let left = self.budget.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(Down);
                }
                self.budget.store(left - 1, Ordering::SeqCst);
            }
            self.inner.publish(message).map_err(|_| Down)
        }

        fn subscribe(&self) -> Subscription<String> {
            self.inner.subscribe()
        }
    }

    async fn stage_deposits(store: &InMemoryAccountStore, count: usize) -> Vec<AccountEvent> {
        let number = AccountNumber::parse("0000000001").unwrap();
        let mut uow = store.begin().await.unwrap();
        uow.insert_new(Account::new(number.clone(), "A", "B", MoneyAmount::zero()).unwrap())
            .await
            .unwrap();
        let mut events = Vec::new();
        for i in 1..=count {
            let amount = MoneyAmount::from_minor(i as i64);
            let event = AccountEvent::deposited(number.clone(), amount, amount);
            uow.stage_event(&event).await.unwrap();
            events.push(event);
        }
        uow.commit().await.unwrap();
        events
    }

    #[tokio::test]
    async fn drain_publishes_in_staging_order_and_marks_dispatched() {
        let store = InMemoryAccountStore::new();
        let events = stage_deposits(&store, 3).await;
        let bus = Arc::new(BudgetBus::default());
        bus.unlimited.store(true, Ordering::SeqCst);
        let sub = bus.subscribe();

        let dispatcher = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus), 10);
        let report = dispatcher.drain_once().await.unwrap();

        assert_eq!(report, DrainReport { published: 3, stalled: false });
        for expected in &events {
            let got = AccountEvent::decode(&sub.try_recv().unwrap().into_message()).unwrap();
            assert_eq!(&got, expected);
        }
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_stops_at_first_transport_failure() {
        let store = InMemoryAccountStore::new();
        let events = stage_deposits(&store, 3).await;
        let bus = Arc::new(BudgetBus::default());
        bus.budget.store(1, Ordering::SeqCst);

        let dispatcher = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus.clone()), 10);
        let report = dispatcher.drain_once().await.unwrap();
        assert_eq!(report, DrainReport { published: 1, stalled: true });

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event, events[1]);

        bus.unlimited.store(true, Ordering::SeqCst);
        let report = dispatcher.drain_once().await.unwrap();
        assert_eq!(report, DrainReport { published: 2, stalled: false });
    }

    #[tokio::test]
    async fn batch_size_caps_a_round() {
        let store = InMemoryAccountStore::new();
        stage_deposits(&store, 5).await;
        let bus = Arc::new(BudgetBus::default());
        bus.unlimited.store(true, Ordering::SeqCst);

        let dispatcher = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus), 2);
        assert_eq!(dispatcher.drain_once().await.unwrap().published, 2);
        assert_eq!(store.pending(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn prune_respects_the_retention_window() {
        let store = InMemoryAccountStore::new();
        stage_deposits(&store, 3).await;
        let bus = Arc::new(BudgetBus::default());
        bus.budget.store(2, Ordering::SeqCst);

        let keep_a_day = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus.clone()), 10)
            .with_retention(Duration::from_secs(86_400));
        keep_a_day.drain_once().await.unwrap();
        assert_eq!(keep_a_day.prune().await.unwrap(), 0);
        assert_eq!(store.outbox_entries().len(), 3);

        let keep_nothing = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus), 10)
            .with_retention(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(keep_nothing.prune().await.unwrap(), 2);

        // The entry that never went out survives.
        let left = store.outbox_entries();
        assert_eq!(left.len(), 1);
        assert!(!left[0].1);
    }

    #[tokio::test]
    async fn prune_without_retention_keeps_everything() {
        let store = InMemoryAccountStore::new();
        stage_deposits(&store, 2).await;
        let bus = Arc::new(BudgetBus::default());
        bus.unlimited.store(true, Ordering::SeqCst);

        let dispatcher = OutboxDispatcher::new(store.clone(), EventPublisher::new(bus), 10);
        dispatcher.drain_once().await.unwrap();
        assert_eq!(dispatcher.prune().await.unwrap(), 0);
        assert_eq!(store.outbox_entries().len(), 2);
    }

    #[tokio::test]
    async fn run_prunes_dispatched_entries() {
        let store = InMemoryAccountStore::new();
        stage_deposits(&store, 3).await;
        let bus = Arc::new(BudgetBus::default());
        bus.unlimited.store(true, Ordering::SeqCst);

        let dispatcher = Arc::new(
            OutboxDispatcher::new(store.clone(), EventPublisher::new(bus), 10)
                .with_retention(Duration::ZERO),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.run(Duration::from_millis(10), stop_rx).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.outbox_entries().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_drains_until_shutdown() {
        let store = InMemoryAccountStore::new();
        stage_deposits(&store, 5).await;
        let bus = Arc::new(BudgetBus::default());
        bus.unlimited.store(true, Ordering::SeqCst);

        let dispatcher = Arc::new(OutboxDispatcher::new(
            store.clone(),
            EventPublisher::new(bus),
            2,
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.run(Duration::from_millis(10), stop_rx).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.pending(10).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
