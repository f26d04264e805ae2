//! Background relay: ships staged account events out of the Postgres outbox
//! and ingests whatever arrives on the transport into the projection table.
//!
//! ```text
//! accounts tx ──► account_event_outbox ──► OutboxDispatcher ──► transport
//!                                                                  │
//!                 account_events ◄── EventIngestor ◄── IngestionWorker
//! ```
//!
//! The transport is Redis Streams when `TALLY_REDIS_URL` is set (and the
//! `redis` feature is on), otherwise an in-process bus.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::info;

use tally_events::{EventBus, InMemoryEventBus};
use tally_infra::account_store::PostgresAccountStore;
use tally_infra::config::{DATABASE_URL, Settings};
use tally_infra::db;
use tally_infra::event_bus::EventPublisher;
use tally_infra::outbox::OutboxDispatcher;
use tally_infra::projections::{EventIngestor, PostgresIngestedEventStore};
use tally_infra::workers::IngestionWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tally_observability::init();

    let settings = Settings::from_env();
    let database_url = settings
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("{DATABASE_URL} must be set"))?;

    let pool = db::connect(&database_url, settings.database_max_connections)
        .await
        .context("failed to connect to postgres")?;
    db::apply_schema(&pool)
        .await
        .context("failed to apply ledger schema")?;

    serve(pool, &settings).await
}

#[cfg(feature = "redis")]
async fn serve(pool: PgPool, settings: &Settings) -> anyhow::Result<()> {
    use tally_infra::event_bus::RedisStreamsEventBus;

    match settings.redis_url.as_deref() {
        Some(url) => {
            let bus = RedisStreamsEventBus::new(url, Some(settings.event_stream.clone()))
                .context("failed to configure redis streams transport")?
                .with_consumer(
                    settings.consumer_group.clone(),
                    settings.consumer_name.clone(),
                );
            info!(
                stream = bus.stream_key(),
                group = bus.consumer_group(),
                consumer = bus.consumer_name(),
                "using redis streams transport"
            );
            run(pool, Arc::new(bus), settings).await
        }
        None => {
            info!("using in-process event bus");
            run(pool, Arc::new(InMemoryEventBus::<String>::new()), settings).await
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn serve(pool: PgPool, settings: &Settings) -> anyhow::Result<()> {
    if settings.redis_url.is_some() {
        tracing::warn!("TALLY_REDIS_URL is set but the relay was built without redis; using the in-process bus");
    }
    run(pool, Arc::new(InMemoryEventBus::<String>::new()), settings).await
}

async fn run<B>(pool: PgPool, bus: B, settings: &Settings) -> anyhow::Result<()>
where
    B: EventBus<String> + Clone + 'static,
{
    let ingestor = Arc::new(EventIngestor::new(PostgresIngestedEventStore::new(
        pool.clone(),
    )));
    let worker = IngestionWorker::spawn(
        "account-event-ingestion",
        bus.clone(),
        ingestor,
        tokio::runtime::Handle::current(),
    )
    .context("failed to spawn ingestion worker")?;

    let dispatcher = OutboxDispatcher::new(
        PostgresAccountStore::new(pool),
        EventPublisher::new(bus),
        settings.outbox_batch_size,
    )
    .with_retention(settings.outbox_retention);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = settings.outbox_poll_interval;
    let dispatcher_task =
        tokio::spawn(async move { dispatcher.run(poll_interval, shutdown_rx).await });

    info!(
        batch_size = settings.outbox_batch_size,
        poll_ms = poll_interval.as_millis() as u64,
        "relay running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    dispatcher_task
        .await
        .context("outbox dispatcher task panicked")?;
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("ingestion worker panicked")?;

    info!("relay stopped");
    Ok(())
}
