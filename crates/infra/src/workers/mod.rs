//! Background worker threads.

pub mod ingestion_worker;

pub use ingestion_worker::{IngestionWorker, WorkerHandle};
