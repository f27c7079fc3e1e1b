//! Background maintenance.

mod worker;

pub use worker::{CleanupWorker, CleanupWorkerConfig};
