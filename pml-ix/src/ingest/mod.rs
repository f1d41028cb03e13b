//! Ingestion pipeline: coordinator, priority queue, analysis scheduler

pub mod coordinator;
pub mod queue;
pub mod scheduler;

pub use coordinator::{IngestionCoordinator, SyncReport};
pub use queue::{Priority, WorkQueue};
pub use scheduler::{AnalysisScheduler, ProgressReport, SchedulerConfig};
