//! chainfeed-processor: keeps a consumer up to date with one chain.
//!
//! # Architecture
//!
//! ```text
//! Supervisor → BlockProcessor::track_latest_block
//!                  ├── ProcessorState     (current / first streamed / latest processed)
//!                  ├── backfill task      (one historic query at a time)
//!                  ├── CheckpointManager  (resume point across restarts)
//!                  └── HealthMonitor      (freshness + outstanding errors)
//! ```

pub mod checkpoint;
pub mod health;
pub mod processor;
pub mod state;
pub mod supervisor;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use health::{HealthMonitor, HealthReport};
pub use processor::{BlockProcessor, IngestEvent, ProcessorConfig};
pub use state::{HeadUpdate, LogPlacement, ProcessorSnapshot, ProcessorState};
pub use supervisor::Supervisor;
