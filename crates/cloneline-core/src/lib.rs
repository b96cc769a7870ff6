//! Cloneline Core - Pipeline substrate for the clone-corpus builder
//!
//! This crate provides the components every pipeline stage shares:
//! bounded work queues with backpressure, fixed-size stage thread pools,
//! content digests, the flat-relation record codec, logging, and progress
//! reporting.

pub mod digest;
pub mod error;
pub mod logging;
pub mod progress;
pub mod record;
pub mod stage;
pub mod work_queue;

// Re-exports for convenience
pub use digest::{Digest, DigestBuilder, ParseDigestError};
pub use error::JobError;
pub use logging::{BarLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use stage::{PipelineStage, StatsReporter};
pub use work_queue::{BoundedWorkQueue, DEFAULT_QUEUE_CAPACITY, StageStats, StatsSnapshot};
