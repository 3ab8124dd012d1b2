//! BSP-Stream: the biosignal streaming pipeline
//!
//! Ingestion and normalization, batching under backpressure, per-channel
//! circular buffers and the publish/subscribe fan-out, plus the tokio pieces
//! that drive flushing and off-context band-power analysis.

pub mod config;
pub mod normalizer;
pub mod scheduler;
pub mod buffer_store;
pub mod fanout;
pub mod diagnostics;
pub mod context;
pub mod ticker;
pub mod analysis_worker;
pub mod stages;

pub use config::{PipelineConfig, ProcessingProfile};
pub use normalizer::{FullScale, Normalizer};
pub use scheduler::{EnqueueOutcome, Scheduler};
pub use buffer_store::{BufferStore, CircularBuffer};
pub use fanout::{OutputStreams, Registry, Subscription};
pub use diagnostics::{counter_gap, CounterTracker};
pub use context::{DataContext, PipelineStats, Snapshot};
pub use ticker::{spawn_flush_loop, IntervalTicks, TickSource};
pub use analysis_worker::{AnalysisHandle, AnalysisWorker};
pub use stages::{BandPowerStage, BandPowerStageConfig};
