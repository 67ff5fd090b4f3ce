//! docshift-core - engines for batch document conversion
//!
//! This crate contains the core functionality for docshift, including:
//! - Batch orchestration: per-file state machine, sequential conversion
//!   with retry and stall detection, aggregate progress (`batch`)
//! - Archive packing: deterministic size-bounded ZIP planning and
//!   materialization (`archive`)
//! - Lazy previews: visibility-gated page rendering (`preview`)
//! - The conversion engine contract (`convert`) and the ephemeral blob
//!   store (`storage`)
//!
//! Document rendering itself is a black box: everything here talks to it
//! through the [`convert::Converter`] trait.

pub mod archive;
pub mod batch;
pub mod config;
pub mod convert;
pub mod error;
pub mod preview;
pub mod storage;

pub use archive::{
    build_archives, plan_archives, Archive, ArchiveMember, ArchivePlan, PlannedArchive,
};
pub use batch::{
    event_stream, BatchEvent, BatchOrchestrator, BatchOutcome, BatchProgress, BatchSummary,
    FileTask, SourceItem, TaskStatus,
};
pub use config::BatchConfig;
pub use convert::{ConvertProgress, Converter, DocumentInfo, NoOpSink, ProgressSink, RenderedPage};
pub use error::{BatchError, ConvertError, TaskFailure};
pub use preview::{PreviewEvent, PreviewScheduler};
pub use storage::{BlobStore, MemoryBlobStore};
