//! Batch conversion orchestration.
//!
//! Data flow:
//!
//! ```text
//! Vec<SourceItem>
//!       │ classify (supported? same format?)
//!       ▼
//! FileTask: ready ──► converting ──► done | failed
//!           ready ──► copied                    (copy path)
//!           unsupported                         (classification only)
//!       │ one task at a time, submission order
//!       ▼
//! BlobStore ──► archive::plan_archives ──► archive::build_archives
//! ```
//!
//! Tasks are processed strictly sequentially: the conversion engine is a
//! single shared instance, and serializing access to it is the batch's
//! backpressure mechanism.

mod orchestrator;
mod types;

pub use orchestrator::{event_stream, BatchOrchestrator, BatchOutcome};
pub use types::{BatchEvent, BatchProgress, BatchSummary, FileTask, SourceItem, TaskStatus};
