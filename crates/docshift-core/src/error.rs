//! Error taxonomy for the conversion pipeline.
//!
//! Per-attempt failures (`ConvertError`) are recovered locally by the
//! orchestrator's retry loop and never surface to the caller directly.
//! Only batch-level conditions (`BatchError`) are returned as hard errors.

use serde::Serialize;
use thiserror::Error;

/// Failure of a single conversion attempt.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The conversion engine rejected the document or threw.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// No progress event from the engine within the stall window.
    ///
    /// Counts toward retries like a normal failure but is reported with
    /// the last progress message the engine emitted.
    #[error("conversion stalled (last progress: {last_message})")]
    Stall { last_message: String },

    /// The result could not be written to the blob store.
    #[error("failed to store result: {0}")]
    StorageWrite(String),
}

/// One task's terminal error, collected for batch-level diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub name: String,
    pub error: String,
}

/// Batch-level failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid output format: {0}")]
    InvalidOutputFormat(String),

    #[error("no files provided")]
    NoInput,

    #[error("no supported files found")]
    NoSupportedFiles,

    /// Zero tasks reached a terminal success state.
    #[error("all conversions failed ({} files)", .0.len())]
    AllFailed(Vec<TaskFailure>),

    /// The archive container could not be written.
    #[error("failed to build archive: {0}")]
    Archive(String),

    /// The caller cancelled the batch; stored bytes were released and no
    /// archive was produced.
    #[error("batch cancelled")]
    Cancelled,
}
