//! Task types and batch bookkeeping.

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::config;
use crate::error::TaskFailure;

/// One source document submitted for conversion.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub name: String,
    pub bytes: Bytes,
}

impl SourceItem {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Lifecycle of a task within a batch.
///
/// `Done`, `Copied`, `Failed` and `Unsupported` are terminal: once entered
/// they are never left for the lifetime of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskStatus {
    /// Classified and waiting for conversion.
    Ready,
    /// Conversion attempt in flight.
    Converting,
    /// Converted successfully.
    Done,
    /// Copied verbatim; the source was already in the target format.
    Copied,
    /// All attempts exhausted.
    Failed { error: String },
    /// Source extension not in the supported-input set.
    Unsupported,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Copied | TaskStatus::Failed { .. } | TaskStatus::Unsupported
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Copied)
    }
}

/// One item being converted or copied within a batch.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub id: Uuid,
    /// Original file name, for display and diagnostics.
    pub name: String,
    /// Source bytes; the task is the sole owner until conversion needs them.
    pub source: Bytes,
    /// Lowercased source extension.
    pub source_ext: String,
    /// File name with the target extension substituted.
    pub output_name: String,
    pub status: TaskStatus,
    /// Conversion attempts made so far.
    pub attempt: u32,
    /// Blob store key of the result; set iff status is `Done` or `Copied`.
    pub storage_key: Option<String>,
    /// Byte length of the stored result, for the packing planner.
    pub result_size: Option<u64>,
}

impl FileTask {
    /// Classify a source item against the supported-input table.
    pub fn classify(item: SourceItem, output_format: &str) -> Self {
        let source_ext = source_extension(&item.name);
        let status = if config::is_supported_input(&source_ext) {
            TaskStatus::Ready
        } else {
            TaskStatus::Unsupported
        };

        Self {
            id: Uuid::new_v4(),
            output_name: output_name(&item.name, output_format),
            name: item.name,
            source: item.bytes,
            source_ext,
            status,
            attempt: 0,
            storage_key: None,
            result_size: None,
        }
    }
}

/// Lowercased extension of a file name; empty when there is none.
pub(crate) fn source_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// File name with the last extension replaced by the target format.
pub(crate) fn output_name(name: &str, output_format: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, output_format),
        _ => format!("{}.{}", name, output_format),
    }
}

/// Aggregate progress, one event per task resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Tasks resolved so far; strictly increasing across events.
    pub current: usize,
    /// Eligible tasks, fixed at submission.
    pub total: usize,
    pub converted: usize,
    pub copied: usize,
    pub failed: usize,
}

/// Events emitted while a batch runs, for live UI labels.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum BatchEvent {
    /// A task changed status.
    TaskStatus {
        id: Uuid,
        name: String,
        status: TaskStatus,
    },
    /// Aggregate counters after a task resolved.
    Progress(BatchProgress),
}

/// Final account of a completed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub converted: usize,
    pub copied: usize,
    pub failed: usize,
    /// Items excluded at classification time as unsupported.
    pub skipped: usize,
    pub failures: Vec<TaskFailure>,
    /// RFC 3339 completion timestamp.
    pub completed_at: String,
}
