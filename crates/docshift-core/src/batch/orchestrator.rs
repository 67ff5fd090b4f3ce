//! The batch conversion loop: retry, stall detection, cancellation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{self, Archive, ArchiveMember, ArchivePlan};
use crate::config::{self, BatchConfig};
use crate::convert::{ConvertProgress, Converter, ProgressSink};
use crate::error::{BatchError, ConvertError, TaskFailure};
use crate::storage::BlobStore;

use super::types::{BatchEvent, BatchProgress, BatchSummary, FileTask, SourceItem, TaskStatus};

/// Result of a batch that produced at least one success.
#[derive(Debug)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    pub plan: ArchivePlan,
    pub archives: Vec<Archive>,
    /// Final per-task states, for display and diagnostics.
    pub tasks: Vec<FileTask>,
}

/// Drives one batch of file tasks through the conversion engine.
///
/// The orchestrator owns the single engine instance for the batch and
/// processes tasks one at a time in submission order. Each instance runs
/// one batch; its cancellation token applies to that run.
pub struct BatchOrchestrator<C, S> {
    converter: Arc<C>,
    store: Arc<S>,
    config: BatchConfig,
    events_tx: mpsc::Sender<BatchEvent>,
    cancel: CancellationToken,
}

impl<C: Converter, S: BlobStore> BatchOrchestrator<C, S> {
    /// Create an orchestrator and the receiver for its event stream.
    pub fn new(
        converter: Arc<C>,
        store: Arc<S>,
        config: BatchConfig,
    ) -> (Self, mpsc::Receiver<BatchEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Self {
                converter,
                store,
                config,
                events_tx,
                cancel: CancellationToken::new(),
            },
            events_rx,
        )
    }

    /// Token that cancels this batch when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the batch to completion.
    ///
    /// Classifies every item, converts or copies eligible tasks one at a
    /// time, then packs successful outputs into archives. Per-task
    /// failures are recovered locally; only batch-level conditions are
    /// returned as errors.
    pub async fn run(
        &self,
        items: Vec<SourceItem>,
        output_format: &str,
        base_name: &str,
    ) -> Result<BatchOutcome, BatchError> {
        if !config::is_valid_output(output_format) {
            return Err(BatchError::InvalidOutputFormat(output_format.to_string()));
        }
        if items.is_empty() {
            return Err(BatchError::NoInput);
        }

        // Stale results from a previous run are discarded up front.
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear blob store before batch");
        }

        let batch_id = Uuid::new_v4();
        let mut tasks: Vec<FileTask> = items
            .into_iter()
            .map(|item| FileTask::classify(item, output_format))
            .collect();

        let total = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Unsupported)
            .count();
        let skipped = tasks.len() - total;
        if total == 0 {
            return Err(BatchError::NoSupportedFiles);
        }

        for task in &tasks {
            self.emit_status(task);
        }
        tracing::info!(
            batch_id = %batch_id,
            total,
            skipped,
            output_format,
            "Batch started"
        );

        let mut progress = BatchProgress {
            total,
            ..Default::default()
        };

        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Unsupported {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(batch_id).await);
            }

            let storage_key = format!("batch-{}-{}", batch_id.simple(), task.id.simple());

            if task.source_ext == output_format {
                self.copy_task(task, &storage_key).await;
            } else {
                self.convert_task(task, output_format, &storage_key).await;
            }

            if self.cancel.is_cancelled() {
                return Err(self.cancelled(batch_id).await);
            }

            progress.current += 1;
            match &task.status {
                TaskStatus::Done => progress.converted += 1,
                TaskStatus::Copied => progress.copied += 1,
                TaskStatus::Failed { .. } => progress.failed += 1,
                _ => {}
            }
            self.emit_status(task);
            self.emit(BatchEvent::Progress(progress));
        }

        let members: Vec<ArchiveMember> = tasks
            .iter()
            .filter(|t| t.status.is_success())
            .filter_map(|t| {
                let storage_key = t.storage_key.clone()?;
                Some(ArchiveMember {
                    output_name: t.output_name.clone(),
                    storage_key,
                    size: t.result_size.unwrap_or(0),
                })
            })
            .collect();

        let failures = collect_failures(&tasks);

        if members.is_empty() {
            tracing::error!(batch_id = %batch_id, failed = failures.len(), "All conversions failed");
            return Err(BatchError::AllFailed(failures));
        }

        let plan = archive::plan_archives(members, base_name, self.config.archive_ceiling);
        let archives = archive::build_archives(&plan, self.store.as_ref())
            .await
            .map_err(|e| BatchError::Archive(e.to_string()))?;

        tracing::info!(
            batch_id = %batch_id,
            converted = progress.converted,
            copied = progress.copied,
            failed = progress.failed,
            archives = archives.len(),
            "Batch complete"
        );

        Ok(BatchOutcome {
            summary: BatchSummary {
                total,
                converted: progress.converted,
                copied: progress.copied,
                failed: progress.failed,
                skipped,
                failures,
                completed_at: chrono::Utc::now().to_rfc3339(),
            },
            plan,
            archives,
            tasks,
        })
    }

    /// Same-format path: store the source bytes verbatim under a fresh key.
    async fn copy_task(&self, task: &mut FileTask, storage_key: &str) {
        let bytes = task.source.clone();
        let size = bytes.len() as u64;

        match self.store.put(storage_key, bytes).await {
            Ok(()) if !self.cancel.is_cancelled() => {
                task.status = TaskStatus::Copied;
                task.storage_key = Some(storage_key.to_string());
                task.result_size = Some(size);
                tracing::debug!(name = %task.name, size, "Copied without conversion");
            }
            // Cancelled between the write and the commit; the caller
            // discards everything.
            Ok(()) => {}
            Err(e) => {
                let error = ConvertError::StorageWrite(e.to_string()).to_string();
                tracing::error!(name = %task.name, error = %error, "Copy failed");
                task.status = TaskStatus::Failed { error };
            }
        }
    }

    /// Convert path: up to `max_retries + 1` attempts with fixed backoff.
    async fn convert_task(&self, task: &mut FileTask, output_format: &str, storage_key: &str) {
        task.status = TaskStatus::Converting;
        self.emit_status(task);

        let mut last_error: Option<ConvertError> = None;

        for attempt in 0..=self.config.max_retries {
            if self.cancel.is_cancelled() {
                return;
            }
            task.attempt = attempt + 1;

            match self.attempt_convert(task, output_format, storage_key).await {
                Ok(Some(size)) => {
                    task.status = TaskStatus::Done;
                    task.storage_key = Some(storage_key.to_string());
                    task.result_size = Some(size);
                    tracing::debug!(name = %task.name, attempt = task.attempt, size, "Converted");
                    return;
                }
                // Cancelled mid-attempt; nothing was committed.
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(
                        name = %task.name,
                        attempt = task.attempt,
                        error = %e,
                        "Conversion attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        }
                    }
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        tracing::error!(name = %task.name, attempts = task.attempt, error = %error, "Task failed");
        task.status = TaskStatus::Failed { error };
    }

    /// One conversion attempt raced against the stall watchdog.
    ///
    /// Returns `Ok(Some(size))` when the result was stored, `Ok(None)`
    /// when the batch was cancelled mid-attempt, `Err` on a failed or
    /// stalled attempt. A store-write failure counts as a failed attempt.
    async fn attempt_convert(
        &self,
        task: &FileTask,
        output_format: &str,
        storage_key: &str,
    ) -> Result<Option<u64>, ConvertError> {
        let mark = StallMark::new();
        let convert = self.converter.convert(
            task.source.clone(),
            &task.source_ext,
            output_format,
            &mark,
        );
        tokio::pin!(convert);

        let result = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(None),

                res = &mut convert => break res,

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Some(last_message) = mark.stalled(self.config.stall_timeout) {
                        // Dropping the pinned future abandons the in-flight call.
                        return Err(ConvertError::Stall { last_message });
                    }
                }
            }
        };

        let bytes = result.map_err(|e| ConvertError::Conversion(e.to_string()))?;
        let size = bytes.len() as u64;

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        self.store
            .put(storage_key, bytes)
            .await
            .map_err(|e| ConvertError::StorageWrite(e.to_string()))?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(size))
    }

    /// Release stored bytes and report cancellation.
    async fn cancelled(&self, batch_id: Uuid) -> BatchError {
        tracing::info!(batch_id = %batch_id, "Batch cancelled; releasing stored results");
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear blob store after cancellation");
        }
        BatchError::Cancelled
    }

    fn emit_status(&self, task: &FileTask) {
        self.emit(BatchEvent::TaskStatus {
            id: task.id,
            name: task.name.clone(),
            status: task.status.clone(),
        });
    }

    fn emit(&self, event: BatchEvent) {
        // Advisory stream; a slow or absent consumer must not block conversion.
        let _ = self.events_tx.try_send(event);
    }
}

/// Wrap an event receiver in a `Stream` for combinator-style consumers.
pub fn event_stream(events_rx: mpsc::Receiver<BatchEvent>) -> ReceiverStream<BatchEvent> {
    ReceiverStream::new(events_rx)
}

fn collect_failures(tasks: &[FileTask]) -> Vec<TaskFailure> {
    tasks
        .iter()
        .filter_map(|t| match &t.status {
            TaskStatus::Failed { error } => Some(TaskFailure {
                name: t.name.clone(),
                error: error.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Last-progress timestamp shared between the engine's progress sink and
/// the stall watchdog.
struct StallMark {
    inner: Mutex<(Instant, String)>,
}

impl StallMark {
    fn new() -> Self {
        Self {
            inner: Mutex::new((Instant::now(), String::new())),
        }
    }

    /// Returns the last progress message when no event arrived within `timeout`.
    fn stalled(&self, timeout: Duration) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.0.elapsed() > timeout).then(|| inner.1.clone())
    }
}

impl ProgressSink for StallMark {
    fn progress(&self, event: ConvertProgress) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner = (Instant::now(), event.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    fn test_config() -> BatchConfig {
        BatchConfig {
            max_retries: 2,
            stall_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(5),
            archive_ceiling: 1024,
        }
    }

    /// Fails the first `fail_times` convert calls, then succeeds.
    struct FlakyConverter {
        fail_times: u32,
        calls: AtomicU32,
    }

    impl FlakyConverter {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_times,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Converter for FlakyConverter {
        async fn convert(
            &self,
            input: Bytes,
            _from: &str,
            _to: &str,
            sink: &dyn ProgressSink,
        ) -> anyhow::Result<Bytes> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            sink.progress(ConvertProgress {
                phase: "convert".to_string(),
                percent: 50,
                message: format!("attempt {}", call),
            });
            if call < self.fail_times {
                anyhow::bail!("engine error on call {}", call);
            }
            Ok(input)
        }

        async fn document_info(
            &self,
            _input: Bytes,
            _from: &str,
        ) -> anyhow::Result<crate::convert::DocumentInfo> {
            anyhow::bail!("not used")
        }

        async fn render_page(
            &self,
            _input: Bytes,
            _from: &str,
            _page: usize,
            _target_width: u32,
        ) -> anyhow::Result<crate::convert::RenderedPage> {
            anyhow::bail!("not used")
        }
    }

    /// Emits one progress event, then goes silent.
    struct StallingConverter;

    #[async_trait]
    impl Converter for StallingConverter {
        async fn convert(
            &self,
            _input: Bytes,
            _from: &str,
            _to: &str,
            sink: &dyn ProgressSink,
        ) -> anyhow::Result<Bytes> {
            sink.progress(ConvertProgress {
                phase: "load".to_string(),
                percent: 10,
                message: "loading document".to_string(),
            });
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }

        async fn document_info(
            &self,
            _input: Bytes,
            _from: &str,
        ) -> anyhow::Result<crate::convert::DocumentInfo> {
            anyhow::bail!("not used")
        }

        async fn render_page(
            &self,
            _input: Bytes,
            _from: &str,
            _page: usize,
            _target_width: u32,
        ) -> anyhow::Result<crate::convert::RenderedPage> {
            anyhow::bail!("not used")
        }
    }

    fn items(names: &[&str]) -> Vec<SourceItem> {
        names
            .iter()
            .map(|n| SourceItem::new(*n, Bytes::from_static(b"contents")))
            .collect()
    }

    #[tokio::test]
    async fn test_retry_bound_exhausts_after_max_retries_plus_one() {
        let converter = Arc::new(FlakyConverter::new(u32::MAX));
        let store = Arc::new(MemoryBlobStore::new());
        let (orch, _rx) = BatchOrchestrator::new(converter.clone(), store, test_config());

        let err = orch
            .run(items(&["a.docx"]), "pdf", "out")
            .await
            .expect_err("batch should fail");

        match err {
            BatchError::AllFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].error.contains("engine error"));
            }
            other => panic!("expected AllFailed, got {other:?}"),
        }
        // R = 2 means exactly 3 attempts, never fewer, never more.
        assert_eq!(converter.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let converter = Arc::new(FlakyConverter::new(2));
        let store = Arc::new(MemoryBlobStore::new());
        let (orch, _rx) = BatchOrchestrator::new(converter.clone(), store.clone(), test_config());

        let outcome = orch.run(items(&["a.docx"]), "pdf", "out").await.unwrap();
        assert_eq!(converter.calls(), 3);
        assert_eq!(outcome.summary.converted, 1);
        assert_eq!(outcome.tasks[0].attempt, 3);
        assert_eq!(outcome.tasks[0].status, TaskStatus::Done);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_stall_detection_aborts_and_retries() {
        let converter = Arc::new(StallingConverter);
        let store = Arc::new(MemoryBlobStore::new());
        let mut config = test_config();
        config.max_retries = 1;
        let (orch, _rx) = BatchOrchestrator::new(converter, store, config);

        let started = Instant::now();
        let err = orch
            .run(items(&["a.docx"]), "pdf", "out")
            .await
            .expect_err("stalled batch should fail");

        // Two attempts, each bounded by stall_timeout + poll_interval.
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            BatchError::AllFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].error.contains("stalled"));
                assert!(failures[0].error.contains("loading document"));
            }
            other => panic!("expected AllFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_storage_key_set_iff_success() {
        let converter = Arc::new(FlakyConverter::new(3)); // first task burns all attempts
        let store = Arc::new(MemoryBlobStore::new());
        let (orch, _rx) = BatchOrchestrator::new(converter, store, test_config());

        let outcome = orch
            .run(items(&["a.docx", "b.docx", "c.exe"]), "pdf", "out")
            .await
            .unwrap();

        for task in &outcome.tasks {
            assert_eq!(
                task.storage_key.is_some(),
                task.status.is_success(),
                "task {} violates the storage-key invariant",
                task.name
            );
            assert!(task.status.is_terminal());
        }
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.converted, 1);
        assert_eq!(outcome.summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_progress_events_are_ordered_and_complete() {
        let converter = Arc::new(FlakyConverter::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let (orch, mut rx) = BatchOrchestrator::new(converter, store, test_config());

        let outcome = orch
            .run(items(&["a.docx", "b.pdf", "c.xlsx"]), "pdf", "out")
            .await
            .unwrap();
        drop(orch);

        let mut progress_events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let BatchEvent::Progress(p) = event {
                progress_events.push(p);
            }
        }

        assert_eq!(progress_events.len(), 3);
        for (i, p) in progress_events.iter().enumerate() {
            assert_eq!(p.current, i + 1);
            assert_eq!(p.total, 3);
        }
        let last = progress_events.last().unwrap();
        assert_eq!(last.converted + last.copied + last.failed, last.total);
        assert_eq!(outcome.summary.copied, 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_storage_and_produces_no_archive() {
        let converter = Arc::new(StallingConverter);
        let store = Arc::new(MemoryBlobStore::new());
        let mut config = test_config();
        config.stall_timeout = Duration::from_secs(3600);
        config.poll_interval = Duration::from_millis(10);
        let (orch, _rx) = BatchOrchestrator::new(converter, store.clone(), config);

        let cancel = orch.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let err = orch
            .run(items(&["a.docx", "b.pdf"]), "pdf", "out")
            .await
            .expect_err("cancelled batch should not complete");
        assert!(matches!(err, BatchError::Cancelled));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_input_validation() {
        let converter = Arc::new(FlakyConverter::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let (orch, _rx) = BatchOrchestrator::new(converter, store, test_config());

        assert!(matches!(
            orch.run(items(&["a.docx"]), "exe", "out").await,
            Err(BatchError::InvalidOutputFormat(_))
        ));
        assert!(matches!(
            orch.run(Vec::new(), "pdf", "out").await,
            Err(BatchError::NoInput)
        ));
        assert!(matches!(
            orch.run(items(&["a.zip", "b.bin"]), "pdf", "out").await,
            Err(BatchError::NoSupportedFiles)
        ));
    }
}
