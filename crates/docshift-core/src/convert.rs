//! Contract for the document conversion engine.
//!
//! Format rendering is a black box behind the [`Converter`] trait. A single
//! engine instance is shared by everything that converts or renders, which
//! is why the batch orchestrator serializes its calls (see `batch`).

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// Progress event emitted by the engine during a conversion.
///
/// `percent` is monotonically non-decreasing within one conversion. The
/// absence of a new event for longer than the configured stall timeout is
/// the sole stall signal.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertProgress {
    pub phase: String,
    pub percent: u8,
    pub message: String,
}

/// Receives progress events from an in-flight conversion.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, event: ConvertProgress);
}

/// Sink for callers that do not track progress.
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn progress(&self, _event: ConvertProgress) {}
}

/// Summary returned by document inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub document_type: String,
    pub page_count: usize,
}

/// A rasterized page preview.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// The document conversion engine.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert a document between formats, reporting progress to `sink`.
    async fn convert(
        &self,
        input: Bytes,
        from: &str,
        to: &str,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<Bytes>;

    /// Inspect a document without converting it.
    async fn document_info(&self, input: Bytes, from: &str) -> anyhow::Result<DocumentInfo>;

    /// Rasterize a single page, scaled to `target_width` pixels.
    async fn render_page(
        &self,
        input: Bytes,
        from: &str,
        page: usize,
        target_width: u32,
    ) -> anyhow::Result<RenderedPage>;
}
