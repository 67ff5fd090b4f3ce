//! Batch tuning knobs and format support tables.

use std::time::Duration;

/// File extensions the conversion engine accepts as input.
pub const SUPPORTED_INPUT_FORMATS: &[&str] = &[
    "docx", "doc", "xlsx", "xls", "pptx", "ppt", "odt", "ods", "odp", "rtf", "txt", "csv", "html",
    "htm", "pdf", "png", "jpg", "jpeg", "svg",
];

/// Formats the conversion engine can produce.
pub const OUTPUT_FORMATS: &[&str] = &[
    "pdf", "docx", "odt", "rtf", "txt", "html", "xlsx", "ods", "csv", "pptx", "odp", "png", "svg",
];

/// Check whether a source extension is accepted for conversion.
pub fn is_supported_input(ext: &str) -> bool {
    SUPPORTED_INPUT_FORMATS.contains(&ext)
}

/// Check whether a target format is a valid conversion output.
pub fn is_valid_output(format: &str) -> bool {
    OUTPUT_FORMATS.contains(&format)
}

/// Configuration for a batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Retries per task after the first failed attempt.
    pub max_retries: u32,
    /// A conversion with no progress event for this long is aborted.
    pub stall_timeout: Duration,
    /// How often the stall watchdog checks the last-progress timestamp.
    pub poll_interval: Duration,
    /// Fixed wait between failed attempts.
    pub retry_backoff: Duration,
    /// Maximum total member size per output archive.
    pub archive_ceiling: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            stall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
            archive_ceiling: 250 * 1024 * 1024,
        }
    }
}
