//! Lazy preview scheduling.
//!
//! Renders only the pages the UI reports as visible, in the order they
//! became visible, without redundant renders. Admission is gated by the
//! visibility set and an optimistic claim set; draining is single-flight;
//! cancellation is soft: stale queue entries are skipped at dequeue time,
//! while an in-flight render is allowed to finish and its result kept
//! unless the document changed underneath it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::convert::{Converter, DocumentInfo, RenderedPage};

/// Default preview render width in pixels.
pub const DEFAULT_PREVIEW_WIDTH: u32 = 200;

/// Visibility and control signals consumed by the scheduler.
///
/// Modeled as plain messages so the admission and drain logic does not
/// assume any particular UI framework's event lifecycle.
#[derive(Debug, Clone)]
pub enum PreviewEvent {
    DocumentOpened { bytes: Bytes, source_ext: String },
    DocumentClosed,
    VisibilityGained(usize),
    VisibilityLost(usize),
    LoadAll,
}

struct OpenDocument {
    bytes: Bytes,
    source_ext: String,
    page_count: usize,
}

#[derive(Default)]
struct PreviewState {
    doc: Option<OpenDocument>,
    /// Bumped on every document switch; renders from an older generation
    /// are discarded at commit time.
    generation: u64,
    /// Pages currently on screen; authoritative for admission.
    visible: HashSet<usize>,
    /// Pages whose preview is cached or in flight (optimistic claim,
    /// rolled back when a render fails or a queued page is skipped).
    loaded: HashSet<usize>,
    /// FIFO admission order.
    queue: VecDeque<usize>,
    /// Single-flight guard for the drain loop.
    draining: bool,
    cache: HashMap<usize, RenderedPage>,
}

/// Visibility-driven page render scheduler for one open document.
pub struct PreviewScheduler<C> {
    renderer: Arc<C>,
    width: u32,
    state: Arc<Mutex<PreviewState>>,
}

impl<C> Clone for PreviewScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            renderer: self.renderer.clone(),
            width: self.width,
            state: self.state.clone(),
        }
    }
}

impl<C: Converter + 'static> PreviewScheduler<C> {
    pub fn new(renderer: Arc<C>) -> Self {
        Self::with_width(renderer, DEFAULT_PREVIEW_WIDTH)
    }

    pub fn with_width(renderer: Arc<C>, width: u32) -> Self {
        Self {
            renderer,
            width,
            state: Arc::new(Mutex::new(PreviewState::default())),
        }
    }

    /// Open a document for preview, resetting all per-document state.
    ///
    /// Fetches document info up front; a document that cannot be
    /// inspected is not opened.
    pub async fn open_document(&self, bytes: Bytes, source_ext: &str) -> anyhow::Result<DocumentInfo> {
        let info = self.renderer.document_info(bytes.clone(), source_ext).await?;

        let mut state = self.lock();
        state.generation += 1;
        state.doc = Some(OpenDocument {
            bytes,
            source_ext: source_ext.to_string(),
            page_count: info.page_count,
        });
        state.visible.clear();
        state.loaded.clear();
        state.queue.clear();
        state.cache.clear();
        tracing::debug!(pages = info.page_count, "Preview document opened");
        Ok(info)
    }

    /// Close the active document and drop its previews.
    pub fn close_document(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.doc = None;
        state.visible.clear();
        state.loaded.clear();
        state.queue.clear();
        state.cache.clear();
    }

    /// Admit a page that came on screen: claim, enqueue, trigger a drain.
    ///
    /// Signaling twice before the page renders enqueues it only once; the
    /// claim happens here, not at render completion, so a slow render
    /// cannot cause duplicate enqueues.
    pub fn visibility_gained(&self, page: usize) {
        let start_drain = {
            let mut state = self.lock();
            state.visible.insert(page);
            if state.doc.is_none() || state.loaded.contains(&page) {
                false
            } else {
                state.loaded.insert(page);
                if !state.queue.contains(&page) {
                    state.queue.push_back(page);
                }
                if state.draining {
                    false
                } else {
                    state.draining = true;
                    true
                }
            }
        };

        if start_drain {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.drain().await });
        }
    }

    /// Note that a page left the screen. Queued work for it is skipped at
    /// dequeue time; an in-flight render is not interrupted.
    pub fn visibility_lost(&self, page: usize) {
        self.lock().visible.remove(&page);
    }

    /// Cached preview for a page, if any.
    pub fn preview(&self, page: usize) -> Option<RenderedPage> {
        self.lock().cache.get(&page).cloned()
    }

    /// Sorted page indices with a cached preview.
    pub fn cached_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.lock().cache.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Render every page of the open document in page order, bypassing
    /// the visibility gate but skipping pages already cached or in flight.
    pub async fn load_all(&self) {
        let (bytes, source_ext, page_count, generation) = {
            let state = self.lock();
            let Some(doc) = state.doc.as_ref() else {
                return;
            };
            (
                doc.bytes.clone(),
                doc.source_ext.clone(),
                doc.page_count,
                state.generation,
            )
        };

        for page in 0..page_count {
            let claimed = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                if state.loaded.contains(&page) {
                    false
                } else {
                    state.loaded.insert(page);
                    true
                }
            };
            if !claimed {
                continue;
            }

            self.render_into_cache(page, bytes.clone(), &source_ext, generation)
                .await;
        }
    }

    /// Consume preview events until the channel closes or `cancel` fires.
    pub fn spawn_event_loop(
        self,
        mut events: mpsc::Receiver<PreviewEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::debug!("Preview scheduler cancelled");
                        break;
                    }

                    event = events.recv() => {
                        let Some(event) = event else {
                            tracing::debug!("Preview event channel closed");
                            break;
                        };
                        self.handle(event).await;
                    }
                }
            }
        })
    }

    async fn handle(&self, event: PreviewEvent) {
        match event {
            PreviewEvent::DocumentOpened { bytes, source_ext } => {
                if let Err(e) = self.open_document(bytes, &source_ext).await {
                    tracing::warn!(error = %e, "Failed to open document for preview");
                }
            }
            PreviewEvent::DocumentClosed => self.close_document(),
            PreviewEvent::VisibilityGained(page) => self.visibility_gained(page),
            PreviewEvent::VisibilityLost(page) => self.visibility_lost(page),
            PreviewEvent::LoadAll => self.load_all().await,
        }
    }

    /// Drain the queue until empty. Admission is re-checked at dequeue
    /// time; the `draining` flag clears under the same lock that observes
    /// the empty queue, so no admission can slip between the two.
    async fn drain(&self) {
        while let Some((page, bytes, source_ext, generation)) = self.next_admitted() {
            self.render_into_cache(page, bytes, &source_ext, generation)
                .await;
        }
    }

    /// Pop queue entries until one passes re-admission, collecting what
    /// the render needs. Returns `None` (and ends the drain) when the
    /// queue is exhausted.
    fn next_admitted(&self) -> Option<(usize, Bytes, String, u64)> {
        let mut state = self.lock();
        loop {
            let Some(page) = state.queue.pop_front() else {
                state.draining = false;
                return None;
            };
            if state.cache.contains_key(&page) {
                continue;
            }
            if !state.visible.contains(&page) {
                // Lost visibility while queued: un-claim so a later
                // visibility event can re-admit the page.
                state.loaded.remove(&page);
                tracing::trace!(page, "Skipping page that left the screen");
                continue;
            }
            let Some(doc) = state.doc.as_ref() else {
                state.loaded.remove(&page);
                continue;
            };
            return Some((
                page,
                doc.bytes.clone(),
                doc.source_ext.clone(),
                state.generation,
            ));
        }
    }

    /// Render one page and commit the result, unless the document changed
    /// while the render was in flight.
    async fn render_into_cache(&self, page: usize, bytes: Bytes, source_ext: &str, generation: u64) {
        match self
            .renderer
            .render_page(bytes, source_ext, page, self.width)
            .await
        {
            Ok(rendered) => {
                let mut state = self.lock();
                if state.generation == generation {
                    tracing::debug!(
                        page,
                        width = rendered.width,
                        height = rendered.height,
                        "Preview rendered"
                    );
                    state.cache.insert(page, rendered);
                } else {
                    tracing::debug!(page, "Discarding stale preview render");
                }
            }
            Err(e) => {
                tracing::warn!(page, error = %e, "Preview render failed");
                let mut state = self.lock();
                if state.generation == generation {
                    // Roll back the claim so a future visibility event retries.
                    state.loaded.remove(&page);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PreviewState> {
        // Guards are never held across an await; a poisoned lock only
        // means a render task panicked, so take the data as-is.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
