//! Progress-callback trait for per-page build events.
//!
//! Pass an [`Arc<dyn BuildProgressCallback>`] to
//! [`crate::build_pdf`] to receive real-time events as the pipeline
//! finishes each page.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a terminal progress bar, or a
//! line-oriented status stream — without the library knowing anything about
//! how the host application communicates. The trait is `Send + Sync` so one
//! callback can observe pages that finish concurrently.
//!
//! # Example
//!
//! ```rust
//! use scans2pdf::BuildProgressCallback;
//! use std::sync::Arc;
//!
//! struct StderrProgress;
//!
//! impl BuildProgressCallback for StderrProgress {
//!     fn on_page_built(&self, finished_pages: usize, total_pages: usize) {
//!         eprintln!("{finished_pages}/{total_pages} pages built");
//!     }
//! }
//!
//! let progress: Arc<dyn BuildProgressCallback> = Arc::new(StderrProgress);
//! progress.on_page_built(1, 4);
//! ```

use std::sync::Arc;

/// Called by the build pipeline as it completes each page.
///
/// Implementations must be `Send + Sync` (pages are built concurrently).
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Ordering
///
/// `on_page_built` fires once per page, in completion order rather than
/// document order, with `finished_pages` strictly increasing across a build.
/// The reported fraction `finished_pages / total_pages` is therefore
/// monotone and reaches `1.0` exactly once.
pub trait BuildProgressCallback: Send + Sync {
    /// Called once before any page work starts.
    ///
    /// # Arguments
    /// * `total_pages` — number of pages that will be built
    fn on_build_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page's content has been fully assembled: every image
    /// it references is encoded and its content stream is rendered.
    ///
    /// # Arguments
    /// * `finished_pages` — pages completed so far, counting this one
    /// * `total_pages`    — total pages in the document
    fn on_page_built(&self, finished_pages: usize, total_pages: usize) {
        let _ = (finished_pages, total_pages);
    }

    /// Called once when the finished document has been written and
    /// post-processed.
    ///
    /// # Arguments
    /// * `total_pages` — total pages in the document
    fn on_build_complete(&self, total_pages: usize) {
        let _ = total_pages;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BuildProgressCallback for NoopProgressCallback {}

/// Convenience alias for the callback handle [`crate::build_pdf`] takes.
pub type ProgressCallback = Arc<dyn BuildProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        started_total: Arc<AtomicUsize>,
        built: Arc<AtomicUsize>,
        completed_total: Arc<AtomicUsize>,
    }

    impl BuildProgressCallback for TrackingCallback {
        fn on_build_start(&self, total_pages: usize) {
            self.started_total.store(total_pages, Ordering::SeqCst);
        }

        fn on_page_built(&self, _finished_pages: usize, _total_pages: usize) {
            self.built.fetch_add(1, Ordering::SeqCst);
        }

        fn on_build_complete(&self, total_pages: usize) {
            self.completed_total.store(total_pages, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_build_start(5);
        cb.on_page_built(1, 5);
        cb.on_build_complete(5);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            started_total: Arc::new(AtomicUsize::new(0)),
            built: Arc::new(AtomicUsize::new(0)),
            completed_total: Arc::new(AtomicUsize::new(0)),
        };

        tracker.on_build_start(3);
        assert_eq!(tracker.started_total.load(Ordering::SeqCst), 3);

        tracker.on_page_built(1, 3);
        tracker.on_page_built(2, 3);
        tracker.on_page_built(3, 3);
        assert_eq!(tracker.built.load(Ordering::SeqCst), 3);

        tracker.on_build_complete(3);
        assert_eq!(tracker.completed_total.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_build_start(10);
        cb.on_page_built(1, 10);
        cb.on_build_complete(10);
    }
}
