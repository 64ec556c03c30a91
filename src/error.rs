//! Error types for the scans2pdf library.
//!
//! One enum covers the whole build because the output is a single PDF
//! container: a node that fails takes every dependent page with it, so there
//! is no partial-success surface to model. The variants fall into four
//! classes:
//!
//! * **Recipe rejection** ([`BuildError::InvalidRecipe`],
//!   [`BuildError::InvalidConfig`]) — reported before any external process
//!   runs.
//! * **External tool failures** ([`BuildError::ExternalToolMissing`],
//!   [`BuildError::ExternalToolFailed`], [`BuildError::BatchFailed`]) — the
//!   tool's identity, exit status, and captured diagnostics are preserved so
//!   the operator can re-run the command by hand.
//! * **Unsupported requests** ([`BuildError::UnsupportedOperation`]) — the
//!   recipe asked an artifact type for something it cannot produce.
//! * **Container/I-O faults** ([`BuildError::Pdf`], [`BuildError::Io`]).
//!
//! Node-level failures are not retried; a failed memoized computation is not
//! cached, so a later caller may attempt it again.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// All errors returned by the scans2pdf library.
#[derive(Debug, Error)]
pub enum BuildError {
    // ── Recipe errors ─────────────────────────────────────────────────────
    /// The recipe tree is structurally invalid or a field is out of range.
    #[error("Invalid recipe: {detail}")]
    InvalidRecipe { detail: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── External tool errors ──────────────────────────────────────────────
    /// An external program is not installed or not on PATH.
    #[error(
        "Program not found: '{program}'\n\
         Install it and make sure it is on PATH (ImageMagick provides \
         'convert', jbig2enc provides 'jbig2', qpdf provides 'qpdf')."
    )]
    ExternalToolMissing { program: String },

    /// An external program ran but exited with a non-zero status.
    #[error("Command '{program}' returned non-zero exit status {code}\n{stderr}")]
    ExternalToolFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// A batched symbol-dictionary encode failed; every member of the batch
    /// receives this same error.
    #[error("Symbol-dictionary batch failed: {detail}")]
    BatchFailed { detail: String },

    // ── Unsupported requests ──────────────────────────────────────────────
    /// The recipe requested something this artifact type cannot produce.
    #[error("Unsupported operation: {detail}")]
    UnsupportedOperation { detail: String },

    // ── Page context ──────────────────────────────────────────────────────
    /// A page could not be assembled. Wraps the node failure with the
    /// zero-based page index. Sibling pages run to completion; when several
    /// fail, the earliest page's error is the one reported.
    #[error("Page {page} failed: {source}")]
    PageFailed {
        page: usize,
        #[source]
        source: Box<BuildError>,
    },

    /// A failure observed through a shared cached computation. The underlying
    /// work ran once; every waiter receives the same error.
    #[error("{0}")]
    Shared(Arc<BuildError>),

    // ── Container / I-O errors ────────────────────────────────────────────
    /// Constructing or serializing the PDF object graph failed.
    #[error("PDF container error: {detail}")]
    Pdf { detail: String },

    /// Filesystem operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub(crate) fn invalid_recipe(detail: impl Into<String>) -> Self {
        BuildError::InvalidRecipe {
            detail: detail.into(),
        }
    }

    pub(crate) fn pdf(err: lopdf::Error) -> Self {
        BuildError::Pdf {
            detail: err.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    /// Unwrap a shared error when this caller is the only holder, otherwise
    /// keep the [`BuildError::Shared`] wrapper.
    pub(crate) fn shared(err: Arc<BuildError>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(err) => BuildError::Shared(err),
        }
    }
}
