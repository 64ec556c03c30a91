//! # scans2pdf
//!
//! Build small, high-quality PDFs from scanned pages described by a JSON
//! recipe.
//!
//! ## Why this crate?
//!
//! Storing a scan as one raster per page forces a bad trade: compress the
//! whole page lossily and the text smears, compress it losslessly and the
//! file balloons. Mixed raster content splits each page instead — a lossy
//! continuous-tone background underneath bitonal foreground layers encoded
//! with JBIG2 or CCITT fax — so text stays crisp at a fraction of the size.
//! This crate takes a declarative per-page recipe, drives the standard tools
//! (ImageMagick, `jbig2enc`, `qpdf`) concurrently under a memory budget, and
//! assembles the layers, hidden OCR text, and link annotations into a single
//! tagged PDF.
//!
//! ## Pipeline Overview
//!
//! ```text
//! recipe (JSON)
//!  │
//!  ├─ 1. Validate  reject impossible recipes before any tool runs
//!  ├─ 2. Plan      intern identical conversions into one shared node graph
//!  ├─ 3. Convert   ImageMagick / jbig2enc jobs, scheduled by memory headroom
//!  ├─ 4. Harvest   lift the image XObjects out of each intermediate PDF
//!  ├─ 5. Assemble  pages, text layer, links, PDF/A scaffolding (lopdf)
//!  └─ 6. Finish    qpdf rewrite: object streams + optional linearization
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scans2pdf::{build_pdf, BuildOptions, NoopProgressCallback, Recipe};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let recipe = Recipe::from_json_slice(&std::fs::read("recipe.json")?)?;
//!     let options = BuildOptions::default();
//!     build_pdf(
//!         &recipe,
//!         "book.pdf".as_ref(),
//!         &options,
//!         Arc::new(NoopProgressCallback),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scans2pdf` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! scans2pdf = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing Compressions
//!
//! | Layer | Recipe value | Best for |
//! |-------|--------------|----------|
//! | background | `jpeg` | paper texture, photographs |
//! | background | `jp2`  | same, smaller, needs JPEG 2000 viewer support |
//! | background | `deflate` | exact pixels (screenshots, line scans) |
//! | foreground | `jbig2` at threshold 1 | text and line art, lossless, smallest |
//! | foreground | `jbig2` at threshold 0.4–0.9 | text when symbol unification is acceptable |
//! | foreground | `fax` | portability when no JBIG2 encoder is installed |
//!
//! A 300 dpi book page typically lands around **30–60 KiB** with a JPEG
//! background and a lossless JBIG2 text layer.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod build;
pub mod config;
pub mod error;
pub mod progress;
pub mod recipe;

mod exec;
mod graph;
mod jbig2;
mod magick;
mod pdf;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use build::build_pdf;
pub use config::{BuildOptions, BuildOptionsBuilder};
pub use error::BuildError;
pub use progress::{BuildProgressCallback, NoopProgressCallback, ProgressCallback};
pub use recipe::{
    ForegroundRecipe, ImageCompression, ImageRecipe, MaskCompression, PageRecipe, Recipe, Rgb,
    TextDirection, TextRecipe,
};
