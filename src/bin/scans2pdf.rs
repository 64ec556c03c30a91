//! CLI binary for scans2pdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `BuildOptions`, feeds the recipe in, and reports build progress.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use scans2pdf::{
    build_pdf, BuildOptions, BuildProgressCallback, NoopProgressCallback, ProgressCallback, Recipe,
};
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Progress callbacks ───────────────────────────────────────────────────────

/// Terminal progress callback: one live progress bar anchored at the bottom
/// of the terminal, advanced in completion order as pages finish.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Create a callback whose progress-bar length is set by
    /// `on_build_start` (called before any pages are processed).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_build_start

        // Initial style: spinner only (no counter until we know the total).
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading recipe…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }

    /// Clear the bar without printing a completion line. Used on failure so
    /// the error message is the last thing on the terminal.
    fn abandon(&self) {
        self.bar.finish_and_clear();
    }
}

impl BuildProgressCallback for BarProgress {
    fn on_build_start(&self, total_pages: usize) {
        // Switch from spinner-only style to full progress bar now that we
        // know the actual page count.
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Building");
        self.bar.reset_eta();
    }

    fn on_page_built(&self, finished_pages: usize, _total_pages: usize) {
        self.bar.set_position(finished_pages as u64);
    }

    fn on_build_complete(&self, _total_pages: usize) {
        self.bar.finish_and_clear();
    }
}

/// Machine-readable progress: one `{"fraction": f}` JSON line per event on
/// stdout, flushed immediately so a supervising process sees it live.
struct JsonProgress;

impl JsonProgress {
    fn emit(fraction: f64) {
        let line = serde_json::json!({ "fraction": fraction });
        let mut stdout = io::stdout().lock();
        // A consumer that closed the pipe must not kill the build.
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl BuildProgressCallback for JsonProgress {
    fn on_build_start(&self, _total_pages: usize) {
        Self::emit(0.0);
    }

    fn on_page_built(&self, finished_pages: usize, total_pages: usize) {
        Self::emit(finished_pages as f64 / total_pages as f64);
    }

    fn on_build_complete(&self, _total_pages: usize) {
        Self::emit(1.0);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Build a PDF from a recipe on stdin
  scans2pdf book.pdf < recipe.json

  # Read the recipe from a file, verbose logs
  scans2pdf --recipe recipe.json -v book.pdf

  # More jobs, bigger scratch space
  scans2pdf -j 8 --scratch-dir /mnt/big/tmp book.pdf < recipe.json

  # Uncompressed page streams for inspecting content operators
  scans2pdf --raw-page-streams --no-linearize debug.pdf < recipe.json

RECIPE FORMAT:
  The recipe is a JSON document with one object per page: the page size in
  PostScript points, an optional continuous-tone background, any number of
  bitonal foreground layers (JBIG2 or CCITT fax), an optional thumbnail,
  and invisible OCR words with optional link targets.

  {"pages": [{
    "width": 595, "height": 842,
    "background": {"filename": "p1-bg.jpg", "compression": "jpeg", "quality": 50},
    "foreground": [{"filename": "p1-fg.png", "compression": "jbig2"}],
    "text": [{"x": 72, "y": 720, "width": 120, "height": 14, "text": "Chapter 1"}]
  }]}

EXTERNAL TOOLS:
  convert   ImageMagick — raster conversion and CCITT group 4 encoding
  jbig2     jbig2enc — JBIG2 symbol coding (only when a recipe asks for it)
  qpdf      final object-stream packing and optional linearization

PROGRESS OUTPUT:
  On a terminal, a progress bar is drawn on stderr. When stdout is a pipe
  (or with --json-progress), one {"fraction": f} JSON line per finished
  page is written to stdout instead, for supervising processes.

EXIT STATUS:
  0 on success; 1 when the recipe is invalid or any external tool fails.
"#;

/// Build a PDF from scanned page layers described by a JSON recipe.
#[derive(Parser, Debug)]
#[command(
    name = "scans2pdf",
    version,
    about = "Build a small, high-quality PDF from scanned pages described by a JSON recipe",
    long_about = "Build a PDF from scanned pages described by a JSON recipe. Each page combines \
a lossy continuous-tone background with bitonal JBIG2/fax foreground layers and an invisible \
OCR text layer, producing compact files with crisp text. External conversions run concurrently \
under a memory budget.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Path of the PDF to write.
    #[arg(value_name = "OUTFILE")]
    outfile: PathBuf,

    /// Read the recipe from this file instead of stdin.
    #[arg(short, long, env = "SCANS2PDF_RECIPE")]
    recipe: Option<PathBuf>,

    /// Maximum number of concurrent external jobs.
    #[arg(
        short,
        long,
        env = "SCANS2PDF_JOBS",
        long_help = "Maximum number of concurrent external jobs. Default: logical CPU count.\n\
          The effective concurrency is usually lower: each job is also charged a memory\n\
          budget against free system memory (see --job-memory / --reserved-memory)."
    )]
    jobs: Option<usize>,

    /// Memory budget assumed per external job, in bytes.
    #[arg(long, env = "SCANS2PDF_JOB_MEMORY", value_name = "BYTES")]
    job_memory: Option<u64>,

    /// Memory kept free for the rest of the system, in bytes.
    #[arg(long, env = "SCANS2PDF_RESERVED_MEMORY", value_name = "BYTES")]
    reserved_memory: Option<u64>,

    /// ImageMagick convert command.
    #[arg(long, env = "SCANS2PDF_CONVERT", value_name = "CMD")]
    convert_command: Option<String>,

    /// jbig2enc command.
    #[arg(long, env = "SCANS2PDF_JBIG2", value_name = "CMD")]
    jbig2_command: Option<String>,

    /// qpdf command.
    #[arg(long, env = "SCANS2PDF_QPDF", value_name = "CMD")]
    qpdf_command: Option<String>,

    /// Directory for intermediate artifacts (several GiB for book scans).
    #[arg(long, env = "SCANS2PDF_SCRATCH_DIR", value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    /// Skip the final linearization ("fast web view") pass.
    #[arg(long, env = "SCANS2PDF_NO_LINEARIZE")]
    no_linearize: bool,

    /// Store page content streams uncompressed (debugging aid).
    #[arg(long)]
    raw_page_streams: bool,

    /// Encode every JBIG2 mask on its own instead of sharing one symbol
    /// dictionary per settings group (for viewers older than Poppler 0.37).
    #[arg(long, env = "SCANS2PDF_NO_SHARED_DICTIONARIES")]
    no_shared_dictionaries: bool,

    /// Force {"fraction": f} JSON progress lines on stdout.
    #[arg(long, env = "SCANS2PDF_JSON_PROGRESS")]
    json_progress: bool,

    /// Disable all progress output.
    #[arg(long, env = "SCANS2PDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs (includes every external command).
    #[arg(short, long, env = "SCANS2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SCANS2PDF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ── Progress mode ────────────────────────────────────────────────────
    // A terminal gets the bar; a pipe gets machine-readable fraction lines
    // so a supervising process can track the build.
    let json_progress =
        !cli.no_progress && (cli.json_progress || !io::stdout().is_terminal());
    let show_bar = !cli.no_progress && !json_progress && !cli.quiet;

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_bar {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let bar = if show_bar {
        Some(BarProgress::new_dynamic())
    } else {
        None
    };
    let progress: ProgressCallback = match &bar {
        Some(bar) => bar.clone(),
        None if json_progress => Arc::new(JsonProgress),
        None => Arc::new(NoopProgressCallback),
    };

    if let Err(err) = run(&cli, progress).await {
        if let Some(bar) = &bar {
            bar.abandon();
        }
        tracing::debug!("{err:?}");
        tracing::error!("Operation failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, progress: ProgressCallback) -> Result<()> {
    let started = Instant::now();

    let recipe_bytes = match &cli.recipe {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read recipe from {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read recipe from stdin")?;
            buf
        }
    };
    let recipe = Recipe::from_json_slice(&recipe_bytes).context("Invalid recipe")?;
    let total_pages = recipe.pages.len();

    let options = build_options(cli)?;

    build_pdf(&recipe, &cli.outfile, &options, progress)
        .await
        .with_context(|| format!("Failed to build {}", cli.outfile.display()))?;

    // Summary line (the bar has already been cleared by the callback).
    if !cli.quiet {
        let size = std::fs::metadata(&cli.outfile)
            .map(|meta| HumanBytes(meta.len()).to_string())
            .unwrap_or_else(|_| "?".into());
        eprintln!(
            "{} {} pages  {}  {}s  →  {}",
            green("✔"),
            bold(&total_pages.to_string()),
            dim(&size),
            dim(&format!("{:.1}", started.elapsed().as_secs_f64())),
            bold(&cli.outfile.display().to_string()),
        );
    }

    Ok(())
}

/// Map CLI args to `BuildOptions`.
fn build_options(cli: &Cli) -> Result<BuildOptions> {
    let mut builder = BuildOptions::builder()
        .linearize(!cli.no_linearize)
        .compress_page_streams(!cli.raw_page_streams)
        .shared_symbol_dictionaries(!cli.no_shared_dictionaries);

    if let Some(jobs) = cli.jobs {
        builder = builder.parallel_jobs(jobs);
    }
    if let Some(bytes) = cli.job_memory {
        builder = builder.job_memory(bytes);
    }
    if let Some(bytes) = cli.reserved_memory {
        builder = builder.reserved_memory(bytes);
    }
    if let Some(cmd) = &cli.convert_command {
        builder = builder.convert_command(cmd.as_str());
    }
    if let Some(cmd) = &cli.jbig2_command {
        builder = builder.jbig2_command(cmd.as_str());
    }
    if let Some(cmd) = &cli.qpdf_command {
        builder = builder.qpdf_command(cmd.as_str());
    }
    if let Some(dir) = &cli.scratch_dir {
        builder = builder.scratch_dir(dir);
    }

    builder.build().context("Invalid configuration")
}
