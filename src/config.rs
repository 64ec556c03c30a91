//! Configuration types for a PDF build.
//!
//! All build behaviour is controlled through [`BuildOptions`], built via its
//! [`BuildOptionsBuilder`]. Keeping every knob in one struct makes it trivial
//! to share options across tasks, log them once at startup, and diff two runs
//! to understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A ten-field constructor is unreadable and breaks on every new field. The
//! builder lets callers set only what they care about and rely on documented
//! defaults for the rest.

use crate::error::BuildError;
use std::path::{Path, PathBuf};

/// Default per-job memory budget: 1 GiB.
///
/// ImageMagick easily climbs to several hundred MB on a 600-DPI A4 scan;
/// one gibibyte is a safe envelope that still admits several jobs on a
/// typical desktop.
pub const DEFAULT_JOB_MEMORY: u64 = 1 << 30;

/// Default reserved-memory floor: 1 GiB kept free for the rest of the system.
pub const DEFAULT_RESERVED_MEMORY: u64 = 1 << 30;

/// Options for building a PDF from a recipe.
///
/// Built via [`BuildOptions::builder()`] or [`BuildOptions::default()`].
///
/// # Example
/// ```rust
/// use scans2pdf::BuildOptions;
///
/// let options = BuildOptions::builder()
///     .parallel_jobs(4)
///     .linearize(false)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Maximum number of concurrent external jobs. Default: logical CPU count.
    ///
    /// This is the scheduler's slot count `N`. The effective concurrency is
    /// usually lower: admission also requires memory headroom for each job
    /// (see `job_memory` / `reserved_memory`).
    pub parallel_jobs: usize,

    /// Memory budget `M` assumed per external job, in bytes. Default: 1 GiB.
    ///
    /// Admission control charges each running job `min(M, actual RSS)`, so
    /// many small jobs can run concurrently while a genuinely heavy job
    /// still throttles its neighbours.
    pub job_memory: u64,

    /// Memory floor `R` kept free for the rest of the system, in bytes.
    /// Default: 1 GiB.
    ///
    /// When free memory falls toward this floor the scheduler stops admitting
    /// jobs — except that one job is always admitted when none is running, so
    /// the build makes forward progress under pressure instead of
    /// deadlocking.
    pub reserved_memory: u64,

    /// ImageMagick convert command. Default: `"convert"`.
    pub convert_command: String,

    /// jbig2enc encoder command. Default: `"jbig2"`.
    pub jbig2_command: String,

    /// qpdf command used for final normalization. Default: `"qpdf"`.
    pub qpdf_command: String,

    /// Run `qpdf --linearize` on the finished document. Default: true.
    pub linearize: bool,

    /// Deflate-compress page content streams. Default: true.
    ///
    /// Turning this off makes content streams human-readable, which is handy
    /// when debugging operator output.
    pub compress_page_streams: bool,

    /// Share one JBIG2 symbol dictionary across all masks with equal
    /// settings. Default: true.
    ///
    /// Sharing batches every same-threshold mask into a single `jbig2`
    /// invocation and stores the dictionary once. Viewers older than
    /// Poppler 0.37 render shared dictionaries incorrectly; set this to
    /// false to fall back to one singleton encode per mask.
    pub shared_symbol_dictionaries: bool,

    /// Scratch directory for intermediate artifacts. Default: none, meaning
    /// the large-file temp location (`/var/tmp` when usable, else the system
    /// temp dir).
    ///
    /// Conversion intermediates for a book-length scan can reach several
    /// gigabytes; `/tmp` is a size-limited tmpfs on many systems.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            parallel_jobs: num_cpus::get().max(1),
            job_memory: DEFAULT_JOB_MEMORY,
            reserved_memory: DEFAULT_RESERVED_MEMORY,
            convert_command: "convert".to_string(),
            jbig2_command: "jbig2".to_string(),
            qpdf_command: "qpdf".to_string(),
            linearize: true,
            compress_page_streams: true,
            shared_symbol_dictionaries: true,
            scratch_dir: None,
        }
    }
}

impl BuildOptions {
    /// Create a new builder for `BuildOptions`.
    pub fn builder() -> BuildOptionsBuilder {
        BuildOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Directory that intermediate artifacts should live in.
    pub(crate) fn effective_scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(large_temp_dir)
    }

    /// Create a scratch directory for one job's intermediates. The directory
    /// is removed when the returned guard drops.
    pub(crate) fn scratch_tempdir(&self) -> Result<tempfile::TempDir, BuildError> {
        let base = self.effective_scratch_dir();
        tempfile::Builder::new()
            .prefix("scans2pdf-")
            .tempdir_in(&base)
            .map_err(|err| BuildError::io(base, err))
    }
}

/// Builder for [`BuildOptions`].
#[derive(Debug)]
pub struct BuildOptionsBuilder {
    options: BuildOptions,
}

impl BuildOptionsBuilder {
    pub fn parallel_jobs(mut self, n: usize) -> Self {
        self.options.parallel_jobs = n.max(1);
        self
    }

    pub fn job_memory(mut self, bytes: u64) -> Self {
        self.options.job_memory = bytes;
        self
    }

    pub fn reserved_memory(mut self, bytes: u64) -> Self {
        self.options.reserved_memory = bytes;
        self
    }

    pub fn convert_command(mut self, cmd: impl Into<String>) -> Self {
        self.options.convert_command = cmd.into();
        self
    }

    pub fn jbig2_command(mut self, cmd: impl Into<String>) -> Self {
        self.options.jbig2_command = cmd.into();
        self
    }

    pub fn qpdf_command(mut self, cmd: impl Into<String>) -> Self {
        self.options.qpdf_command = cmd.into();
        self
    }

    pub fn linearize(mut self, v: bool) -> Self {
        self.options.linearize = v;
        self
    }

    pub fn compress_page_streams(mut self, v: bool) -> Self {
        self.options.compress_page_streams = v;
        self
    }

    pub fn shared_symbol_dictionaries(mut self, v: bool) -> Self {
        self.options.shared_symbol_dictionaries = v;
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.scratch_dir = Some(dir.into());
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<BuildOptions, BuildError> {
        let o = &self.options;
        if o.parallel_jobs == 0 {
            return Err(BuildError::InvalidConfig(
                "parallel_jobs must be ≥ 1".into(),
            ));
        }
        if o.job_memory == 0 {
            return Err(BuildError::InvalidConfig(
                "job_memory must be non-zero".into(),
            ));
        }
        for (name, cmd) in [
            ("convert_command", &o.convert_command),
            ("jbig2_command", &o.jbig2_command),
            ("qpdf_command", &o.qpdf_command),
        ] {
            if cmd.trim().is_empty() {
                return Err(BuildError::InvalidConfig(format!(
                    "{name} must not be empty"
                )));
            }
        }
        Ok(self.options)
    }
}

/// Pick a temp location that can hold multi-gigabyte intermediates.
///
/// Prefers `/var/tmp` over a tmpfs-backed `/tmp` when it is writable; the
/// probe is a throwaway temp file, the cheapest reliable writability check.
pub(crate) fn large_temp_dir() -> PathBuf {
    let system_tmp = std::env::temp_dir();
    if system_tmp == Path::new("/tmp") {
        let var_tmp = Path::new("/var/tmp");
        if tempfile::tempfile_in(var_tmp).is_ok() {
            return var_tmp.to_path_buf();
        }
    }
    system_tmp
}
