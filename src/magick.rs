//! ImageMagick conversion stage.
//!
//! One node, one `convert` run: the source image goes in, a single-page PDF
//! comes out in a scratch directory, and the image XObject is lifted from it
//! ([`crate::pdf::harvest`]). ImageMagick picks the PDF filter chain, so
//! "compression" here is expressed purely as converter flags.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::BuildOptions;
use crate::error::BuildError;
use crate::exec::process::absolute_arg;
use crate::exec::CommandRunner;
use crate::graph::{MagickCompression, MagickParams};
use crate::pdf::harvest::harvest_image;
use crate::pdf::{ImageArtifact, PdfObjectBundle};

/// Argument vector for one conversion. Flag order matters to ImageMagick:
/// alpha handling first, then the stencil threshold, then the output
/// compression, then input and output paths (absolute, so the converter's
/// working directory is irrelevant).
fn convert_argv(
    command: &str,
    params: &MagickParams,
    output: &Path,
) -> Result<Vec<OsString>, BuildError> {
    let mut argv: Vec<OsString> = vec![command.into()];
    let lossy = matches!(
        params.compression,
        MagickCompression::Jp2 | MagickCompression::Jpeg
    );
    if params.image_mask || lossy {
        // Flatten transparency before thresholding or lossy encoding.
        argv.extend(["-alpha", "remove", "-alpha", "off"].map(OsString::from));
    }
    if params.image_mask {
        argv.extend(["-colorspace", "gray", "-threshold", "50%"].map(OsString::from));
    }
    match params.compression {
        MagickCompression::Auto => {}
        MagickCompression::Deflate => argv.extend(["-compress", "zip"].map(OsString::from)),
        MagickCompression::Fax => argv.extend(["-compress", "fax"].map(OsString::from)),
        MagickCompression::Jp2 => {
            argv.extend(["-compress", "jpeg2000"].map(OsString::from));
            argv.push("-quality".into());
            argv.push(params.quality.unwrap_or(100).to_string().into());
        }
        MagickCompression::Jpeg => {
            argv.extend(["-compress", "jpeg"].map(OsString::from));
            argv.push("-quality".into());
            argv.push(params.quality.unwrap_or(100).to_string().into());
        }
    }
    argv.push(absolute_arg(&params.path)?);
    argv.push(absolute_arg(output)?);
    Ok(argv)
}

/// The conversion jbig2 members run before encoding: flatten, grayscale,
/// threshold to bitonal, write PNG.
pub(crate) fn bitonal_png_argv(
    command: &str,
    input: &Path,
    output: &Path,
) -> Result<Vec<OsString>, BuildError> {
    convert_argv(
        command,
        &MagickParams {
            path: input.to_path_buf(),
            compression: MagickCompression::Auto,
            quality: None,
            image_mask: true,
            mask: None,
        },
        output,
    )
}

/// Convert one image node and harvest its XObject.
///
/// `mask` resolves the node's stencil, when it has one; it runs concurrently
/// with the converter, matching the widest point of the pipeline.
pub(crate) async fn convert_image<F>(
    runner: &CommandRunner,
    options: &BuildOptions,
    params: &MagickParams,
    mask: F,
) -> Result<ImageArtifact, BuildError>
where
    F: Future<Output = Result<Option<Arc<PdfObjectBundle>>, BuildError>>,
{
    let scratch = options.scratch_tempdir()?;
    let output = scratch.path().join("image.pdf");
    let argv = convert_argv(&options.convert_command, params, &output)?;
    debug!(input = %params.path.display(), "converting image");
    let (_, mask) = tokio::try_join!(runner.run(&argv, None), mask)?;
    harvest_image(&output, params.image_mask, mask.as_ref())
}
