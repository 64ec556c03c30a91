//! Build orchestration: from validated recipe to finished file.
//!
//! ## Why two phases
//!
//! Everything expensive — ImageMagick runs, jbig2 batches, content
//! rendering — happens in the first, fully concurrent phase, throttled only
//! by the job scheduler. The second phase is sequential on purpose: bundles
//! are imported into the output document in page order, so object numbering
//! (and with it the staged file, minus the random document ID) depends on
//! nothing but the recipe. Pages share image work through the node graph,
//! so a failure in one page can surface in several; each one reports it
//! wrapped with its own page index, and the first page in document order
//! wins.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use tracing::{debug, info};

use crate::config::BuildOptions;
use crate::error::BuildError;
use crate::exec::{CommandRunner, JobScheduler};
use crate::graph::{BuildGraph, BuildNode, NodeId, PageNode};
use crate::jbig2::Jbig2Coordinator;
use crate::magick::convert_image;
use crate::pdf::assemble::{
    assemble_document, finish_page, write_document, BuiltPage, ResolvedLayer, ResolvedPage,
};
use crate::pdf::{ImageArtifact, PdfObjectBundle};
use crate::progress::ProgressCallback;
use crate::recipe::Recipe;

/// Shared state of one build run.
struct BuildContext {
    graph: BuildGraph,
    runner: CommandRunner,
    options: BuildOptions,
    coordinator: Jbig2Coordinator,
}

impl BuildContext {
    /// Resolve one image node to its artifact, paying for the conversion at
    /// most once per node.
    ///
    /// Boxed because masked images recurse: resolving the image resolves
    /// its stencil concurrently with the converter run.
    fn node_artifact(&self, id: NodeId) -> BoxFuture<'_, Result<ImageArtifact, BuildError>> {
        async move {
            match self.graph.node(id) {
                BuildNode::Magick { params, cache } => {
                    cache
                        .get(|| {
                            convert_image(&self.runner, &self.options, params, async {
                                match params.mask {
                                    Some(mask) => self
                                        .node_artifact(mask)
                                        .await
                                        .map(|artifact| Some(artifact.image)),
                                    None => Ok(None),
                                }
                            })
                        })
                        .await
                }
                BuildNode::Jbig2 { params } => {
                    let image = self
                        .coordinator
                        .encode(&self.graph, id, params, &self.runner, &self.options)
                        .await?;
                    Ok(ImageArtifact {
                        image,
                        thumbnail: None,
                    })
                }
            }
        }
        .boxed()
    }

    async fn thumbnail_artifact(&self, id: NodeId) -> Result<Arc<PdfObjectBundle>, BuildError> {
        self.node_artifact(id)
            .await?
            .thumbnail
            .ok_or_else(|| BuildError::UnsupportedOperation {
                detail: "thumbnails not supported for image type".into(),
            })
    }

    /// Resolve every image the page references, concurrently.
    async fn resolve_page(&self, page: &PageNode) -> Result<ResolvedPage, BuildError> {
        let thumbnail = async {
            match page.thumbnail {
                Some(id) => self.thumbnail_artifact(id).await.map(Some),
                None => Ok(None),
            }
        };
        let background = async {
            match page.background {
                Some(id) => self
                    .node_artifact(id)
                    .await
                    .map(|artifact| Some(artifact.image)),
                None => Ok(None),
            }
        };
        let foreground = try_join_all(page.foreground.iter().map(|layer| async move {
            let image = self.node_artifact(layer.image);
            let mask = async {
                match layer.color {
                    // A tinted stencil draws itself; only masked images
                    // register the stencil in a slot of its own.
                    Some(_) => Ok(None),
                    None => self
                        .node_artifact(layer.mask)
                        .await
                        .map(|artifact| Some(artifact.image)),
                }
            };
            let (image, mask) = tokio::try_join!(image, mask)?;
            Ok::<_, BuildError>(ResolvedLayer {
                mask,
                image: image.image,
                color: layer.color,
            })
        }));
        let (thumbnail, background, foreground) =
            tokio::try_join!(thumbnail, background, foreground)?;
        Ok(ResolvedPage {
            width: page.width,
            height: page.height,
            color: page.color,
            thumbnail,
            background,
            foreground,
            text: page.text.clone(),
        })
    }
}

/// Build `recipe` into a finished PDF at `out_path`.
///
/// Validates the recipe, converts and encodes every referenced image,
/// assembles the document, and hands it to qpdf for the final rewrite.
/// `progress` receives one event per finished page; pass
/// [`crate::NoopProgressCallback`] when nobody is watching.
pub async fn build_pdf(
    recipe: &Recipe,
    out_path: &Path,
    options: &BuildOptions,
    progress: ProgressCallback,
) -> Result<(), BuildError> {
    recipe.validate()?;
    let context = BuildContext {
        graph: BuildGraph::from_recipe(recipe),
        runner: CommandRunner::new(JobScheduler::new(
            options.parallel_jobs,
            options.job_memory,
            options.reserved_memory,
        )),
        options: options.clone(),
        coordinator: Jbig2Coordinator::new(),
    };

    let total = context.graph.pages.len();
    info!(pages = total, outfile = %out_path.display(), "building document");
    progress.on_build_start(total);

    let finished = AtomicUsize::new(0);
    let page_results = join_all(context.graph.pages.iter().enumerate().map(|(index, page)| {
        let context = &context;
        let finished = &finished;
        let progress = &progress;
        async move {
            let resolved =
                context
                    .resolve_page(page)
                    .await
                    .map_err(|source| BuildError::PageFailed {
                        page: index,
                        source: Box::new(source),
                    })?;
            let built = finish_page(resolved);
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(page = index, done, total, "page content built");
            progress.on_page_built(done, total);
            Ok::<BuiltPage, BuildError>(built)
        }
    }))
    .await;

    // Every page ran to completion; the first failure in page order wins.
    let mut pages = Vec::with_capacity(total);
    for result in page_results {
        pages.push(result?);
    }

    let document = assemble_document(&pages, options);
    write_document(document, out_path, options, &context.runner).await?;
    progress.on_build_complete(total);
    info!(outfile = %out_path.display(), "build complete");
    Ok(())
}
