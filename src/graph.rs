//! Build-node graph and canonicalization.
//!
//! ## Why canonicalize?
//!
//! Two pages that reference the same scan with the same compression settings
//! describe the *same* conversion job. The graph therefore interns every
//! image node: structurally equal parameters map to one [`NodeId`], and that
//! node carries the one memoization slot every consumer shares. Deduplication
//! happens while the recipe is walked, before any work starts, so the
//! execution layer never has to ask "has someone else already started this?".
//!
//! Nodes live in an arena and refer to each other by index. Dependencies are
//! interned before their dependents (a masked image is created after its
//! mask), which keeps equality well-defined and the graph free of cycles.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

use crate::exec::AsyncCache;
use crate::pdf::ImageArtifact;
use crate::recipe::{
    ForegroundRecipe, ImageCompression, ImageRecipe, MaskCompression, PageRecipe, Recipe, Rgb,
    TextRecipe,
};

/// Handle to a canonical image node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// Compression modes handled by the ImageMagick pipeline. Bitonal symbol
/// coding is the one mode ImageMagick cannot produce; those nodes go through
/// the jbig2 coordinator instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum MagickCompression {
    Auto,
    Deflate,
    Fax,
    Jp2,
    Jpeg,
}

impl From<ImageCompression> for MagickCompression {
    fn from(compression: ImageCompression) -> MagickCompression {
        match compression {
            ImageCompression::Auto => MagickCompression::Auto,
            ImageCompression::Deflate => MagickCompression::Deflate,
            ImageCompression::Jp2 => MagickCompression::Jp2,
            ImageCompression::Jpeg => MagickCompression::Jpeg,
        }
    }
}

/// Parameters of an ImageMagick-converted image.
///
/// `quality` is normalized: `Some` only for the lossy modes (defaulted to
/// 100), `None` otherwise, so a stray quality value on a lossless layer does
/// not split an equality class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MagickParams {
    pub path: PathBuf,
    pub compression: MagickCompression,
    pub quality: Option<u8>,
    /// Render as a bitonal stencil mask.
    pub image_mask: bool,
    /// Stencil mask clipping this image, if any.
    pub mask: Option<NodeId>,
}

/// Parameters of a jbig2-encoded stencil mask.
///
/// The threshold is kept as raw bits so the key is hashable; recipe
/// validation guarantees the value is a normal positive number, for which
/// bit equality and value equality coincide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Jbig2Params {
    pub path: PathBuf,
    threshold_bits: u64,
}

impl Jbig2Params {
    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits)
    }

    /// Lossless generic coding; no symbol dictionary is built.
    pub fn is_lossless(&self) -> bool {
        self.threshold() == 1.0
    }

    /// Nodes with equal batch keys may share one symbol dictionary.
    pub fn batch_key(&self) -> u64 {
        self.threshold_bits
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum NodeParams {
    Magick(MagickParams),
    Jbig2(Jbig2Params),
}

/// One canonical image node: its parameters plus the shared result slot.
pub(crate) enum BuildNode {
    Magick {
        params: MagickParams,
        cache: AsyncCache<ImageArtifact>,
    },
    /// Memoization for jbig2 nodes lives in the coordinator's claim table,
    /// which must observe whole batches at once.
    Jbig2 { params: Jbig2Params },
}

/// A foreground layer resolved to canonical nodes. When the layer paints a
/// flat tint, `image` and `mask` are the same node.
#[derive(Debug, Clone)]
pub(crate) struct ForegroundLayer {
    pub mask: NodeId,
    pub image: NodeId,
    pub color: Option<Rgb>,
}

/// One page with its layers resolved to canonical nodes.
pub(crate) struct PageNode {
    pub width: f64,
    pub height: f64,
    pub thumbnail: Option<NodeId>,
    pub background: Option<NodeId>,
    pub foreground: Vec<ForegroundLayer>,
    pub color: Rgb,
    pub text: Vec<TextRecipe>,
}

/// The canonicalized build graph for one run.
pub(crate) struct BuildGraph {
    nodes: Vec<BuildNode>,
    index: HashMap<NodeParams, NodeId>,
    pub pages: Vec<PageNode>,
}

impl BuildGraph {
    /// Intern every image node reachable from the recipe. The recipe must
    /// already be validated.
    pub fn from_recipe(recipe: &Recipe) -> BuildGraph {
        let mut builder = GraphBuilder {
            graph: BuildGraph {
                nodes: Vec::new(),
                index: HashMap::new(),
                pages: Vec::new(),
            },
            lossy_jbig2_warned: false,
        };
        for page in &recipe.pages {
            let page = builder.make_page(page);
            builder.graph.pages.push(page);
        }
        builder.graph
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        &self.nodes[id.0]
    }

    /// All jbig2 nodes, in interning order. The coordinator scans this list
    /// when it forms a batch.
    pub fn jbig2_nodes(&self) -> impl Iterator<Item = (NodeId, &Jbig2Params)> {
        self.nodes.iter().enumerate().filter_map(|(i, node)| match node {
            BuildNode::Jbig2 { params } => Some((NodeId(i), params)),
            BuildNode::Magick { .. } => None,
        })
    }

    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

struct GraphBuilder {
    graph: BuildGraph,
    lossy_jbig2_warned: bool,
}

impl GraphBuilder {
    fn intern(&mut self, params: NodeParams) -> NodeId {
        if let Some(&id) = self.graph.index.get(&params) {
            return id;
        }
        let id = NodeId(self.graph.nodes.len());
        let node = match params.clone() {
            NodeParams::Magick(params) => BuildNode::Magick {
                params,
                cache: AsyncCache::new(),
            },
            NodeParams::Jbig2(params) => BuildNode::Jbig2 { params },
        };
        self.graph.nodes.push(node);
        self.graph.index.insert(params, id);
        id
    }

    /// A continuous-tone image, optionally clipped by an already-interned
    /// stencil mask.
    fn make_image(&mut self, recipe: &ImageRecipe, mask: Option<NodeId>) -> NodeId {
        let quality = if recipe.compression.is_lossy() {
            Some(recipe.quality.unwrap_or(100))
        } else {
            None
        };
        self.intern(NodeParams::Magick(MagickParams {
            path: recipe.filename.clone(),
            compression: recipe.compression.into(),
            quality,
            image_mask: false,
            mask,
        }))
    }

    /// The bitonal stencil mask of a foreground layer.
    fn make_mask(&mut self, recipe: &ForegroundRecipe) -> NodeId {
        match recipe.compression {
            MaskCompression::Fax => self.intern(NodeParams::Magick(MagickParams {
                path: recipe.filename.clone(),
                compression: MagickCompression::Fax,
                quality: None,
                image_mask: true,
                mask: None,
            })),
            MaskCompression::Jbig2 => {
                let threshold = recipe.threshold();
                if threshold != 1.0 && !self.lossy_jbig2_warned {
                    self.lossy_jbig2_warned = true;
                    warn!(
                        "Lossy JBIG2 compression can alter text in a way that is \
                         not noticeable as corruption (e.g. the numbers '6' and \
                         '8' get replaced)"
                    );
                }
                self.intern(NodeParams::Jbig2(Jbig2Params {
                    path: recipe.filename.clone(),
                    threshold_bits: threshold.to_bits(),
                }))
            }
        }
    }

    fn make_foreground(&mut self, recipe: &ForegroundRecipe) -> ForegroundLayer {
        let mask = self.make_mask(recipe);
        match &recipe.masked_image {
            Some(image) => ForegroundLayer {
                mask,
                image: self.make_image(image, Some(mask)),
                color: None,
            },
            None => ForegroundLayer {
                mask,
                image: mask,
                color: recipe.tint(),
            },
        }
    }

    fn make_page(&mut self, recipe: &PageRecipe) -> PageNode {
        PageNode {
            width: recipe.width,
            height: recipe.height,
            thumbnail: recipe
                .thumbnail
                .as_ref()
                .map(|image| self.make_image(image, None)),
            background: recipe
                .background
                .as_ref()
                .map(|image| self.make_image(image, None)),
            foreground: recipe
                .foreground
                .iter()
                .map(|fg| self.make_foreground(fg))
                .collect(),
            color: recipe.base_color(),
            text: recipe.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(json: &str) -> Recipe {
        let recipe = Recipe::from_json_slice(json.as_bytes()).unwrap();
        recipe.validate().unwrap();
        recipe
    }

    #[test]
    fn shared_background_interns_to_one_node() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "jpeg", "quality": 80}},
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "jpeg", "quality": 80}}
            ]}"#,
        ));
        assert_eq!(graph.pages[0].background, graph.pages[1].background);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn different_quality_splits_the_equality_class() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "jpeg", "quality": 80}},
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "jpeg", "quality": 81}}
            ]}"#,
        ));
        assert_ne!(graph.pages[0].background, graph.pages[1].background);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn quality_is_ignored_for_lossless_modes() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "deflate", "quality": 80}},
              {"width": 10, "height": 10,
               "background": {"filename": "scan.png", "compression": "deflate"}}
            ]}"#,
        ));
        assert_eq!(graph.pages[0].background, graph.pages[1].background);
    }

    #[test]
    fn tinted_foreground_reuses_the_mask_node_as_its_image() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [{"width": 10, "height": 10,
               "foreground": [{"filename": "fg.png", "compression": "fax", "color": [255, 0, 0]}]}]}"#,
        ));
        let layer = &graph.pages[0].foreground[0];
        assert_eq!(layer.mask, layer.image);
        assert_eq!(layer.color, Some(Rgb([255, 0, 0])));
    }

    #[test]
    fn masked_image_depends_on_its_interned_mask() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [{"width": 10, "height": 10,
               "foreground": [{"filename": "fg.png", "compression": "jbig2",
                 "masked_image": {"filename": "photo.png", "compression": "jpeg"}}]}]}"#,
        ));
        let layer = &graph.pages[0].foreground[0];
        assert_ne!(layer.mask, layer.image);
        assert_eq!(layer.color, None);
        match graph.node(layer.image) {
            BuildNode::Magick { params, .. } => assert_eq!(params.mask, Some(layer.mask)),
            BuildNode::Jbig2 { .. } => panic!("masked image must be a magick node"),
        }
        match graph.node(layer.mask) {
            BuildNode::Jbig2 { params } => assert!(params.is_lossless()),
            BuildNode::Magick { .. } => panic!("mask must be a jbig2 node"),
        }
    }

    #[test]
    fn equal_jbig2_masks_share_one_node_across_pages() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [
              {"width": 10, "height": 10,
               "foreground": [{"filename": "a.png", "compression": "jbig2", "jbig2_threshold": 0.85}]},
              {"width": 10, "height": 10,
               "foreground": [{"filename": "a.png", "compression": "jbig2", "jbig2_threshold": 0.85}]}
            ]}"#,
        ));
        assert_eq!(
            graph.pages[0].foreground[0].mask,
            graph.pages[1].foreground[0].mask
        );
        assert_eq!(graph.jbig2_nodes().count(), 1);
    }

    #[test]
    fn same_threshold_different_files_share_a_batch_key() {
        let graph = BuildGraph::from_recipe(&recipe(
            r#"{"pages": [{"width": 10, "height": 10, "foreground": [
               {"filename": "a.png", "compression": "jbig2", "jbig2_threshold": 0.85},
               {"filename": "b.png", "compression": "jbig2", "jbig2_threshold": 0.85},
               {"filename": "c.png", "compression": "jbig2", "jbig2_threshold": 0.6}
            ]}]}"#,
        ));
        let params: Vec<_> = graph.jbig2_nodes().map(|(_, p)| p).collect();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].batch_key(), params[1].batch_key());
        assert_ne!(params[0].batch_key(), params[2].batch_key());
    }
}
