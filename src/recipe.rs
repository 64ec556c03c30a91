//! Recipe input model.
//!
//! A recipe is the declarative description of the document: one entry per
//! page, each page naming its raster layers (background, bitonal foreground
//! masks, optional thumbnail), a base fill color, and the OCR text words to
//! place invisibly over the image.
//!
//! The tree is read once at build start. [`Recipe::validate`] enforces every
//! field contract before any external process runs; a recipe that parses but
//! violates a range or an exclusivity rule fails the whole build with
//! [`BuildError::InvalidRecipe`].

use crate::error::BuildError;
use serde::Deserialize;
use std::path::PathBuf;

/// Lossy JBIG2 thresholds must stay within this band (or be exactly 1).
pub const JBIG2_THRESHOLD_MIN: f64 = 0.4;
pub const JBIG2_THRESHOLD_MAX: f64 = 0.9;

/// An RGB color with 8-bit components, written `[r, g, b]` in recipe JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const BLACK: Rgb = Rgb([0x00, 0x00, 0x00]);
    pub const WHITE: Rgb = Rgb([0xff, 0xff, 0xff]);
}

/// The whole document: an ordered list of pages.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub pages: Vec<PageRecipe>,
}

/// One page of the document.
///
/// Width and height are in PDF points (1/72 inch). All raster layers are
/// stretched to cover the full page; positioning happens upstream when the
/// layer images are produced.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageRecipe {
    pub width: f64,
    pub height: f64,
    /// Optional page thumbnail, resolved through the image pipeline.
    #[serde(default)]
    pub thumbnail: Option<ImageRecipe>,
    /// Optional full-page background image.
    #[serde(default)]
    pub background: Option<ImageRecipe>,
    /// Bitonal foreground layers, painted over the background in order.
    #[serde(default)]
    pub foreground: Vec<ForegroundRecipe>,
    /// Base fill color. Defaults to white, which is not painted at all.
    #[serde(default)]
    pub color: Option<Rgb>,
    /// Invisible OCR text words placed over the page.
    #[serde(default)]
    pub text: Vec<TextRecipe>,
}

impl PageRecipe {
    /// The page's base fill color with the default applied.
    pub fn base_color(&self) -> Rgb {
        self.color.unwrap_or(Rgb::WHITE)
    }
}

/// A continuous-tone image layer (background, masked image, or thumbnail).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRecipe {
    pub filename: PathBuf,
    pub compression: ImageCompression,
    /// Encoder quality for the lossy modes, 1–100. Ignored otherwise.
    #[serde(default)]
    pub quality: Option<u8>,
}

/// Compression choices for continuous-tone images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCompression {
    /// Let ImageMagick pick.
    Auto,
    /// Lossless flate.
    Deflate,
    /// JPEG 2000.
    Jp2,
    /// Baseline JPEG.
    Jpeg,
}

impl ImageCompression {
    pub fn is_lossy(self) -> bool {
        matches!(self, ImageCompression::Jp2 | ImageCompression::Jpeg)
    }
}

/// A bitonal foreground layer: a mask, plus either a tint color or a full
/// image clipped by the mask (mutually exclusive).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForegroundRecipe {
    pub filename: PathBuf,
    pub compression: MaskCompression,
    /// Lossy symbol-coding aggressiveness: exactly 1 (lossless generic
    /// coding) or within [0.4, 0.9]. Defaults to 1. Ignored for fax.
    #[serde(default)]
    pub jbig2_threshold: Option<f64>,
    /// Full-color image painted through the mask instead of a flat tint.
    #[serde(default)]
    pub masked_image: Option<ImageRecipe>,
    /// Tint painted through the mask. Defaults to black when no masked
    /// image is given.
    #[serde(default)]
    pub color: Option<Rgb>,
}

impl ForegroundRecipe {
    /// Threshold with the default applied.
    pub fn threshold(&self) -> f64 {
        self.jbig2_threshold.unwrap_or(1.0)
    }

    /// Tint color with the default applied; `None` means the layer paints a
    /// masked image rather than a tint.
    pub fn tint(&self) -> Option<Rgb> {
        if self.masked_image.is_some() {
            None
        } else {
            Some(self.color.unwrap_or(Rgb::BLACK))
        }
    }
}

/// Compression choices for bitonal masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskCompression {
    /// CCITT group 4 via ImageMagick.
    Fax,
    /// JBIG2 via jbig2enc.
    Jbig2,
}

/// One OCR word: its page-space box, orientation, and optional link target.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextRecipe {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Counter-clockwise rotation in degrees. Defaults to 0.
    #[serde(default)]
    pub rotation: f64,
    pub text: String,
    /// URI opened when the word is clicked.
    #[serde(default)]
    pub external_link: Option<String>,
    /// In-document target: `[page_index, [x, y]]`.
    #[serde(default)]
    pub internal_link: Option<(usize, (f64, f64))>,
    /// Reading direction. Defaults to left-to-right.
    #[serde(default)]
    pub direction: TextDirection,
}

/// Reading direction of a text word; selects the pre-rotation applied before
/// the word is scaled into its box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextDirection {
    #[default]
    Ltr,
    Rtl,
    Ttb,
}

impl Recipe {
    /// Parse a recipe from JSON bytes, mapping malformed input to
    /// [`BuildError::InvalidRecipe`].
    pub fn from_json_slice(bytes: &[u8]) -> Result<Recipe, BuildError> {
        serde_json::from_slice(bytes)
            .map_err(|e| BuildError::invalid_recipe(e.to_string()))
    }

    /// Enforce every field contract. Runs before any external process.
    pub fn validate(&self) -> Result<(), BuildError> {
        for (index, page) in self.pages.iter().enumerate() {
            page.validate(index, self.pages.len())?;
        }
        Ok(())
    }
}

impl PageRecipe {
    fn validate(&self, index: usize, total_pages: usize) -> Result<(), BuildError> {
        if !(self.width.is_finite() && self.width > 0.0)
            || !(self.height.is_finite() && self.height > 0.0)
        {
            return Err(BuildError::invalid_recipe(format!(
                "page {index}: width and height must be positive finite numbers"
            )));
        }
        for image in [&self.thumbnail, &self.background].into_iter().flatten() {
            image.validate(index)?;
        }
        for fg in &self.foreground {
            fg.validate(index)?;
        }
        for word in &self.text {
            word.validate(index, total_pages)?;
        }
        Ok(())
    }
}

impl ImageRecipe {
    fn validate(&self, page: usize) -> Result<(), BuildError> {
        if self.compression.is_lossy() {
            let quality = self.quality.unwrap_or(100);
            if !(1..=100).contains(&quality) {
                return Err(BuildError::invalid_recipe(format!(
                    "page {page}: quality must be within 1..=100, got {quality}"
                )));
            }
        }
        Ok(())
    }
}

impl ForegroundRecipe {
    fn validate(&self, page: usize) -> Result<(), BuildError> {
        if self.masked_image.is_some() && self.color.is_some() {
            return Err(BuildError::invalid_recipe(format!(
                "page {page}: color and masked_image are mutually exclusive"
            )));
        }
        if let Some(image) = &self.masked_image {
            image.validate(page)?;
        }
        if self.compression == MaskCompression::Jbig2 {
            let t = self.threshold();
            let in_band = (JBIG2_THRESHOLD_MIN..=JBIG2_THRESHOLD_MAX).contains(&t);
            if t != 1.0 && !in_band {
                return Err(BuildError::invalid_recipe(format!(
                    "page {page}: jbig2_threshold must be 1 or between \
                     {JBIG2_THRESHOLD_MIN} and {JBIG2_THRESHOLD_MAX}, got {t}"
                )));
            }
        }
        Ok(())
    }
}

impl TextRecipe {
    fn validate(&self, page: usize, total_pages: usize) -> Result<(), BuildError> {
        if self.external_link.is_some() && self.internal_link.is_some() {
            return Err(BuildError::invalid_recipe(format!(
                "page {page}: internal and external links are mutually exclusive"
            )));
        }
        if let Some(uri) = &self.external_link {
            if !uri.is_ascii() {
                return Err(BuildError::invalid_recipe(format!(
                    "page {page}: external link is not ASCII: {uri:?}"
                )));
            }
        }
        if let Some((target, _)) = self.internal_link {
            if target >= total_pages {
                return Err(BuildError::invalid_recipe(format!(
                    "page {page}: internal link targets page {target} but the \
                     document has {total_pages} pages"
                )));
            }
        }
        Ok(())
    }
}
