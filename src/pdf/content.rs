//! Content-stream rendering.
//!
//! Everything here is a pure function from resolved page data to operator
//! text, so two runs over the same recipe produce byte-identical streams.
//! The layout model is fixed: raster layers are painted inside one `q`/`Q`
//! block that maps the unit square to the page box, and all OCR words go
//! into a single invisible text block positioned per word with a `Tm`
//! matrix.

use crate::recipe::{Rgb, TextRecipe};

/// Decimal places used for numbers in PDF output.
const PDF_DECIMAL_PLACES: usize = 3;

/// Fixed-point formatting with PostScript-style trimming: trailing zeros
/// (and a bare decimal point) are dropped, and with `trim_leading_zero` a
/// leading `0.` collapses to `.` the way PDF writers traditionally shorten
/// operands.
pub(crate) fn format_number(value: f64, decimal_places: usize, trim_leading_zero: bool) -> String {
    let mut s = format!("{value:.decimal_places$}");
    if s.contains('.') {
        let len = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(len);
    }
    if trim_leading_zero && s.contains('.') {
        s = s.trim_start_matches('0').to_string();
    }
    s
}

pub(crate) fn format_pdf_number(value: f64) -> String {
    format_number(value, PDF_DECIMAL_PLACES, true)
}

/// `r g b rg ` operator setting the nonstroking fill color.
fn color_operator(color: Rgb) -> String {
    let Rgb([r, g, b]) = color;
    format!(
        "{} {} {} rg ",
        format_pdf_number(r as f64 / 255.0),
        format_pdf_number(g as f64 / 255.0),
        format_pdf_number(b as f64 / 255.0)
    )
}

// ── Affine transforms ─────────────────────────────────────────────────────

/// Row-vector affine transform: points transform as `p · M`, so operations
/// applied through the mutating methods take effect in call order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransformationMatrix {
    matrix: [[f64; 3]; 3],
}

impl TransformationMatrix {
    pub fn identity() -> TransformationMatrix {
        TransformationMatrix {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    fn multiply(&mut self, other: [[f64; 3]; 3]) {
        let mut result = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                for (k, row) in other.iter().enumerate() {
                    result[i][j] += self.matrix[i][k] * row[j];
                }
            }
        }
        self.matrix = result;
    }

    pub fn scale(&mut self, sx: f64, sy: f64) {
        self.multiply([[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]]);
    }

    pub fn translate(&mut self, tx: f64, ty: f64) {
        self.multiply([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [tx, ty, 1.0]]);
    }

    pub fn rotate(&mut self, angle_degrees: f64) {
        let (s, c) = angle_degrees.to_radians().sin_cos();
        self.multiply([[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]);
    }

    /// The six-operand form used by `cm` and `Tm`.
    pub fn to_pdf(&self) -> String {
        let m = &self.matrix;
        [m[0][0], m[0][1], m[1][0], m[1][1], m[2][0], m[2][1]]
            .iter()
            .map(|&v| format_pdf_number(v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Transform mapping the glyph run of `word` onto its page-space box.
///
/// The glyph box is 0.5 x 1 per character at unit scale; the run is centered,
/// reoriented for the reading direction, counter-rotated, and then stretched
/// into the word's bounding box.
fn text_matrix(word: &TextRecipe) -> TransformationMatrix {
    let mut matrix = TransformationMatrix::identity();
    let chars = word.text.chars().count().max(1);
    matrix.scale(2.0 / chars as f64, 1.0);
    matrix.translate(-0.5, -0.5);
    match word.direction {
        crate::recipe::TextDirection::Ltr => {}
        crate::recipe::TextDirection::Rtl => matrix.translate(0.0, -1.0),
        crate::recipe::TextDirection::Ttb => matrix.rotate(90.0),
    }
    matrix.rotate(-word.rotation);
    matrix.translate(0.5, 0.5);
    matrix.scale(word.width, word.height);
    matrix.translate(word.x, word.y);
    matrix
}

/// Hex string literal of the word in UTF-16BE, the encoding the embedded
/// Identity-H font expects.
fn utf16_hex_string(text: &str) -> String {
    let mut hex = String::with_capacity(text.len() * 4 + 2);
    hex.push('<');
    for unit in text.encode_utf16() {
        for byte in unit.to_be_bytes() {
            hex.push_str(&format!("{byte:02x}"));
        }
    }
    hex.push('>');
    hex
}

// ── Page content ──────────────────────────────────────────────────────────

/// What a page paints, reduced to the facts content emission needs. Each
/// foreground entry is `Some(tint)` for a stencil layer or `None` for a
/// masked image whose stencil occupies its own XObject slot without being
/// drawn directly.
pub(crate) struct PageLayout<'a> {
    pub width: f64,
    pub height: f64,
    pub color: Rgb,
    pub has_background: bool,
    pub foreground: &'a [Option<Rgb>],
    pub text: &'a [TextRecipe],
}

/// Rendered operators plus the resource facts the assembler must mirror.
/// XObject slots are consumed in a fixed order: background first, then per
/// foreground layer the stencil mask (masked images only) followed by the
/// image itself.
pub(crate) struct PageContent {
    pub stream: String,
    pub uses_font: bool,
    pub image_slots: usize,
}

pub(crate) fn build_page_content(layout: &PageLayout) -> PageContent {
    let mut image_slot = 0usize;
    let mut graphics = String::new();
    let mut current_color: Option<Rgb> = None;

    if layout.color != Rgb::WHITE {
        current_color = Some(layout.color);
        graphics.push_str(&color_operator(layout.color));
        graphics.push_str("0 0 1 1 re f\n");
    }
    if layout.has_background {
        graphics.push_str(&format!("/Im{image_slot} Do\n"));
        image_slot += 1;
    }
    for tint in layout.foreground {
        if tint.is_none() {
            // The stencil mask is registered but never drawn; the image it
            // clips carries the reference.
            image_slot += 1;
        }
        if let Some(color) = tint {
            if current_color != Some(*color) {
                current_color = Some(*color);
                graphics.push_str(&color_operator(*color));
            }
        }
        graphics.push_str(&format!("/Im{image_slot} Do\n"));
        image_slot += 1;
    }

    let mut contents = String::new();
    if !graphics.is_empty() {
        let mut matrix = TransformationMatrix::identity();
        matrix.scale(layout.width, layout.height);
        contents.push_str(&format!("q\n{} cm\n", matrix.to_pdf()));
        contents.push_str(graphics.trim_end_matches([' ', '\n']));
        contents.push_str("\nQ\n");
    }

    let mut text_ops = String::new();
    for word in layout.text {
        if word.text.is_empty() {
            continue;
        }
        text_ops.push_str(&format!(
            "{} Tm {} Tj\n",
            text_matrix(word).to_pdf(),
            utf16_hex_string(&word.text)
        ));
    }
    let text_ops = text_ops.trim_end_matches([' ', '\n']);
    let uses_font = !text_ops.is_empty();
    if uses_font {
        // Size-1 glyphs in invisible render mode; the Tm matrix does all
        // the positioning.
        contents.push_str("BT\n/F1 1 Tf 3 Tr\n");
        contents.push_str(text_ops);
        contents.push_str("\nET\n");
    }

    PageContent {
        stream: contents.trim_end_matches([' ', '\n']).to_string(),
        uses_font,
        image_slots: image_slot,
    }
}
