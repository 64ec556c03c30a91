//! Document-wide shared resources.
//!
//! Three object groups are shared by every page that needs them: the
//! invisible Type0 font the OCR text layer selects, the ICCBased sRGB
//! colorspace PDF/A requires as `DefaultRGB`, and the transparency group
//! attached to each page. All three are generated deterministically so the
//! same recipe always produces the same bytes.
//!
//! ## Why a generated font
//!
//! The text layer never paints glyphs (render mode 3), so the embedded
//! TrueType font only has to be structurally valid: two empty glyphs, a
//! fixed advance, and metrics matching the font descriptor. Building those
//! six sfnt tables here keeps the crate free of binary assets and keeps the
//! font bytes reproducible.

use std::io::Write;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Dictionary, Object, Stream};
use once_cell::sync::Lazy;

use crate::pdf::bundle::{BundleBuilder, PdfObjectBundle};

/// zlib-compress at the highest level; output feeds `FlateDecode` streams.
pub(crate) fn flate_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .expect("deflate into a Vec cannot fail")
}

/// A `FlateDecode` stream over `data`, keeping any keys already in `dict`
/// (`Length1`, `N`, ...). The stream is final; document-level compression
/// must not touch it again.
pub(crate) fn deflated_stream(mut dict: Dictionary, data: &[u8]) -> Stream {
    dict.set("Filter", vec![Object::Name(b"FlateDecode".to_vec())]);
    Stream::new(dict, flate_compress(data)).with_compression(false)
}

// ── Glyphless TrueType font ───────────────────────────────────────────────

const UNITS_PER_EM: u16 = 1000;
const GLYPH_ADVANCE: u16 = 500;
const NUM_GLYPHS: u16 = 2;

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_i16(buf: &mut Vec<u8>, value: i16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Big-endian u32 sum over the (zero-padded) table, per the sfnt spec.
fn sfnt_checksum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum = sum.wrapping_add(u32::from_be_bytes(word));
    }
    sum
}

fn head_table() -> Vec<u8> {
    let mut t = Vec::with_capacity(54);
    push_u32(&mut t, 0x0001_0000); // version
    push_u32(&mut t, 0x0001_0000); // fontRevision
    push_u32(&mut t, 0); // checkSumAdjustment, patched below
    push_u32(&mut t, 0x5F0F_3CF5); // magicNumber
    push_u16(&mut t, 0x0003); // flags: y=0 baseline, x=0 left sidebearing
    push_u16(&mut t, UNITS_PER_EM);
    t.extend_from_slice(&0i64.to_be_bytes()); // created
    t.extend_from_slice(&0i64.to_be_bytes()); // modified
    push_i16(&mut t, 0); // xMin
    push_i16(&mut t, 0); // yMin
    push_i16(&mut t, 1000); // xMax
    push_i16(&mut t, 500); // yMax
    push_u16(&mut t, 0); // macStyle
    push_u16(&mut t, 8); // lowestRecPPEM
    push_i16(&mut t, 2); // fontDirectionHint
    push_i16(&mut t, 0); // indexToLocFormat: short loca
    push_i16(&mut t, 0); // glyphDataFormat
    t
}

fn hhea_table() -> Vec<u8> {
    let mut t = Vec::with_capacity(36);
    push_u32(&mut t, 0x0001_0000); // version
    push_i16(&mut t, 1000); // ascender
    push_i16(&mut t, -1); // descender
    push_i16(&mut t, 0); // lineGap
    push_u16(&mut t, GLYPH_ADVANCE); // advanceWidthMax
    push_i16(&mut t, 0); // minLeftSideBearing
    push_i16(&mut t, 0); // minRightSideBearing
    push_i16(&mut t, 0); // xMaxExtent
    push_i16(&mut t, 1); // caretSlopeRise
    push_i16(&mut t, 0); // caretSlopeRun
    push_i16(&mut t, 0); // caretOffset
    for _ in 0..4 {
        push_i16(&mut t, 0); // reserved
    }
    push_i16(&mut t, 0); // metricDataFormat
    push_u16(&mut t, NUM_GLYPHS); // numberOfHMetrics
    t
}

fn maxp_table() -> Vec<u8> {
    let mut t = Vec::with_capacity(32);
    push_u32(&mut t, 0x0001_0000); // version
    push_u16(&mut t, NUM_GLYPHS);
    push_u16(&mut t, 0); // maxPoints
    push_u16(&mut t, 0); // maxContours
    push_u16(&mut t, 0); // maxCompositePoints
    push_u16(&mut t, 0); // maxCompositeContours
    push_u16(&mut t, 1); // maxZones
    push_u16(&mut t, 0); // maxTwilightPoints
    push_u16(&mut t, 0); // maxStorage
    push_u16(&mut t, 0); // maxFunctionDefs
    push_u16(&mut t, 0); // maxInstructionDefs
    push_u16(&mut t, 0); // maxStackElements
    push_u16(&mut t, 0); // maxSizeOfInstructions
    push_u16(&mut t, 0); // maxComponentElements
    push_u16(&mut t, 0); // maxComponentDepth
    t
}

fn hmtx_table() -> Vec<u8> {
    let mut t = Vec::with_capacity(4 * NUM_GLYPHS as usize);
    for _ in 0..NUM_GLYPHS {
        push_u16(&mut t, GLYPH_ADVANCE);
        push_i16(&mut t, 0); // leftSideBearing
    }
    t
}

fn loca_table() -> Vec<u8> {
    // Short format; every glyph is empty, so every offset is zero.
    let mut t = Vec::with_capacity(2 * (NUM_GLYPHS as usize + 1));
    for _ in 0..=NUM_GLYPHS {
        push_u16(&mut t, 0);
    }
    t
}

/// Build the embedded font: `glyf`, `head`, `hhea`, `hmtx`, `loca`, `maxp`,
/// already in directory (tag) order.
fn glyphless_truetype() -> Vec<u8> {
    let tables: [([u8; 4], Vec<u8>); 6] = [
        (*b"glyf", Vec::new()),
        (*b"head", head_table()),
        (*b"hhea", hhea_table()),
        (*b"hmtx", hmtx_table()),
        (*b"loca", loca_table()),
        (*b"maxp", maxp_table()),
    ];

    let num_tables = tables.len() as u16;
    let entry_selector = 15 - num_tables.leading_zeros() as u16;
    let search_range = 16 << entry_selector;

    let mut font = Vec::new();
    push_u32(&mut font, 0x0001_0000); // sfnt version: TrueType outlines
    push_u16(&mut font, num_tables);
    push_u16(&mut font, search_range);
    push_u16(&mut font, entry_selector);
    push_u16(&mut font, num_tables * 16 - search_range);

    let mut offset = (12 + tables.len() * 16) as u32;
    let mut body = Vec::new();
    let mut head_offset = 0;
    for (tag, data) in &tables {
        if tag == b"head" {
            head_offset = offset;
        }
        font.extend_from_slice(tag);
        push_u32(&mut font, sfnt_checksum(data));
        push_u32(&mut font, offset);
        push_u32(&mut font, data.len() as u32);
        body.extend_from_slice(data);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        offset = (12 + tables.len() * 16 + body.len()) as u32;
    }
    font.extend_from_slice(&body);

    // checkSumAdjustment makes the whole-font checksum come out at the
    // magic constant.
    let adjustment = 0xB1B0_AFBAu32.wrapping_sub(sfnt_checksum(&font));
    let slot = head_offset as usize + 8;
    font[slot..slot + 4].copy_from_slice(&adjustment.to_be_bytes());
    font
}

static GLYPHLESS_FONT: Lazy<Vec<u8>> = Lazy::new(glyphless_truetype);

/// Identity CMap mapping every two-byte code to the same Unicode value, so
/// text extraction recovers exactly what `Tj` consumed.
const TO_UNICODE_CMAP: &str = "\
/CIDInit /ProcSet findresource begin
12 dict begin
begincmap
/CIDSystemInfo
<<
  /Registry (Adobe)
  /Ordering (UCS)
  /Supplement 0
>> def
/CMapName /Adobe-Identity-UCS def
/CMapType 2 def
1 begincodespacerange
<0000> <FFFF>
endcodespacerange
1 beginbfrange
<0000> <FFFF> <0000>
endbfrange
endcmap
CMap currentdict /CMap defineresource pop
end
end
";

/// The `/F1` font mapping shared by every page with a text layer. The root
/// is the resource dictionary; the Type0 font and its descendant tree live
/// behind it.
pub(crate) fn font_resources() -> Arc<PdfObjectBundle> {
    let mut builder = BundleBuilder::new();

    let font_bytes: &[u8] = &GLYPHLESS_FONT;
    let embedded_font = builder.add(Object::Stream(deflated_stream(
        dictionary! { "Length1" => font_bytes.len() as i64 },
        font_bytes,
    )));

    let font_descriptor = builder.add(Object::Dictionary(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => "GlyphLessFont",
        "Flags" => 5, // FixedPitch + Symbolic
        "FontBBox" => vec![0.into(), 0.into(), 1000.into(), 500.into()],
        "Ascent" => 1000,
        "CapHeight" => 1000,
        "Descent" => -1,
        "ItalicAngle" => 0,
        "StemV" => 80,
        "FontFile2" => Object::Reference((embedded_font, 0)),
    }));

    // Every CID resolves to glyph 1.
    let gid_map_bytes: Vec<u8> = [0u8, 1u8].repeat(1 << 16);
    let cid_to_gid_map = builder.add(Object::Stream(deflated_stream(
        dictionary! { "Length1" => gid_map_bytes.len() as i64 },
        &gid_map_bytes,
    )));

    let cid_font = builder.add(Object::Dictionary(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => "GlyphLessFont",
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => Object::Reference((font_descriptor, 0)),
        "DW" => 500,
        "CIDToGIDMap" => Object::Reference((cid_to_gid_map, 0)),
    }));

    let unicode_cmap = builder.add(Object::Stream(deflated_stream(
        dictionary! {},
        TO_UNICODE_CMAP.as_bytes(),
    )));

    let font = builder.add(Object::Dictionary(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => "GlyphLessFont",
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::Reference((cid_font, 0))],
        "ToUnicode" => Object::Reference((unicode_cmap, 0)),
    }));

    let mapping = builder.add(Object::Dictionary(dictionary! {
        "F1" => Object::Reference((font, 0)),
    }));
    Arc::new(builder.finish(mapping))
}

// ── sRGB ICC profile ──────────────────────────────────────────────────────

// s15Fixed16 XYZ values from the canonical IEC 61966-2.1 profile.
const D50_XYZ: [u32; 3] = [0x0000_F6D6, 0x0001_0000, 0x0000_D32D];
const D65_XYZ: [u32; 3] = [0x0000_F351, 0x0001_0000, 0x0001_16CC];
const SRGB_R_XYZ: [u32; 3] = [0x0000_6FA2, 0x0000_38F5, 0x0000_0390];
const SRGB_G_XYZ: [u32; 3] = [0x0000_6299, 0x0000_B785, 0x0000_18DA];
const SRGB_B_XYZ: [u32; 3] = [0x0000_24A0, 0x0000_0F84, 0x0000_B6CF];

fn xyz_tag(xyz: [u32; 3]) -> Vec<u8> {
    let mut t = Vec::with_capacity(20);
    t.extend_from_slice(b"XYZ ");
    push_u32(&mut t, 0);
    for value in xyz {
        push_u32(&mut t, value);
    }
    t
}

fn gamma_curve_tag() -> Vec<u8> {
    let mut t = Vec::with_capacity(14);
    t.extend_from_slice(b"curv");
    push_u32(&mut t, 0);
    push_u32(&mut t, 1); // one entry: a plain gamma exponent
    push_u16(&mut t, 0x0233); // 2.2 in u8Fixed8
    t
}

fn description_tag(text: &str) -> Vec<u8> {
    let mut t = Vec::new();
    t.extend_from_slice(b"desc");
    push_u32(&mut t, 0);
    push_u32(&mut t, text.len() as u32 + 1);
    t.extend_from_slice(text.as_bytes());
    t.push(0);
    push_u32(&mut t, 0); // Unicode language code
    push_u32(&mut t, 0); // Unicode count
    push_u16(&mut t, 0); // ScriptCode code
    t.push(0); // ScriptCode count
    t.extend_from_slice(&[0u8; 67]); // Macintosh description
    t
}

fn copyright_tag(text: &str) -> Vec<u8> {
    let mut t = Vec::new();
    t.extend_from_slice(b"text");
    push_u32(&mut t, 0);
    t.extend_from_slice(text.as_bytes());
    t.push(0);
    t
}

/// Minimal matrix/TRC sRGB display profile (ICC v2.4), emitted with zeroed
/// timestamps so the bytes never vary between runs.
fn srgb_icc_profile() -> Vec<u8> {
    let tags: [([u8; 4], Vec<u8>); 9] = [
        (*b"desc", description_tag("sRGB")),
        (*b"wtpt", xyz_tag(D65_XYZ)),
        (*b"rXYZ", xyz_tag(SRGB_R_XYZ)),
        (*b"gXYZ", xyz_tag(SRGB_G_XYZ)),
        (*b"bXYZ", xyz_tag(SRGB_B_XYZ)),
        (*b"rTRC", gamma_curve_tag()),
        (*b"gTRC", gamma_curve_tag()),
        (*b"bTRC", gamma_curve_tag()),
        (*b"cprt", copyright_tag("Public domain")),
    ];

    let mut table = Vec::new();
    push_u32(&mut table, tags.len() as u32);
    let mut body = Vec::new();
    for (sig, data) in &tags {
        table.extend_from_slice(sig);
        push_u32(&mut table, (128 + 4 + tags.len() * 12 + body.len()) as u32);
        push_u32(&mut table, data.len() as u32);
        body.extend_from_slice(data);
        while body.len() % 4 != 0 {
            body.push(0);
        }
    }

    let size = 128 + table.len() + body.len();
    let mut profile = Vec::with_capacity(size);
    push_u32(&mut profile, size as u32);
    push_u32(&mut profile, 0); // preferred CMM
    push_u32(&mut profile, 0x0240_0000); // profile version 2.4
    profile.extend_from_slice(b"mntr"); // device class: display
    profile.extend_from_slice(b"RGB ");
    profile.extend_from_slice(b"XYZ ");
    profile.extend_from_slice(&[0u8; 12]); // creation date
    profile.extend_from_slice(b"acsp");
    push_u32(&mut profile, 0); // platform
    push_u32(&mut profile, 0); // flags
    push_u32(&mut profile, 0); // device manufacturer
    push_u32(&mut profile, 0); // device model
    profile.extend_from_slice(&[0u8; 8]); // device attributes
    push_u32(&mut profile, 0); // rendering intent: perceptual
    for value in D50_XYZ {
        push_u32(&mut profile, value); // PCS illuminant
    }
    push_u32(&mut profile, 0); // creator
    profile.extend_from_slice(&[0u8; 16]); // profile ID
    profile.extend_from_slice(&[0u8; 28]); // reserved
    profile.extend_from_slice(&table);
    profile.extend_from_slice(&body);
    profile
}

static SRGB_PROFILE: Lazy<Vec<u8>> = Lazy::new(srgb_icc_profile);

/// The `[/ICCBased profile]` sRGB colorspace every page names as
/// `DefaultRGB`. The root is the array, shared as one indirect object.
pub(crate) fn srgb_colorspace() -> Arc<PdfObjectBundle> {
    let profile: &[u8] = &SRGB_PROFILE;
    let mut builder = BundleBuilder::new();
    let stream = builder.add(Object::Stream(deflated_stream(
        dictionary! {
            "N" => 3, // red, green, blue
            "Length1" => profile.len() as i64,
        },
        profile,
    )));
    let root = builder.add(Object::Array(vec![
        Object::Name(b"ICCBased".to_vec()),
        Object::Reference((stream, 0)),
    ]));
    Arc::new(builder.finish(root))
}

/// Transparency group attached to every page.
pub(crate) fn transparency_group() -> Arc<PdfObjectBundle> {
    let mut builder = BundleBuilder::new();
    let root = builder.add(Object::Dictionary(dictionary! {
        "S" => "Transparency",
        "CS" => "DeviceRGB",
        "I" => true,
    }));
    Arc::new(builder.finish(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::bundle::BundleImporter;
    use flate2::read::ZlibDecoder;
    use lopdf::Document;
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn font_checksums_balance() {
        let font = glyphless_truetype();
        assert_eq!(font.len() % 4, 0);
        // With checkSumAdjustment patched in, the whole file sums to the
        // sfnt magic constant.
        assert_eq!(sfnt_checksum(&font), 0xB1B0_AFBA);
    }

    #[test]
    fn font_directory_is_sorted_and_complete() {
        let font = glyphless_truetype();
        let num_tables = u16::from_be_bytes([font[4], font[5]]) as usize;
        assert_eq!(num_tables, 6);
        let mut tags = Vec::new();
        for i in 0..num_tables {
            tags.push(font[12 + i * 16..16 + i * 16].to_vec());
        }
        let mut sorted = tags.clone();
        sorted.sort();
        assert_eq!(tags, sorted);
        assert!(tags.contains(&b"glyf".to_vec()));
        assert!(tags.contains(&b"hmtx".to_vec()));
    }

    #[test]
    fn font_head_and_maxp_carry_the_advertised_metrics() {
        let font = glyphless_truetype();
        let table_offset = |tag: &[u8]| -> usize {
            let num_tables = u16::from_be_bytes([font[4], font[5]]) as usize;
            (0..num_tables)
                .map(|i| 12 + i * 16)
                .find(|&at| &font[at..at + 4] == tag)
                .map(|at| u32::from_be_bytes(font[at + 8..at + 12].try_into().unwrap()) as usize)
                .unwrap()
        };
        let head = table_offset(b"head");
        assert_eq!(u16::from_be_bytes([font[head + 18], font[head + 19]]), 1000);
        let maxp = table_offset(b"maxp");
        assert_eq!(u16::from_be_bytes([font[maxp + 4], font[maxp + 5]]), 2);
    }

    #[test]
    fn icc_profile_is_structurally_sound() {
        let profile = srgb_icc_profile();
        assert_eq!(
            u32::from_be_bytes(profile[0..4].try_into().unwrap()) as usize,
            profile.len()
        );
        assert_eq!(&profile[36..40], b"acsp");
        assert_eq!(&profile[16..20], b"RGB ");
        let tag_count = u32::from_be_bytes(profile[128..132].try_into().unwrap());
        assert_eq!(tag_count, 9);
        // Every tag's data window stays inside the profile.
        for i in 0..tag_count as usize {
            let at = 132 + i * 12;
            let offset = u32::from_be_bytes(profile[at + 4..at + 8].try_into().unwrap()) as usize;
            let size = u32::from_be_bytes(profile[at + 8..at + 12].try_into().unwrap()) as usize;
            assert!(offset + size <= profile.len());
        }
    }

    #[test]
    fn font_bundle_imports_as_a_complete_type0_tree() {
        let mut document = Document::with_version("1.5");
        let root = BundleImporter::new().import(&mut document, &font_resources());

        let mapping = document.get_object(root).unwrap().as_dict().unwrap();
        let font_id = mapping.get(b"F1").unwrap().as_reference().unwrap();
        let font = document.get_object(font_id).unwrap().as_dict().unwrap();
        assert_eq!(font.get(b"Subtype").unwrap().as_name().unwrap(), b"Type0");
        assert_eq!(
            font.get(b"Encoding").unwrap().as_name().unwrap(),
            b"Identity-H"
        );

        let descendants = font.get(b"DescendantFonts").unwrap().as_array().unwrap();
        let cid_font_id = descendants[0].as_reference().unwrap();
        let cid_font = document.get_object(cid_font_id).unwrap().as_dict().unwrap();
        assert_eq!(cid_font.get(b"DW").unwrap().as_i64().unwrap(), 500);

        let gid_map_id = cid_font.get(b"CIDToGIDMap").unwrap().as_reference().unwrap();
        let gid_map = document.get_object(gid_map_id).unwrap().as_stream().unwrap();
        let raw = inflate(&gid_map.content);
        assert_eq!(raw.len(), 2 << 16);
        assert_eq!(&raw[..4], &[0, 1, 0, 1]);
        assert_eq!(gid_map.dict.get(b"Length1").unwrap().as_i64().unwrap(), 131072);

        let descriptor_id = cid_font
            .get(b"FontDescriptor")
            .unwrap()
            .as_reference()
            .unwrap();
        let descriptor = document
            .get_object(descriptor_id)
            .unwrap()
            .as_dict()
            .unwrap();
        let font_file_id = descriptor.get(b"FontFile2").unwrap().as_reference().unwrap();
        let font_file = document.get_object(font_file_id).unwrap().as_stream().unwrap();
        let advertised = font_file.dict.get(b"Length1").unwrap().as_i64().unwrap();
        assert_eq!(inflate(&font_file.content).len() as i64, advertised);
    }

    #[test]
    fn srgb_colorspace_is_an_iccbased_array_over_the_profile() {
        let mut document = Document::with_version("1.5");
        let root = BundleImporter::new().import(&mut document, &srgb_colorspace());
        let array = document.get_object(root).unwrap().as_array().unwrap();
        assert_eq!(array[0].as_name().unwrap(), b"ICCBased");
        let stream_id = array[1].as_reference().unwrap();
        let stream = document.get_object(stream_id).unwrap().as_stream().unwrap();
        assert_eq!(stream.dict.get(b"N").unwrap().as_i64().unwrap(), 3);
        let raw = inflate(&stream.content);
        assert_eq!(
            stream.dict.get(b"Length1").unwrap().as_i64().unwrap() as usize,
            raw.len()
        );
    }
}
