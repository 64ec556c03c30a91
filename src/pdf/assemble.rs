//! Document assembly and post-processing.
//!
//! Pages come through here in two phases. Phase one is concurrent and
//! happens upstream: every image a page references is resolved to an object
//! bundle, then [`finish_page`] renders the content stream. Phase two is
//! sequential: [`assemble_document`] imports all bundles into one
//! [`lopdf::Document`] in page order, so object numbering depends only on
//! the recipe. Page object ids are allocated before any page is written,
//! which lets a link annotation on page one point at page forty. The staged
//! document finally goes through qpdf ([`write_document`]), which owns
//! linearization and cross-reference cleanup.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::debug;

use crate::config::BuildOptions;
use crate::error::BuildError;
use crate::exec::process::absolute_arg;
use crate::exec::CommandRunner;
use crate::pdf::bundle::{BundleImporter, PdfObjectBundle};
use crate::pdf::content::{build_page_content, PageContent, PageLayout};
use crate::pdf::resources::{deflated_stream, font_resources, srgb_colorspace, transparency_group};
use crate::recipe::{Rgb, TextRecipe};

/// XMP packet declaring PDF/A-2A conformance, embedded as the document
/// metadata stream.
const XMP_PACKET: &str = "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>
<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">
 <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">
  <rdf:Description rdf:about=\"\" xmlns:pdfaid=\"http://www.aiim.org/pdfa/ns/id/\">
   <pdfaid:part>2</pdfaid:part>
   <pdfaid:conformance>A</pdfaid:conformance>
  </rdf:Description>
 </rdf:RDF>
</x:xmpmeta>
<?xpacket end=\"w\"?>";

/// One foreground layer with its images resolved.
///
/// `mask` is `Some` only for masked images, where the stencil occupies its
/// own XObject slot; a tinted stencil draws the stencil itself and carries
/// the tint in `color`.
pub(crate) struct ResolvedLayer {
    pub mask: Option<Arc<PdfObjectBundle>>,
    pub image: Arc<PdfObjectBundle>,
    pub color: Option<Rgb>,
}

/// A page with every image reference resolved to an importable bundle.
pub(crate) struct ResolvedPage {
    pub width: f64,
    pub height: f64,
    pub color: Rgb,
    pub thumbnail: Option<Arc<PdfObjectBundle>>,
    pub background: Option<Arc<PdfObjectBundle>>,
    pub foreground: Vec<ResolvedLayer>,
    pub text: Vec<TextRecipe>,
}

/// A resolved page plus its rendered content stream. Nothing that can fail
/// is left to do once a page reaches this state.
pub(crate) struct BuiltPage {
    pub resolved: ResolvedPage,
    pub content: PageContent,
}

/// Render the content stream for a resolved page.
pub(crate) fn finish_page(resolved: ResolvedPage) -> BuiltPage {
    let tints: Vec<Option<Rgb>> = resolved.foreground.iter().map(|layer| layer.color).collect();
    let content = build_page_content(&PageLayout {
        width: resolved.width,
        height: resolved.height,
        color: resolved.color,
        has_background: resolved.background.is_some(),
        foreground: &tints,
        text: &resolved.text,
    });
    BuiltPage { resolved, content }
}

fn real(value: f64) -> Object {
    Object::Real(value as f32)
}

/// Assemble the staged document from built pages, in page order.
///
/// Everything here is deterministic: object ids are handed out in a fixed
/// sequence, shared bundles are imported exactly once, and two runs over
/// the same pages differ only in the random document ID.
pub(crate) fn assemble_document(pages: &[BuiltPage], options: &BuildOptions) -> Document {
    let mut document = Document::with_version("1.5");
    let mut importer = BundleImporter::new();

    // Page ids are allocated up front so Dest arrays can reference pages
    // that have not been written yet.
    let pages_id = document.new_object_id();
    let page_ids: Vec<ObjectId> = pages.iter().map(|_| document.new_object_id()).collect();

    let group_id = importer.import(&mut document, &transparency_group());
    let srgb_id = importer.import(&mut document, &srgb_colorspace());
    // The font tree is imported on first use; a document without text never
    // carries it.
    let mut font_id: Option<ObjectId> = None;

    for (page, &page_id) in pages.iter().zip(&page_ids) {
        let mut xobjects = Dictionary::new();
        let mut slot = 0usize;
        if let Some(background) = &page.resolved.background {
            let id = importer.import(&mut document, background);
            xobjects.set(format!("Im{slot}"), Object::Reference(id));
            slot += 1;
        }
        for layer in &page.resolved.foreground {
            if let Some(mask) = &layer.mask {
                let id = importer.import(&mut document, mask);
                xobjects.set(format!("Im{slot}"), Object::Reference(id));
                slot += 1;
            }
            let id = importer.import(&mut document, &layer.image);
            xobjects.set(format!("Im{slot}"), Object::Reference(id));
            slot += 1;
        }

        let mut resources = dictionary! {
            "ColorSpace" => dictionary! { "DefaultRGB" => Object::Reference(srgb_id) },
        };
        if !xobjects.is_empty() {
            resources.set("XObject", xobjects);
        }
        if page.content.uses_font {
            let id = match font_id {
                Some(id) => id,
                None => {
                    let id = importer.import(&mut document, &font_resources());
                    font_id = Some(id);
                    id
                }
            };
            resources.set("Font", Object::Reference(id));
        }

        let mut page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                real(page.resolved.width),
                real(page.resolved.height),
            ],
            "Group" => Object::Reference(group_id),
            "Resources" => resources,
        };
        if let Some(thumbnail) = &page.resolved.thumbnail {
            let id = importer.import(&mut document, thumbnail);
            page_dict.set("Thumb", Object::Reference(id));
        }
        if !page.content.stream.is_empty() {
            let bytes = page.content.stream.as_bytes();
            let stream = if options.compress_page_streams {
                deflated_stream(Dictionary::new(), bytes)
            } else {
                Stream::new(Dictionary::new(), bytes.to_vec())
            };
            let id = document.add_object(Object::Stream(stream));
            page_dict.set("Contents", Object::Reference(id));
        }
        let annots = page_annotations(&page.resolved.text, &page_ids);
        if !annots.is_empty() {
            page_dict.set("Annots", annots);
        }
        document.objects.insert(page_id, Object::Dictionary(page_dict));
    }

    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|&id| Object::Reference(id)).collect::<Vec<_>>(),
            "Count" => pages.len() as i64,
        }),
    );

    let metadata_id = document.add_object(Object::Stream(deflated_stream(
        dictionary! {
            "Type" => "Metadata",
            "Subtype" => "XML",
            "Length1" => XMP_PACKET.len() as i64,
        },
        XMP_PACKET.as_bytes(),
    )));
    let catalog_id = document.add_object(Object::Dictionary(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
        "MarkInfo" => dictionary! { "Marked" => true },
        "StructTreeRoot" => dictionary! { "Type" => "StructTreeRoot" },
        "Metadata" => Object::Reference(metadata_id),
    }));

    let document_id: [u8; 16] = rand::random();
    document.trailer.set("Root", Object::Reference(catalog_id));
    document.trailer.set(
        "ID",
        vec![
            Object::String(document_id.to_vec(), StringFormat::Hexadecimal),
            Object::String(document_id.to_vec(), StringFormat::Hexadecimal),
        ],
    );
    document
}

/// Link annotations for the words that carry one. Words with an empty text
/// string still produce their annotation.
fn page_annotations(words: &[TextRecipe], page_ids: &[ObjectId]) -> Vec<Object> {
    let mut annots = Vec::new();
    for word in words {
        if word.external_link.is_none() && word.internal_link.is_none() {
            continue;
        }
        let mut annot = dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "Border" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(0)],
            "Rect" => vec![
                real(word.x),
                real(word.y),
                real(word.x + word.width),
                real(word.y + word.height),
            ],
        };
        if let Some(uri) = &word.external_link {
            annot.set(
                "A",
                dictionary! {
                    "Type" => "Action",
                    "S" => "URI",
                    "URI" => Object::string_literal(uri.as_str()),
                },
            );
        }
        if let Some((target, (x, y))) = word.internal_link {
            // The target index was checked against the page count during
            // recipe validation.
            annot.set(
                "Dest",
                vec![
                    Object::Reference(page_ids[target]),
                    Object::Name(b"XYZ".to_vec()),
                    real(x),
                    real(y),
                    Object::Integer(0),
                ],
            );
        }
        annots.push(Object::Dictionary(annot));
    }
    annots
}

/// Command line rewriting the staged document into its final form. qpdf
/// must not recompress or renormalize: image and content streams are
/// already exactly what the recipe asked for.
fn qpdf_argv(
    options: &BuildOptions,
    staged: &Path,
    out_path: &Path,
) -> Result<Vec<OsString>, BuildError> {
    let mut argv: Vec<OsString> = vec![
        options.qpdf_command.clone().into(),
        "--stream-data=preserve".into(),
        "--object-streams=preserve".into(),
        "--normalize-content=n".into(),
        "--newline-before-endstream".into(),
    ];
    if options.linearize {
        argv.push("--linearize".into());
    }
    argv.push(absolute_arg(staged)?);
    argv.push(absolute_arg(out_path)?);
    Ok(argv)
}

/// Save the assembled document to scratch space and run qpdf over it to
/// produce the final file at `out_path`.
pub(crate) async fn write_document(
    mut document: Document,
    out_path: &Path,
    options: &BuildOptions,
    runner: &CommandRunner,
) -> Result<(), BuildError> {
    let scratch = options.scratch_tempdir()?;
    let staged = scratch.path().join("temp.pdf");
    document.save(&staged).map_err(|err| BuildError::pdf(err.into()))?;
    let argv = qpdf_argv(options, &staged, out_path)?;
    runner.run(&argv, None).await?;
    debug!(outfile = %out_path.display(), "document written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::bundle::BundleBuilder;
    use crate::recipe::TextDirection;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn options() -> BuildOptions {
        BuildOptions::builder().build().unwrap()
    }

    fn fake_image(tag: &str) -> Arc<PdfObjectBundle> {
        let mut builder = BundleBuilder::new();
        let root = builder.add(Object::Stream(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 8,
                "Height" => 8,
            },
            tag.as_bytes().to_vec(),
        )));
        Arc::new(builder.finish(root))
    }

    fn blank_page(width: f64, height: f64) -> ResolvedPage {
        ResolvedPage {
            width,
            height,
            color: Rgb::WHITE,
            thumbnail: None,
            background: None,
            foreground: Vec::new(),
            text: Vec::new(),
        }
    }

    fn word(text: &str) -> TextRecipe {
        TextRecipe {
            x: 10.0,
            y: 20.0,
            width: 50.0,
            height: 12.0,
            rotation: 0.0,
            text: text.to_string(),
            external_link: None,
            internal_link: None,
            direction: TextDirection::Ltr,
        }
    }

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .expect("valid zlib stream");
        out
    }

    fn page_dicts(document: &Document) -> Vec<Dictionary> {
        document
            .get_pages()
            .into_values()
            .map(|id| {
                document
                    .get_object(id)
                    .and_then(Object::as_dict)
                    .expect("page object")
                    .clone()
            })
            .collect()
    }

    #[test]
    fn blank_page_stays_minimal() {
        let document = assemble_document(&[finish_page(blank_page(612.0, 792.0))], &options());
        assert_eq!(document.version, "1.5");
        let pages = page_dicts(&document);
        assert_eq!(pages.len(), 1);
        let page = &pages[0];
        assert!(!page.has(b"Contents"));
        assert!(!page.has(b"Thumb"));
        assert!(!page.has(b"Annots"));
        let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
        assert_eq!(media_box[0].as_i64().unwrap(), 0);
        assert_eq!(media_box[2].as_float().unwrap(), 612.0);
        assert_eq!(media_box[3].as_float().unwrap(), 792.0);
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        assert!(!resources.has(b"XObject"));
        assert!(!resources.has(b"Font"));
        // The colorspace reference must resolve to the ICCBased array.
        let colorspace = resources.get(b"ColorSpace").unwrap().as_dict().unwrap();
        let default_rgb = colorspace.get(b"DefaultRGB").unwrap().as_reference().unwrap();
        let array = document
            .get_object(default_rgb)
            .and_then(Object::as_array)
            .unwrap();
        assert_eq!(array[0].as_name().unwrap(), b"ICCBased");
        // The page is still part of a transparency group.
        let group = page.get(b"Group").unwrap().as_reference().unwrap();
        let group = document.get_object(group).and_then(Object::as_dict).unwrap();
        assert_eq!(group.get(b"S").unwrap().as_name().unwrap(), b"Transparency");
    }

    #[test]
    fn xobject_slots_follow_draw_order() {
        let mut page = blank_page(100.0, 100.0);
        page.background = Some(fake_image("bg"));
        page.foreground = vec![
            ResolvedLayer {
                mask: Some(fake_image("mask")),
                image: fake_image("masked"),
                color: None,
            },
            ResolvedLayer {
                mask: None,
                image: fake_image("stencil"),
                color: Some(Rgb([255, 0, 0])),
            },
        ];
        let built = finish_page(page);
        assert_eq!(built.content.image_slots, 4);

        let document = assemble_document(&[built], &options());
        let page = &page_dicts(&document)[0];
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let names: Vec<String> = xobjects
            .iter()
            .map(|(key, _)| String::from_utf8_lossy(key).into_owned())
            .collect();
        assert_eq!(names, ["Im0", "Im1", "Im2", "Im3"]);
        for slot in ["Im0", "Im1", "Im2", "Im3"] {
            let id = xobjects.get(slot.as_bytes()).unwrap().as_reference().unwrap();
            assert!(document.get_object(id).unwrap().as_stream().is_ok());
        }
    }

    #[test]
    fn shared_images_are_imported_once() {
        let shared = fake_image("scan");
        let mut first = blank_page(10.0, 10.0);
        first.background = Some(Arc::clone(&shared));
        let mut second = blank_page(10.0, 10.0);
        second.background = Some(shared);

        let document = assemble_document(
            &[finish_page(first), finish_page(second)],
            &options(),
        );
        let pages = page_dicts(&document);
        let reference = |page: &Dictionary| {
            page.get(b"Resources")
                .and_then(Object::as_dict)
                .and_then(|r| r.get(b"XObject"))
                .and_then(Object::as_dict)
                .and_then(|x| x.get(b"Im0"))
                .and_then(Object::as_reference)
                .unwrap()
        };
        assert_eq!(reference(&pages[0]), reference(&pages[1]));
    }

    #[test]
    fn page_streams_deflate_by_default() {
        let mut page = blank_page(100.0, 200.0);
        page.color = Rgb([0, 0, 0]);
        let built = finish_page(page);
        let expected = built.content.stream.clone();

        let document = assemble_document(&[built], &options());
        let page = &page_dicts(&document)[0];
        let contents = page.get(b"Contents").unwrap().as_reference().unwrap();
        let stream = document
            .get_object(contents)
            .and_then(Object::as_stream)
            .unwrap();
        let filter = stream.dict.get(b"Filter").unwrap().as_array().unwrap();
        assert_eq!(filter[0].as_name().unwrap(), b"FlateDecode");
        assert_eq!(inflate(&stream.content), expected.as_bytes());
    }

    #[test]
    fn page_stream_compression_can_be_disabled() {
        let options = BuildOptions::builder()
            .compress_page_streams(false)
            .build()
            .unwrap();
        let mut page = blank_page(100.0, 200.0);
        page.color = Rgb([0, 0, 0]);
        let built = finish_page(page);
        let expected = built.content.stream.clone();

        let document = assemble_document(&[built], &options);
        let page = &page_dicts(&document)[0];
        let contents = page.get(b"Contents").unwrap().as_reference().unwrap();
        let stream = document
            .get_object(contents)
            .and_then(Object::as_stream)
            .unwrap();
        assert!(!stream.dict.has(b"Filter"));
        assert_eq!(stream.content, expected.as_bytes());
    }

    #[test]
    fn uri_words_become_link_annotations() {
        let mut page = blank_page(100.0, 100.0);
        let mut linked = word("click");
        linked.external_link = Some("https://example.com/a".to_string());
        page.text = vec![linked];

        let document = assemble_document(&[finish_page(page)], &options());
        let page = &page_dicts(&document)[0];
        let annots = page.get(b"Annots").unwrap().as_array().unwrap();
        assert_eq!(annots.len(), 1);
        let annot = annots[0].as_dict().unwrap();
        assert_eq!(annot.get(b"Subtype").unwrap().as_name().unwrap(), b"Link");
        let border = annot.get(b"Border").unwrap().as_array().unwrap();
        assert_eq!(border.len(), 3);
        assert_eq!(border[0].as_i64().unwrap(), 0);
        let rect = annot.get(b"Rect").unwrap().as_array().unwrap();
        assert_eq!(rect[0].as_float().unwrap(), 10.0);
        assert_eq!(rect[2].as_float().unwrap(), 60.0);
        assert_eq!(rect[3].as_float().unwrap(), 32.0);
        let action = annot.get(b"A").unwrap().as_dict().unwrap();
        assert_eq!(action.get(b"S").unwrap().as_name().unwrap(), b"URI");
        assert_eq!(
            action.get(b"URI").unwrap().as_str().unwrap(),
            b"https://example.com/a"
        );
        assert!(!annot.has(b"Dest"));
        // The visible word also produced a text layer, so the font is there.
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        assert!(resources.has(b"Font"));
    }

    #[test]
    fn links_survive_words_with_empty_text() {
        let mut page = blank_page(100.0, 100.0);
        let mut linked = word("");
        linked.external_link = Some("https://example.com".to_string());
        page.text = vec![linked];

        let document = assemble_document(&[finish_page(page)], &options());
        let page = &page_dicts(&document)[0];
        assert!(page.has(b"Annots"));
        // No drawn text, no painted layer: the page has no content stream
        // and no font resource.
        assert!(!page.has(b"Contents"));
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        assert!(!resources.has(b"Font"));
    }

    #[test]
    fn internal_links_reference_the_target_page() {
        let mut first = blank_page(100.0, 100.0);
        let mut linked = word("next");
        linked.internal_link = Some((1, (5.0, 7.0)));
        first.text = vec![linked];
        let second = blank_page(100.0, 100.0);

        let document = assemble_document(
            &[finish_page(first), finish_page(second)],
            &options(),
        );
        let pages: Vec<ObjectId> = document.get_pages().into_values().collect();
        let page = document
            .get_object(pages[0])
            .and_then(Object::as_dict)
            .unwrap();
        let annots = page.get(b"Annots").unwrap().as_array().unwrap();
        let dest = annots[0]
            .as_dict()
            .unwrap()
            .get(b"Dest")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(dest[0].as_reference().unwrap(), pages[1]);
        assert_eq!(dest[1].as_name().unwrap(), b"XYZ");
        assert_eq!(dest[2].as_float().unwrap(), 5.0);
        assert_eq!(dest[3].as_float().unwrap(), 7.0);
        assert_eq!(dest[4].as_i64().unwrap(), 0);
    }

    #[test]
    fn font_is_imported_once_for_the_whole_document() {
        let mut first = blank_page(100.0, 100.0);
        first.text = vec![word("one")];
        let mut second = blank_page(100.0, 100.0);
        second.text = vec![word("two")];

        let document = assemble_document(
            &[finish_page(first), finish_page(second)],
            &options(),
        );
        let pages = page_dicts(&document);
        let font = |page: &Dictionary| {
            page.get(b"Resources")
                .and_then(Object::as_dict)
                .and_then(|r| r.get(b"Font"))
                .and_then(Object::as_reference)
                .unwrap()
        };
        assert_eq!(font(&pages[0]), font(&pages[1]));
        let mapping = document
            .get_object(font(&pages[0]))
            .and_then(Object::as_dict)
            .unwrap();
        assert!(mapping.has(b"F1"));
    }

    #[test]
    fn thumbnails_attach_to_their_page() {
        let mut page = blank_page(100.0, 100.0);
        page.thumbnail = Some(fake_image("thumb"));

        let document = assemble_document(&[finish_page(page)], &options());
        let page = &page_dicts(&document)[0];
        let thumb = page.get(b"Thumb").unwrap().as_reference().unwrap();
        let stream = document
            .get_object(thumb)
            .and_then(Object::as_stream)
            .unwrap();
        assert_eq!(stream.content, b"thumb");
    }

    #[test]
    fn trailer_carries_id_and_pdfa_scaffolding() {
        let document = assemble_document(&[finish_page(blank_page(10.0, 10.0))], &options());

        let id = document.trailer.get(b"ID").unwrap().as_array().unwrap();
        assert_eq!(id.len(), 2);
        let first = id[0].as_str().unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first, id[1].as_str().unwrap());

        let root = document.trailer.get(b"Root").unwrap().as_reference().unwrap();
        let root = document.get_object(root).and_then(Object::as_dict).unwrap();
        let mark_info = root.get(b"MarkInfo").unwrap().as_dict().unwrap();
        assert!(mark_info.get(b"Marked").unwrap().as_bool().unwrap());
        let tree = root.get(b"StructTreeRoot").unwrap().as_dict().unwrap();
        assert_eq!(tree.get(b"Type").unwrap().as_name().unwrap(), b"StructTreeRoot");

        let metadata = root.get(b"Metadata").unwrap().as_reference().unwrap();
        let metadata = document
            .get_object(metadata)
            .and_then(Object::as_stream)
            .unwrap();
        assert_eq!(
            metadata.dict.get(b"Subtype").unwrap().as_name().unwrap(),
            b"XML"
        );
        assert_eq!(
            metadata.dict.get(b"Length1").unwrap().as_i64().unwrap(),
            XMP_PACKET.len() as i64
        );
        let packet = String::from_utf8(inflate(&metadata.content)).unwrap();
        assert!(packet.contains("<pdfaid:part>2</pdfaid:part>"));
        assert!(packet.contains("<pdfaid:conformance>A</pdfaid:conformance>"));
    }

    #[test]
    fn qpdf_preserves_streams_and_linearizes() {
        let argv = qpdf_argv(
            &options(),
            Path::new("/scratch/temp.pdf"),
            Path::new("/out/final.pdf"),
        )
        .unwrap();
        let argv: Vec<String> = argv
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            [
                "qpdf",
                "--stream-data=preserve",
                "--object-streams=preserve",
                "--normalize-content=n",
                "--newline-before-endstream",
                "--linearize",
                "/scratch/temp.pdf",
                "/out/final.pdf"
            ]
        );
    }

    #[test]
    fn linearization_can_be_switched_off() {
        let options = BuildOptions::builder().linearize(false).build().unwrap();
        let argv = qpdf_argv(
            &options,
            Path::new("/scratch/temp.pdf"),
            Path::new("/out/final.pdf"),
        )
        .unwrap();
        assert!(!argv.iter().any(|arg| arg == "--linearize"));
    }
}
