//! Recover image XObjects from converter output.
//!
//! ImageMagick encodes each source image as a one-page PDF; that page's
//! single image XObject already carries the right filter chain (DCTDecode,
//! CCITTFaxDecode, FlateDecode, ...), so instead of re-encoding we lift the
//! object tree out of the loaded document into a [`PdfObjectBundle`] and
//! normalise the few keys the final document wants different.

use std::path::Path;
use std::sync::Arc;

use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::error::BuildError;
use crate::pdf::bundle::{BundleBuilder, ImageArtifact, PdfObjectBundle};

/// Lift the page's image out of `path` (a converter-produced PDF).
///
/// With `image_mask` set the image is turned into a bitonal stencil; a
/// `mask` bundle, when given, is attached as the image's `/Mask`. The
/// thumbnail is harvested from the page's `/Thumb` when the converter
/// emitted one.
pub(crate) fn harvest_image(
    path: &Path,
    image_mask: bool,
    mask: Option<&Arc<PdfObjectBundle>>,
) -> Result<ImageArtifact, BuildError> {
    let document = Document::load(path).map_err(BuildError::pdf)?;
    let page = first_page(&document)?;

    let resources = resolved_dict(&document, page, b"Resources")?.ok_or_else(|| {
        BuildError::Pdf {
            detail: "converter output has no page resources".into(),
        }
    })?;
    let xobjects = resolved_dict(&document, resources, b"XObject")?.ok_or_else(|| {
        BuildError::Pdf {
            detail: "converter output has no image XObject".into(),
        }
    })?;
    if xobjects.len() != 1 {
        return Err(BuildError::Pdf {
            detail: format!(
                "expected exactly one image from ImageMagick, found {}",
                xobjects.len()
            ),
        });
    }
    let (_, entry) = xobjects.iter().next().expect("len checked above");
    let image_id = entry.as_reference().map_err(BuildError::pdf)?;

    let image = lift_image(&document, image_id, image_mask, mask)?;
    let thumbnail = match page.get(b"Thumb") {
        Ok(thumb) => {
            let thumb_id = thumb.as_reference().map_err(BuildError::pdf)?;
            Some(lift_thumbnail(&document, thumb_id)?)
        }
        Err(_) => None,
    };
    Ok(ImageArtifact { image, thumbnail })
}

fn first_page(document: &Document) -> Result<&Dictionary, BuildError> {
    let page_id = document
        .get_pages()
        .into_values()
        .next()
        .ok_or_else(|| BuildError::Pdf {
            detail: "converter output has no pages".into(),
        })?;
    document
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(BuildError::pdf)
}

/// Fetch `key` from `dict`, following one reference if needed.
fn resolved_dict<'a>(
    document: &'a Document,
    dict: &'a Dictionary,
    key: &[u8],
) -> Result<Option<&'a Dictionary>, BuildError> {
    let Ok(value) = dict.get(key) else {
        return Ok(None);
    };
    let value = match value {
        Object::Reference(id) => document.get_object(*id).map_err(BuildError::pdf)?,
        direct => direct,
    };
    value.as_dict().map(Some).map_err(BuildError::pdf)
}

fn lift_image(
    document: &Document,
    image_id: ObjectId,
    image_mask: bool,
    mask: Option<&Arc<PdfObjectBundle>>,
) -> Result<Arc<PdfObjectBundle>, BuildError> {
    let mut lifter = Lifter::new(document);
    let root = lifter.builder.reserve();

    let mut stream = document
        .get_object(image_id)
        .and_then(Object::as_stream)
        .map_err(BuildError::pdf)?
        .clone();
    stream.dict.remove(b"Name");
    normalise_stream_dict(document, &mut stream)?;
    if image_mask {
        stream.dict.set("ImageMask", true);
        stream.dict.remove(b"ColorSpace");
        let bits = resolved_i64(document, &stream.dict, b"BitsPerComponent")?;
        if bits != Some(1) {
            return Err(BuildError::Pdf {
                detail: "expected bitonal image from ImageMagick".into(),
            });
        }
    }
    if let Some(mask) = mask {
        let link = lifter.builder.link(Arc::clone(mask));
        stream.dict.set("Mask", Object::Reference((link, 0)));
    }

    let mut object = Object::Stream(stream);
    lifter.rewrite(&mut object)?;
    lifter.builder.insert(root, object);
    Ok(Arc::new(lifter.builder.finish(root)))
}

fn lift_thumbnail(
    document: &Document,
    thumb_id: ObjectId,
) -> Result<Arc<PdfObjectBundle>, BuildError> {
    let mut lifter = Lifter::new(document);
    let root = lifter.builder.reserve();

    let mut stream = document
        .get_object(thumb_id)
        .and_then(Object::as_stream)
        .map_err(BuildError::pdf)?
        .clone();
    normalise_stream_dict(document, &mut stream)?;

    let mut object = Object::Stream(stream);
    lifter.rewrite(&mut object)?;
    lifter.builder.insert(root, object);
    Ok(Arc::new(lifter.builder.finish(root)))
}

/// Make `Length` direct and inline one level of `ColorSpace` indirection,
/// so the keys survive outside the source document.
fn normalise_stream_dict(document: &Document, stream: &mut lopdf::Stream) -> Result<(), BuildError> {
    stream.dict.set("Length", stream.content.len() as i64);
    // Harvested content keeps the converter's filter chain as-is.
    stream.allows_compression = false;
    if let Ok(Object::Reference(id)) = stream.dict.get(b"ColorSpace") {
        let resolved = document.get_object(*id).map_err(BuildError::pdf)?.clone();
        stream.dict.set("ColorSpace", resolved);
    }
    Ok(())
}

fn resolved_i64(
    document: &Document,
    dict: &Dictionary,
    key: &[u8],
) -> Result<Option<i64>, BuildError> {
    let Ok(value) = dict.get(key) else {
        return Ok(None);
    };
    let value = match value {
        Object::Reference(id) => document.get_object(*id).map_err(BuildError::pdf)?,
        direct => direct,
    };
    value.as_i64().map(Some).map_err(BuildError::pdf)
}

/// Copies the transitive closure of references out of a loaded document
/// into a bundle's private id space.
struct Lifter<'a> {
    document: &'a Document,
    builder: BundleBuilder,
    mapped: std::collections::HashMap<ObjectId, u32>,
}

impl<'a> Lifter<'a> {
    fn new(document: &'a Document) -> Lifter<'a> {
        Lifter {
            document,
            builder: BundleBuilder::new(),
            mapped: std::collections::HashMap::new(),
        }
    }

    fn lift(&mut self, id: ObjectId) -> Result<u32, BuildError> {
        if let Some(&local) = self.mapped.get(&id) {
            return Ok(local);
        }
        let local = self.builder.reserve();
        // Mapped before the walk, so reference cycles terminate.
        self.mapped.insert(id, local);
        let mut object = self.document.get_object(id).map_err(BuildError::pdf)?.clone();
        self.rewrite(&mut object)?;
        self.builder.insert(local, object);
        Ok(local)
    }

    fn rewrite(&mut self, object: &mut Object) -> Result<(), BuildError> {
        match object {
            Object::Reference(id) => {
                let local = self.lift(*id)?;
                *id = (local, 0);
            }
            Object::Array(items) => {
                for item in items {
                    self.rewrite(item)?;
                }
            }
            Object::Dictionary(dict) => {
                for (_, value) in dict.iter_mut() {
                    self.rewrite(value)?;
                }
            }
            Object::Stream(stream) => {
                for (_, value) in stream.dict.iter_mut() {
                    self.rewrite(value)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::bundle::BundleImporter;
    use lopdf::{dictionary, Stream};

    /// A document shaped like ImageMagick's output: one page, one image
    /// XObject, indirect ColorSpace.
    fn converter_document(extra_xobject: bool) -> Document {
        let mut doc = Document::with_version("1.5");
        let icc = doc.add_object(Stream::new(dictionary! { "N" => 3 }, b"icc".to_vec()));
        let colorspace = doc.add_object(Object::Array(vec![
            Object::Name(b"ICCBased".to_vec()),
            Object::Reference(icc),
        ]));
        let image = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Name" => "Im0",
                "Width" => 2,
                "Height" => 2,
                "BitsPerComponent" => 8,
                "ColorSpace" => Object::Reference(colorspace),
            },
            vec![0u8; 12],
        ));
        let mut xobjects = dictionary! { "Im0" => Object::Reference(image) };
        if extra_xobject {
            let second = doc.add_object(Stream::new(
                dictionary! { "Subtype" => "Image" },
                vec![0u8; 4],
            ));
            xobjects.set("Im1", Object::Reference(second));
        }
        let pages_id = doc.new_object_id();
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 2.into(), 2.into()],
            "Resources" => dictionary! { "XObject" => xobjects },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page)],
                "Count" => 1,
            }),
        );
        let catalog = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", catalog);
        doc
    }

    fn bitonal_document() -> Document {
        let mut doc = Document::with_version("1.5");
        let image = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Name" => "Im0",
                "Width" => 2,
                "Height" => 2,
                "BitsPerComponent" => 1,
                "ColorSpace" => "DeviceGray",
            },
            vec![0u8; 1],
        ));
        let pages_id = doc.new_object_id();
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => Object::Reference(image) },
            },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page)],
                "Count" => 1,
            }),
        );
        let catalog = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", catalog);
        doc
    }

    fn save(mut doc: Document) -> tempfile::TempPath {
        let file = tempfile::NamedTempFile::new().unwrap();
        doc.save(file.path()).unwrap();
        file.into_temp_path()
    }

    fn import_root(bundle: &Arc<PdfObjectBundle>) -> (Document, ObjectId) {
        let mut document = Document::with_version("1.5");
        let root = BundleImporter::new().import(&mut document, bundle);
        (document, root)
    }

    #[test]
    fn harvest_strips_the_name_and_inlines_colorspace() {
        let path = save(converter_document(false));
        let artifact = harvest_image(&path, false, None).unwrap();

        let (document, root) = import_root(&artifact.image);
        let stream = document.get_object(root).unwrap().as_stream().unwrap();
        assert!(stream.dict.get(b"Name").is_err());
        assert_eq!(stream.dict.get(b"Length").unwrap().as_i64().unwrap(), 12);
        // ColorSpace is inline, its ICC stream hangs off it by reference.
        let colorspace = stream.dict.get(b"ColorSpace").unwrap().as_array().unwrap();
        assert_eq!(colorspace[0].as_name().unwrap(), b"ICCBased");
        let icc_id = colorspace[1].as_reference().unwrap();
        let icc = document.get_object(icc_id).unwrap().as_stream().unwrap();
        assert_eq!(icc.content, b"icc");
        assert!(artifact.thumbnail.is_none());
    }

    #[test]
    fn two_xobjects_are_rejected() {
        let path = save(converter_document(true));
        let err = harvest_image(&path, false, None).unwrap_err();
        assert!(matches!(err, BuildError::Pdf { .. }));
    }

    #[test]
    fn stencil_harvest_sets_image_mask_and_drops_colorspace() {
        let path = save(bitonal_document());
        let artifact = harvest_image(&path, true, None).unwrap();

        let (document, root) = import_root(&artifact.image);
        let stream = document.get_object(root).unwrap().as_stream().unwrap();
        assert!(stream.dict.get(b"ImageMask").unwrap().as_bool().unwrap());
        assert!(stream.dict.get(b"ColorSpace").is_err());
    }

    #[test]
    fn stencil_harvest_rejects_multibit_images() {
        let path = save(converter_document(false));
        let err = harvest_image(&path, true, None).unwrap_err();
        assert!(matches!(err, BuildError::Pdf { .. }));
    }

    #[test]
    fn mask_bundle_is_attached_by_reference() {
        let mut builder = BundleBuilder::new();
        let mask_root = builder.add(Object::Stream(Stream::new(
            dictionary! { "ImageMask" => true },
            vec![0u8; 1],
        )));
        let mask = Arc::new(builder.finish(mask_root));

        let path = save(converter_document(false));
        let artifact = harvest_image(&path, false, Some(&mask)).unwrap();

        let (document, root) = import_root(&artifact.image);
        let stream = document.get_object(root).unwrap().as_stream().unwrap();
        let mask_id = stream.dict.get(b"Mask").unwrap().as_reference().unwrap();
        let mask_stream = document.get_object(mask_id).unwrap().as_stream().unwrap();
        assert!(mask_stream.dict.get(b"ImageMask").unwrap().as_bool().unwrap());
    }
}
