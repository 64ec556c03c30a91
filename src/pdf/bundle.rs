//! Staged PDF object graphs.
//!
//! A [`PdfObjectBundle`] is a small set of PDF objects numbered in a private
//! id space, produced away from the output document — by a conversion task
//! running concurrently with many others, or by a resource builder that runs
//! before any page exists. Bundles reference each other through links:
//! a jbig2 page stream links the symbol dictionary it shares with its batch,
//! a clipped image links its stencil mask.
//!
//! [`BundleImporter`] moves bundles into the output [`Document`]. Each bundle
//! is imported at most once per importer, so a background shared by two
//! pages, or a dictionary shared by a whole batch, lands in the file as one
//! object no matter how many referrers it has.

use std::collections::HashMap;
use std::sync::Arc;

use lopdf::{Dictionary, Document, Object, ObjectId};

/// Objects in a private id space plus links into other bundles.
#[derive(Debug)]
pub(crate) struct PdfObjectBundle {
    objects: Vec<(u32, Object)>,
    root: u32,
    links: Vec<(u32, Arc<PdfObjectBundle>)>,
}

/// A finished image artifact: the XObject bundle and, when the converter
/// produced one, a thumbnail bundle.
#[derive(Clone, Debug)]
pub(crate) struct ImageArtifact {
    pub image: Arc<PdfObjectBundle>,
    pub thumbnail: Option<Arc<PdfObjectBundle>>,
}

/// Incrementally numbers and collects a bundle's objects. Ids start at 1;
/// references between objects in the same bundle are written as
/// `Object::Reference((local_id, 0))`.
pub(crate) struct BundleBuilder {
    objects: Vec<(u32, Object)>,
    links: Vec<(u32, Arc<PdfObjectBundle>)>,
    next_id: u32,
}

impl BundleBuilder {
    pub fn new() -> BundleBuilder {
        BundleBuilder {
            objects: Vec::new(),
            links: Vec::new(),
            next_id: 1,
        }
    }

    /// Reserve an id to be filled by [`insert`](Self::insert) later, for
    /// objects that reference each other.
    pub fn reserve(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: u32, object: Object) {
        self.objects.push((id, object));
    }

    pub fn add(&mut self, object: Object) -> u32 {
        let id = self.reserve();
        self.insert(id, object);
        id
    }

    /// Reserve an id that resolves to another bundle's root at import time.
    pub fn link(&mut self, bundle: Arc<PdfObjectBundle>) -> u32 {
        let id = self.reserve();
        self.links.push((id, bundle));
        id
    }

    pub fn finish(self, root: u32) -> PdfObjectBundle {
        PdfObjectBundle {
            objects: self.objects,
            root,
            links: self.links,
        }
    }
}

/// Imports bundles into one output document, deduplicating shared bundles
/// by identity.
///
/// The identity map keys on the bundle allocation, so the importer must not
/// outlive the artifacts it has seen; the assembler keeps every artifact
/// alive until the document is written.
pub(crate) struct BundleImporter {
    imported: HashMap<*const PdfObjectBundle, ObjectId>,
}

impl BundleImporter {
    pub fn new() -> BundleImporter {
        BundleImporter {
            imported: HashMap::new(),
        }
    }

    /// Move `bundle` (and, recursively, everything it links) into `document`
    /// and return the root's id there. Importing the same bundle again
    /// returns the previous id without adding objects.
    pub fn import(&mut self, document: &mut Document, bundle: &Arc<PdfObjectBundle>) -> ObjectId {
        if let Some(&root) = self.imported.get(&Arc::as_ptr(bundle)) {
            return root;
        }
        let mut id_map: HashMap<u32, ObjectId> = HashMap::new();
        for (local, linked) in &bundle.links {
            let target = self.import(document, linked);
            id_map.insert(*local, target);
        }
        for (local, _) in &bundle.objects {
            id_map.insert(*local, document.new_object_id());
        }
        for (local, object) in &bundle.objects {
            let mut object = object.clone();
            remap_references(&mut object, &id_map);
            document.objects.insert(id_map[local], object);
        }
        let root = id_map[&bundle.root];
        self.imported.insert(Arc::as_ptr(bundle), root);
        root
    }
}

fn remap_references(object: &mut Object, id_map: &HashMap<u32, ObjectId>) {
    match object {
        Object::Reference(id) => {
            if let Some(&target) = id_map.get(&id.0) {
                *id = target;
            }
        }
        Object::Array(items) => {
            for item in items {
                remap_references(item, id_map);
            }
        }
        Object::Dictionary(dict) => remap_dictionary(dict, id_map),
        Object::Stream(stream) => remap_dictionary(&mut stream.dict, id_map),
        _ => {}
    }
}

fn remap_dictionary(dict: &mut Dictionary, id_map: &HashMap<u32, ObjectId>) {
    for (_, value) in dict.iter_mut() {
        remap_references(value, id_map);
    }
}
