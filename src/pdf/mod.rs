//! PDF object construction.
//!
//! Artifacts are produced concurrently but the output document is one
//! mutable object table, so results are staged: conversion steps build
//! self-contained [`bundle::PdfObjectBundle`]s in a private id space, and the
//! assembler imports them into the final [`lopdf::Document`] exactly once
//! each, in page order. [`content`] renders content-stream text, [`harvest`]
//! lifts image XObjects out of ImageMagick's output, [`resources`] fabricates
//! the document-wide font and colorspace objects, and [`assemble`] ties the
//! pages and document metadata together.

pub(crate) mod assemble;
pub(crate) mod bundle;
pub(crate) mod content;
pub(crate) mod harvest;
pub(crate) mod resources;

pub(crate) use bundle::{ImageArtifact, PdfObjectBundle};
