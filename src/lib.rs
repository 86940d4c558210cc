//! Tortilla: a single-file container for many same-format assets.
//!
//! A tortilla bundles files (primarily geospatial rasters) into one binary
//! blob built for random range access, locally or over HTTP. The file ends
//! with a compressed columnar footer describing every item, so catalogs can
//! be read without touching the data region.
//!
//! The usual round trip: describe sources with [`datamodel::Samples`],
//! write them with [`create`], read the per-item metadata back with
//! [`load`], pick rows, and materialize the subset with [`compile()`].
pub use tortilla_footer;

pub mod compile;
pub mod datamodel;
pub mod error;
pub mod header;
pub mod reader;
pub mod source;
pub mod utils;
pub mod writer;

pub use compile::{compile, CompileOptions};
pub use error::TortillaError;
pub use reader::{lazy_load, load, load_many, Item, TortillaTable};
pub use writer::{create, CreateOptions};
