//! # xmp-save
//!
//! Save batches of generated images as JPEG, PNG or WebP with an XMP
//! metadata packet embedded in each file. Metadata fields may hold one
//! value for the whole batch or one value per image.
//!
//! ## Quick Start
//!
//! The pipeline module plans file names, serializes XMP per batch item,
//! and writes every image:
//!
//! ```rust,no_run
//! use xmp_save::pipeline::{ImageType, OutputFolder, OutputKind, SaveRequest, save_images};
//! use xmp_save::xmp::XmpFields;
//!
//! fn main() -> anyhow::Result<()> {
//!     let images = vec![image::open("render_a.png")?, image::open("render_b.png")?];
//!
//!     let mut request = SaveRequest::new(ImageType::LosslessWebp);
//!     request.filename_prefix = "portraits/%width%x%height%".into();
//!     request.fields = XmpFields {
//!         creator: Some("Jane Doe".into()),
//!         // One title per image
//!         title: Some(vec!["Dawn", "Dusk"].into()),
//!         ..Default::default()
//!     };
//!
//!     let planner = OutputFolder::new("output", OutputKind::Output);
//!     let outcome = save_images(&planner, &images, &request)?;
//!     for record in outcome.records() {
//!         println!("{}/{}", record.subfolder, record.filename);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-Level Usage
//!
//! Build a packet and write a single file yourself:
//!
//! ```rust,no_run
//! use xmp_save::metadata::{read_xmp, save_image};
//! use xmp_save::pipeline::ImageType;
//! use xmp_save::xmp::{XmpFields, build_xmp};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let image = image::open("render.png")?;
//!     let fields = XmpFields {
//!         rights: Some("CC-BY 4.0".into()),
//!         ..Default::default()
//!     };
//!     let xmp = build_xmp(&fields, None, 0)?;
//!
//!     let path = Path::new("render.jpg");
//!     save_image(&image, ImageType::Jpeg, path, &xmp, None)?;
//!     assert_eq!(read_xmp(path)?, Some(xmp));
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Formats
//!
//! | Type | Extension | XMP location |
//! |------|-----------|--------------|
//! | `jpeg` | `.jpg` | APP1 segment |
//! | `png` | `.png` | compressed iTXt chunk |
//! | `png_with_workflow` | `.png` | compressed iTXt, plus prompt/workflow text chunks |
//! | `lossless_webp` | `.webp` | `XMP ` RIFF chunk |
//! | `webp` | `.webp` | `XMP ` RIFF chunk |
//!
//! ## Modules
//!
//! - [`config`]: Configuration types and loading/saving
//! - [`error`]: Typed failures reachable through `anyhow` downcasts
//! - [`metadata`]: Format-aware writer and XMP/PNG text reader
//! - [`pipeline`]: Batch orchestration, image types, and output path planning
//! - [`xmp`]: Metadata fields and XMP packet serialization

pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod xmp;

pub use error::SaveError;
