use std::path::PathBuf;

use thiserror::Error;

use crate::xmp::MetadataField;

/// Contract violations raised by the serializer, writer and orchestrator.
///
/// Library operations return [`anyhow::Result`]; these conditions stay
/// reachable through `err.downcast_ref::<SaveError>()`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveError {
    #[error("No images to save.")]
    NoImages,

    #[error("{field} has {len} value(s), no value for batch index {index}")]
    BatchIndexOutOfRange {
        field: MetadataField,
        index: usize,
        len: usize,
    },

    #[error("{} does not have the .{expected} extension", path.display())]
    ExtensionMismatch { path: PathBuf, expected: &'static str },

    #[error("XMP packet is {len} bytes, a JPEG APP1 segment holds at most {max}")]
    XmpTooLarge { len: usize, max: usize },

    #[error("Saving image outside the output folder is not allowed: {}", path.display())]
    OutsideOutputFolder { path: PathBuf },

    #[error("Counter for {filename} in {} is exhausted", folder.display())]
    CounterExhausted { folder: PathBuf, filename: String },

    #[error("Unknown image type: {0}")]
    UnknownImageType(String),
}
