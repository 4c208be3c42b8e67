//! Container-level metadata I/O.
//!
//! The writer encodes an image and places an XMP packet where each format
//! expects it. The reader pulls packets and PNG text back out, which the
//! CLI uses for `--show-xmp`.

mod reader;
mod writer;

pub use reader::{read_png_text, read_xmp, xmp_from_bytes};
pub use writer::{
    JPEG_QUALITY, PROMPT_KEYWORD, WEBP_QUALITY, WorkflowContext, XMP_KEYWORD, save_image,
};
