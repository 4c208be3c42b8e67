use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use img_parts::Bytes;
use img_parts::jpeg::{Jpeg, JpegSegment};
use img_parts::png::{Png, PngChunk};
use img_parts::riff::{RiffChunk, RiffContent};
use img_parts::webp::WebP;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::SaveError;
use crate::pipeline::ImageType;

/// JPEG encoder quality.
pub const JPEG_QUALITY: u8 = 95;
/// Lossy WebP encoder quality.
pub const WEBP_QUALITY: f32 = 95.0;

/// Namespace header that prefixes the XMP packet in a JPEG APP1 segment.
pub(crate) const XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
/// iTXt keyword of the XMP packet in PNG.
pub const XMP_KEYWORD: &str = "XML:com.adobe.xmp";
/// Text chunk keyword of the prompt graph in PNG.
pub const PROMPT_KEYWORD: &str = "prompt";

const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;

pub(crate) const CHUNK_ITXT: [u8; 4] = *b"iTXt";
pub(crate) const CHUNK_TEXT: [u8; 4] = *b"tEXt";
const CHUNK_IDAT: [u8; 4] = *b"IDAT";

pub(crate) const CHUNK_VP8X: [u8; 4] = *b"VP8X";
pub(crate) const CHUNK_XMP: [u8; 4] = *b"XMP ";
const VP8X_XMP_FLAG: u8 = 0x04;
const VP8X_ALPHA_FLAG: u8 = 0x10;

/// Host-supplied data that lets the generating workflow be rebuilt from a PNG.
///
/// Only embedded by [`ImageType::PngWithWorkflow`]; every other type
/// ignores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Prompt graph, stored as JSON under the `prompt` keyword.
    pub prompt: Option<Value>,
    /// Extra entries, each stored as JSON under its own key.
    pub extra_pnginfo: Option<Map<String, Value>>,
}

/// Encode `image` as `image_type` and write it to `path` with `xmp` embedded.
///
/// | Type | Encoding | XMP location |
/// |------|----------|--------------|
/// | JPEG | quality [`JPEG_QUALITY`] | APP1 segment after JFIF |
/// | PNG, PNG with workflow | lossless | compressed `iTXt` before `IDAT` |
/// | Lossless WebP | lossless | `XMP ` chunk, VP8X flagged |
/// | WebP | quality [`WEBP_QUALITY`] | `XMP ` chunk, VP8X flagged |
///
/// The file is flushed to disk before returning. Nothing is created when the
/// extension does not match `image_type` or encoding fails.
///
/// # Errors
///
/// - [`SaveError::ExtensionMismatch`] if `path` does not end in
///   `.{image_type.extension()}`
/// - [`SaveError::XmpTooLarge`] for a JPEG packet over one APP1 segment
/// - the encoder's [`image::ImageError`] for unsupported pixel layouts
/// - a libwebp failure for lossy WebP, such as a side over 16383 pixels.
///   Other pixel layouts are converted to 8-bit RGB(A) first
pub fn save_image(
    image: &DynamicImage,
    image_type: ImageType,
    path: &Path,
    xmp: &str,
    workflow: Option<&WorkflowContext>,
) -> Result<()> {
    check_extension(path, image_type)?;

    let bytes = match image_type {
        ImageType::Jpeg => encode_jpeg(image, xmp)?,
        ImageType::Png => encode_png(image, xmp, None)?,
        ImageType::PngWithWorkflow => encode_png(image, xmp, workflow)?,
        ImageType::LosslessWebp => encode_webp(image, xmp, true)?,
        ImageType::Webp => encode_webp(image, xmp, false)?,
    };

    write_file(path, &bytes)?;
    log::debug!(
        "Wrote {} ({image_type}, {} bytes, {} bytes XMP)",
        path.display(),
        bytes.len(),
        xmp.len()
    );
    Ok(())
}

fn check_extension(path: &Path, image_type: ImageType) -> Result<(), SaveError> {
    let expected = image_type.extension();
    let matches = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(expected));

    if matches {
        Ok(())
    } else {
        Err(SaveError::ExtensionMismatch {
            path: path.to_path_buf(),
            expected,
        })
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

// ============================================================================
// JPEG
// ============================================================================

fn encode_jpeg(image: &DynamicImage, xmp: &str) -> Result<Bytes> {
    // Segment length field covers itself, so contents top out at u16::MAX - 2
    let max = u16::MAX as usize - 2 - XMP_HEADER.len();
    if xmp.len() > max {
        return Err(SaveError::XmpTooLarge {
            len: xmp.len(),
            max,
        }
        .into());
    }

    let mut buf = Vec::new();
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))
        .context("Failed to encode JPEG")?;

    let mut jpeg = Jpeg::from_bytes(Bytes::from(buf))
        .map_err(|e| anyhow::anyhow!("Failed to parse encoded JPEG: {e}"))?;

    let mut contents = Vec::with_capacity(XMP_HEADER.len() + xmp.len());
    contents.extend_from_slice(XMP_HEADER);
    contents.extend_from_slice(xmp.as_bytes());
    let segment = JpegSegment::new_with_contents(MARKER_APP1, Bytes::from(contents));

    let segments = jpeg.segments_mut();
    let insert_pos = segments
        .iter()
        .position(|s| s.marker() == MARKER_APP0)
        .map(|p| p + 1)
        .unwrap_or(0);
    segments.insert(insert_pos, segment);

    Ok(jpeg.encoder().bytes())
}

// ============================================================================
// PNG
// ============================================================================

fn encode_png(
    image: &DynamicImage,
    xmp: &str,
    workflow: Option<&WorkflowContext>,
) -> Result<Bytes> {
    let mut buf = Vec::new();
    image
        .write_with_encoder(PngEncoder::new_with_quality(
            &mut buf,
            CompressionType::Default,
            FilterType::Adaptive,
        ))
        .context("Failed to encode PNG")?;

    let mut png = Png::from_bytes(Bytes::from(buf))
        .map_err(|e| anyhow::anyhow!("Failed to parse encoded PNG: {e}"))?;

    let mut text_chunks = vec![itxt_chunk(XMP_KEYWORD, xmp, true)?];
    if let Some(workflow) = workflow {
        text_chunks.extend(workflow_chunks(workflow)?);
    }

    let chunks = png.chunks_mut();
    let insert_pos = chunks
        .iter()
        .position(|c| c.kind() == CHUNK_IDAT)
        .unwrap_or(chunks.len().saturating_sub(1));
    chunks.splice(insert_pos..insert_pos, text_chunks);

    Ok(png.encoder().bytes())
}

/// Text chunks for the prompt graph and each extra-info entry, as JSON.
fn workflow_chunks(workflow: &WorkflowContext) -> Result<Vec<PngChunk>> {
    let mut chunks = Vec::new();

    if let Some(prompt) = &workflow.prompt {
        let json = serde_json::to_string(prompt).context("Failed to serialize prompt")?;
        chunks.push(text_chunk(PROMPT_KEYWORD, &json)?);
    }

    if let Some(extra) = &workflow.extra_pnginfo {
        for (key, value) in extra {
            let json = serde_json::to_string(value)
                .with_context(|| format!("Failed to serialize extra info {key}"))?;
            chunks.push(text_chunk(key, &json)?);
        }
    }

    Ok(chunks)
}

/// `tEXt` for ASCII payloads, uncompressed `iTXt` otherwise.
fn text_chunk(keyword: &str, text: &str) -> Result<PngChunk> {
    if !text.is_ascii() {
        return itxt_chunk(keyword, text, false);
    }
    check_keyword(keyword)?;

    let mut data = Vec::with_capacity(keyword.len() + 1 + text.len());
    data.extend_from_slice(keyword.as_bytes());
    data.push(0);
    data.extend_from_slice(text.as_bytes());
    Ok(PngChunk::new(CHUNK_TEXT, Bytes::from(data)))
}

/// Build an `iTXt` chunk, optionally zlib-compressed.
fn itxt_chunk(keyword: &str, text: &str, compressed: bool) -> Result<PngChunk> {
    check_keyword(keyword)?;

    let mut data = Vec::new();
    data.extend_from_slice(keyword.as_bytes());
    data.push(0);
    data.push(u8::from(compressed)); // compression flag
    data.push(0); // compression method: zlib
    data.push(0); // language tag
    data.push(0); // translated keyword

    if compressed {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(text.as_bytes())
            .context("Failed to compress text chunk")?;
        data.extend(encoder.finish().context("Failed to compress text chunk")?);
    } else {
        data.extend_from_slice(text.as_bytes());
    }

    Ok(PngChunk::new(CHUNK_ITXT, Bytes::from(data)))
}

/// PNG keywords are 1-79 printable Latin-1 bytes.
fn check_keyword(keyword: &str) -> Result<()> {
    let valid = (1..=79).contains(&keyword.len())
        && keyword.bytes().all(|b| (0x20..=0x7E).contains(&b));
    if !valid {
        anyhow::bail!("Invalid PNG text keyword: {keyword:?}");
    }
    Ok(())
}

// ============================================================================
// WebP
// ============================================================================

fn encode_webp(image: &DynamicImage, xmp: &str, lossless: bool) -> Result<Bytes> {
    let buf = if lossless {
        let mut buf = Vec::new();
        image
            .write_with_encoder(WebPEncoder::new_lossless(&mut buf))
            .context("Failed to encode lossless WebP")?;
        buf
    } else {
        // libwebp only takes 8-bit RGB or RGBA
        let pixels = match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => Cow::Borrowed(image),
            _ if image.color().has_alpha() => {
                Cow::Owned(DynamicImage::ImageRgba8(image.to_rgba8()))
            }
            _ => Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())),
        };
        let encoder = webp::Encoder::from_image(&pixels)
            .map_err(|e| anyhow::anyhow!("Failed to encode WebP: {e}"))?;
        encoder
            .encode_simple(false, WEBP_QUALITY)
            .map_err(|e| anyhow::anyhow!("Failed to encode WebP: {e:?}"))?
            .to_vec()
    };

    let mut container = WebP::from_bytes(Bytes::from(buf))
        .map_err(|e| anyhow::anyhow!("Failed to parse encoded WebP: {e}"))?;

    // Metadata chunks require the extended layout: VP8X first, flags set
    let existing_vp8x = container
        .chunks()
        .iter()
        .find(|c| c.id() == CHUNK_VP8X)
        .and_then(|c| match c.content() {
            RiffContent::Data(data) if data.len() >= 10 => Some(data.to_vec()),
            _ => None,
        });
    let vp8x = match existing_vp8x {
        Some(mut data) => {
            data[0] |= VP8X_XMP_FLAG;
            data
        }
        None => {
            let mut flags = VP8X_XMP_FLAG;
            if image.color().has_alpha() {
                flags |= VP8X_ALPHA_FLAG;
            }
            vp8x_payload(image.width(), image.height(), flags)
        }
    };

    let chunks = container.chunks_mut();
    chunks.retain(|c| c.id() != CHUNK_VP8X && c.id() != CHUNK_XMP);
    chunks.insert(
        0,
        RiffChunk::new(CHUNK_VP8X, RiffContent::Data(Bytes::from(vp8x))),
    );
    chunks.push(RiffChunk::new(
        CHUNK_XMP,
        RiffContent::Data(Bytes::copy_from_slice(xmp.as_bytes())),
    ));

    Ok(container.encoder().bytes())
}

/// VP8X payload: flags, 3 reserved bytes, 24-bit canvas width-1 and height-1.
fn vp8x_payload(width: u32, height: u32, flags: u8) -> Vec<u8> {
    let mut data = vec![0u8; 10];
    data[0] = flags;

    let w = width.saturating_sub(1) & 0xFF_FFFF;
    data[4..7].copy_from_slice(&w.to_le_bytes()[..3]);

    let h = height.saturating_sub(1) & 0xFF_FFFF;
    data[7..10].copy_from_slice(&h.to_le_bytes()[..3]);

    data
}
