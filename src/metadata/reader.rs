use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use img_parts::Bytes;
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::riff::RiffContent;
use img_parts::webp::WebP;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use super::writer::{CHUNK_ITXT, CHUNK_TEXT, CHUNK_XMP, XMP_HEADER, XMP_KEYWORD};

const CHUNK_ZTXT: [u8; 4] = *b"zTXt";
const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

/// Read the embedded XMP packet of a JPEG, PNG or WebP file.
///
/// Returns `Ok(None)` when the file carries no XMP.
pub fn read_xmp(path: &Path) -> Result<Option<String>> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    xmp_from_bytes(Bytes::from(data))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Extract the XMP packet from an in-memory image file.
///
/// The container is detected from its magic bytes, not a file name.
pub fn xmp_from_bytes(data: Bytes) -> Result<Option<String>> {
    if data.starts_with(&[0xFF, 0xD8]) {
        let jpeg = Jpeg::from_bytes(data).map_err(|e| anyhow::anyhow!("Invalid JPEG: {e}"))?;
        let packet = jpeg
            .segments()
            .iter()
            .find_map(|s| s.contents().strip_prefix(XMP_HEADER).map(<[u8]>::to_vec));
        return packet.map(utf8).transpose();
    }

    if data.starts_with(PNG_SIGNATURE) {
        let png = Png::from_bytes(data).map_err(|e| anyhow::anyhow!("Invalid PNG: {e}"))?;
        for chunk in png.chunks() {
            if chunk.kind() == CHUNK_ITXT {
                let (keyword, text) = parse_itxt(chunk.contents())?;
                if keyword == XMP_KEYWORD {
                    return Ok(Some(text));
                }
            }
        }
        return Ok(None);
    }

    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        let webp = WebP::from_bytes(data).map_err(|e| anyhow::anyhow!("Invalid WebP: {e}"))?;
        let packet = webp
            .chunks()
            .iter()
            .filter(|c| c.id() == CHUNK_XMP)
            .find_map(|c| match c.content() {
                RiffContent::Data(bytes) => Some(bytes.to_vec()),
                _ => None,
            });
        return packet.map(utf8).transpose();
    }

    anyhow::bail!("Unsupported image container")
}

/// Collect every textual chunk of a PNG as keyword → text.
///
/// `tEXt`, `zTXt` and `iTXt` are all decoded; later chunks win on
/// duplicate keywords.
pub fn read_png_text(path: &Path) -> Result<BTreeMap<String, String>> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let png = Png::from_bytes(Bytes::from(data))
        .map_err(|e| anyhow::anyhow!("Invalid PNG {}: {e}", path.display()))?;

    let mut entries = BTreeMap::new();
    for chunk in png.chunks() {
        let contents = chunk.contents();
        let (keyword, text) = match chunk.kind() {
            CHUNK_TEXT => {
                let (keyword, rest) = split_nul(contents)?;
                (latin1(keyword), latin1(rest))
            }
            CHUNK_ZTXT => {
                let (keyword, rest) = split_nul(contents)?;
                // First byte is the compression method
                let inflated = inflate(rest.get(1..).unwrap_or_default())?;
                (latin1(keyword), latin1(&inflated))
            }
            CHUNK_ITXT => parse_itxt(contents)?,
            _ => continue,
        };
        entries.insert(keyword, text);
    }

    Ok(entries)
}

/// Decode an `iTXt` payload into keyword and UTF-8 text.
fn parse_itxt(contents: &[u8]) -> Result<(String, String)> {
    let (keyword, rest) = split_nul(contents)?;
    anyhow::ensure!(rest.len() >= 2, "Truncated iTXt chunk");

    let compressed = rest[0] == 1;
    let (_language, rest) = split_nul(&rest[2..])?;
    let (_translated, text) = split_nul(rest)?;

    let text = if compressed {
        utf8(inflate(text)?)?
    } else {
        utf8(text.to_vec())?
    };
    Ok((latin1(keyword), text))
}

fn split_nul(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let pos = data
        .iter()
        .position(|&b| b == 0)
        .context("Missing NUL separator in text chunk")?;
    Ok((&data[..pos], &data[pos + 1..]))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .context("Failed to inflate text chunk")?;
    Ok(out)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).context("XMP packet is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use img_parts::png::PngChunk;
    use std::io::Write;
    use tempfile::TempDir;

    fn blank_png() -> Png {
        let mut buf = Vec::new();
        image::DynamicImage::new_rgb8(2, 2)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        Png::from_bytes(Bytes::from(buf)).unwrap()
    }

    fn write_png(dir: &TempDir, name: &str, extra: Vec<PngChunk>) -> std::path::PathBuf {
        let mut png = blank_png();
        let chunks = png.chunks_mut();
        let idat = chunks.iter().position(|c| c.kind() == *b"IDAT").unwrap();
        for (offset, chunk) in extra.into_iter().enumerate() {
            chunks.insert(idat + offset, chunk);
        }
        let path = dir.path().join(name);
        std::fs::write(&path, png.encoder().bytes()).unwrap();
        path
    }

    // ── read_png_text ────────────────────────────────────────────────

    #[test]
    fn reads_all_text_chunk_kinds() {
        let dir = TempDir::new().unwrap();

        let mut ztxt = b"Comment\0\0".to_vec();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"squeezed").unwrap();
        ztxt.extend(encoder.finish().unwrap());

        let itxt = "Title\0\0\0en\0Titel\0Grüße".as_bytes().to_vec();

        let path = write_png(
            &dir,
            "text.png",
            vec![
                PngChunk::new(CHUNK_TEXT, Bytes::from_static(b"Author\0Jane")),
                PngChunk::new(CHUNK_ZTXT, Bytes::from(ztxt)),
                PngChunk::new(CHUNK_ITXT, Bytes::from(itxt)),
            ],
        );

        let text = read_png_text(&path).unwrap();
        assert_eq!(text["Author"], "Jane");
        assert_eq!(text["Comment"], "squeezed");
        assert_eq!(text["Title"], "Grüße");
    }

    #[test]
    fn png_without_text_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "plain.png", Vec::new());
        assert!(read_png_text(&path).unwrap().is_empty());
        assert_eq!(read_xmp(&path).unwrap(), None);
    }

    #[test]
    fn malformed_text_chunk_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_png(
            &dir,
            "broken.png",
            vec![PngChunk::new(CHUNK_TEXT, Bytes::from_static(b"no separator"))],
        );
        assert!(read_png_text(&path).is_err());
    }

    // ── xmp_from_bytes ───────────────────────────────────────────────

    #[test]
    fn unsupported_container() {
        let err = xmp_from_bytes(Bytes::from_static(b"GIF89a......")).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn jpeg_without_xmp() {
        let mut buf = Vec::new();
        image::DynamicImage::new_rgb8(2, 2)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        assert_eq!(xmp_from_bytes(Bytes::from(buf)).unwrap(), None);
    }

    #[test]
    fn missing_file_errors() {
        let dir = TempDir::new().unwrap();
        assert!(read_xmp(&dir.path().join("nope.jpg")).is_err());
    }
}
