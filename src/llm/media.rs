use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::ImageReader;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        "image/heif" => "image/heic".to_string(),
        _ => lowered,
    }
}

pub fn supported_image_mime(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "image/png" | "image/jpeg" | "image/webp" | "image/heic"
    )
}

/// Probes pixel dimensions from the encoded header without decoding pixels.
pub fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Encoded image shared between concurrent stages without copying.
#[derive(Clone)]
pub struct SourceImage {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl SourceImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mime_type = detect_mime_type(&bytes)
            .map(|mime| normalize_image_mime_type(&mime))
            .unwrap_or_else(|| "image/png".to_string());
        SourceImage {
            bytes: Arc::from(bytes),
            mime_type,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        probe_dimensions(&self.bytes)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::new(width, height);
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, ImageFormat::Png)
            .expect("encode png");
        buffer.into_inner()
    }

    #[test]
    fn source_image_sniffs_png_and_dimensions() {
        let image = SourceImage::new(png_bytes(40, 30));
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.dimensions(), Some((40, 30)));
    }

    #[test]
    fn unknown_bytes_default_to_png_without_dimensions() {
        let image = SourceImage::new(vec![1, 2, 3]);
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.dimensions(), None);
    }

    #[test]
    fn jpg_alias_is_normalized() {
        assert_eq!(normalize_image_mime_type("IMAGE/JPG"), "image/jpeg");
        assert!(supported_image_mime("image/webp"));
        assert!(!supported_image_mime("video/mp4"));
    }
}
