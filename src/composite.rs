//! Last-resort pixel correction: pastes the face (or eye band) of the source
//! photo onto a generated candidate through a feathered radial mask.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::face::NormalizedBox;

/// Fraction of the face height where the eye band starts and ends.
const EYE_BAND_TOP: f64 = 0.22;
const EYE_BAND_BOTTOM: f64 = 0.52;
/// Share of the mask radius that fades from opaque to transparent.
const FEATHER: f32 = 0.35;

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("pixel correction is disabled")]
    Disabled,
    #[error("correction region is empty")]
    EmptyRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelCorrectionMode {
    Off,
    Face,
    Eyes,
}

impl PixelCorrectionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "off" | "none" | "false" | "0" => Some(PixelCorrectionMode::Off),
            "face" => Some(PixelCorrectionMode::Face),
            "eyes" | "eye" => Some(PixelCorrectionMode::Eyes),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelCorrectionMode::Off => "off",
            PixelCorrectionMode::Face => "face",
            PixelCorrectionMode::Eyes => "eyes",
        }
    }

    /// Sub-region of `face` that this mode replaces.
    pub fn region(self, face: &NormalizedBox) -> Option<NormalizedBox> {
        match self {
            PixelCorrectionMode::Off => None,
            PixelCorrectionMode::Face => Some(*face),
            PixelCorrectionMode::Eyes => NormalizedBox::new(
                face.ymin() as f64 + face.height() * EYE_BAND_TOP,
                face.xmin() as f64,
                face.ymin() as f64 + face.height() * EYE_BAND_BOTTOM,
                face.xmax() as f64,
                face.confidence() as f64,
            ),
        }
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, CompositeError> {
    image::load_from_memory(bytes).map_err(|e| CompositeError::Decode(e.to_string()))
}

/// Opacity of the mask at `(x, y)` inside a `width` x `height` region:
/// 1.0 in the inner ellipse, smoothly falling to 0.0 at the region edge.
pub fn radial_mask_alpha(x: u32, y: u32, width: u32, height: u32) -> f32 {
    if width == 0 || height == 0 {
        return 0.0;
    }
    let half_w = width as f32 / 2.0;
    let half_h = height as f32 / 2.0;
    let dx = (x as f32 + 0.5 - half_w) / half_w;
    let dy = (y as f32 + 0.5 - half_h) / half_h;
    let radius = (dx * dx + dy * dy).sqrt();
    let inner = 1.0 - FEATHER;
    if radius <= inner {
        1.0
    } else if radius >= 1.0 {
        0.0
    } else {
        let t = (radius - inner) / FEATHER;
        1.0 - t * t * (3.0 - 2.0 * t)
    }
}

fn blend_pixel(base: Rgba<u8>, overlay: Rgba<u8>, alpha: f32) -> Rgba<u8> {
    let mix = |b: u8, o: u8| (o as f32 * alpha + b as f32 * (1.0 - alpha)).round() as u8;
    Rgba([
        mix(base[0], overlay[0]),
        mix(base[1], overlay[1]),
        mix(base[2], overlay[2]),
        base[3],
    ])
}

/// Crops `source_region` from `source`, resizes it onto `target_region` of
/// `target` and alpha-blends it with a feathered radial mask. Returns PNG bytes.
pub fn blend_region(
    source: &[u8],
    source_region: &NormalizedBox,
    target: &[u8],
    target_region: &NormalizedBox,
) -> Result<Vec<u8>, CompositeError> {
    let source = decode(source)?;
    let mut canvas: RgbaImage = decode(target)?.to_rgba8();

    let (sx, sy, sw, sh) = source_region.to_pixel_rect(source.width(), source.height());
    let (tx, ty, tw, th) = target_region.to_pixel_rect(canvas.width(), canvas.height());
    if sw == 0 || sh == 0 || tw == 0 || th == 0 {
        return Err(CompositeError::EmptyRegion);
    }

    let patch = source
        .crop_imm(sx, sy, sw, sh)
        .resize_exact(tw, th, FilterType::Lanczos3)
        .to_rgba8();

    for (px, py, overlay) in patch.enumerate_pixels() {
        let (cx, cy) = (tx + px, ty + py);
        if cx >= canvas.width() || cy >= canvas.height() {
            continue;
        }
        let alpha = radial_mask_alpha(px, py, tw, th) * (overlay[3] as f32 / 255.0);
        if alpha <= 0.0 {
            continue;
        }
        let base = *canvas.get_pixel(cx, cy);
        canvas.put_pixel(cx, cy, blend_pixel(base, *overlay, alpha));
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| CompositeError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Applies `mode` using the detected face boxes of source and candidate.
pub fn correct_candidate(
    mode: PixelCorrectionMode,
    source: &[u8],
    source_face: &NormalizedBox,
    candidate: &[u8],
    candidate_face: &NormalizedBox,
) -> Result<Vec<u8>, CompositeError> {
    if mode == PixelCorrectionMode::Off {
        return Err(CompositeError::Disabled);
    }
    let source_region = mode.region(source_face).ok_or(CompositeError::EmptyRegion)?;
    let target_region = mode.region(candidate_face).ok_or(CompositeError::EmptyRegion)?;
    blend_region(source, &source_region, candidate, &target_region)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn bbox(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> NormalizedBox {
        NormalizedBox::new(ymin, xmin, ymax, xmax, 1.0).unwrap()
    }

    #[test]
    fn mask_is_opaque_in_center_and_clear_at_edges() {
        assert_eq!(radial_mask_alpha(50, 50, 100, 100), 1.0);
        assert_eq!(radial_mask_alpha(0, 0, 100, 100), 0.0);
        let mid = radial_mask_alpha(85, 50, 100, 100);
        assert!(mid > 0.0 && mid < 1.0, "mid={mid}");
    }

    #[test]
    fn eye_band_covers_upper_middle_of_face() {
        let face = bbox(100.0, 200.0, 500.0, 400.0);
        let band = PixelCorrectionMode::Eyes.region(&face).unwrap();
        assert_eq!((band.ymin(), band.ymax()), (188, 308));
        assert_eq!((band.xmin(), band.xmax()), (200, 400));
        assert_eq!(PixelCorrectionMode::Face.region(&face), Some(face));
        assert_eq!(PixelCorrectionMode::Off.region(&face), None);
    }

    #[test]
    fn face_region_is_blended_onto_candidate() {
        let source = solid_png(100, 100, [255, 0, 0, 255]);
        let candidate = solid_png(100, 100, [0, 0, 255, 255]);
        let face = bbox(200.0, 200.0, 800.0, 800.0);
        let corrected =
            correct_candidate(PixelCorrectionMode::Face, &source, &face, &candidate, &face).unwrap();
        let image = image::load_from_memory(&corrected).unwrap().to_rgba8();
        assert_eq!(image.get_pixel(50, 50).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(5, 5).0, [0, 0, 255, 255]);
    }

    #[test]
    fn disabled_mode_and_bad_input_are_errors() {
        let face = bbox(0.0, 0.0, 500.0, 500.0);
        assert!(matches!(
            correct_candidate(PixelCorrectionMode::Off, &[], &face, &[], &face),
            Err(CompositeError::Disabled)
        ));
        assert!(matches!(
            correct_candidate(PixelCorrectionMode::Face, b"nope", &face, b"nope", &face),
            Err(CompositeError::Decode(_))
        ));
    }

    #[test]
    fn parses_modes() {
        assert_eq!(PixelCorrectionMode::parse("EYES"), Some(PixelCorrectionMode::Eyes));
        assert_eq!(PixelCorrectionMode::parse("off"), Some(PixelCorrectionMode::Off));
        assert_eq!(PixelCorrectionMode::parse("blur"), None);
    }
}
