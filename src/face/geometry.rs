use serde::{Deserialize, Serialize};

/// Upper bound of the normalized coordinate space.
pub const NORMALIZED_SCALE: i32 = 1000;

/// Face bounding box in 0–1000 normalized image coordinates.
///
/// Only constructible through [`NormalizedBox::new`], which enforces
/// `ymax > ymin` and `xmax > xmin` after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    ymin: i32,
    xmin: i32,
    ymax: i32,
    xmax: i32,
    confidence: f32,
}

fn clamp_coordinate(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    (value.round() as i64).clamp(0, NORMALIZED_SCALE as i64) as i32
}

impl NormalizedBox {
    /// Clamps every coordinate into range; `None` when the box has no area.
    pub fn new(ymin: f64, xmin: f64, ymax: f64, xmax: f64, confidence: f64) -> Option<Self> {
        let ymin = clamp_coordinate(ymin);
        let xmin = clamp_coordinate(xmin);
        let ymax = clamp_coordinate(ymax);
        let xmax = clamp_coordinate(xmax);
        if ymax <= ymin || xmax <= xmin {
            return None;
        }
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        Some(NormalizedBox {
            ymin,
            xmin,
            ymax,
            xmax,
            confidence,
        })
    }

    /// Converts a pixel-space box using the image dimensions.
    pub fn from_pixels(
        top: f64,
        left: f64,
        bottom: f64,
        right: f64,
        width: u32,
        height: u32,
        confidence: f64,
    ) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let scale_y = NORMALIZED_SCALE as f64 / height as f64;
        let scale_x = NORMALIZED_SCALE as f64 / width as f64;
        NormalizedBox::new(
            top * scale_y,
            left * scale_x,
            bottom * scale_y,
            right * scale_x,
            confidence,
        )
    }

    pub fn ymin(&self) -> i32 {
        self.ymin
    }

    pub fn xmin(&self) -> i32 {
        self.xmin
    }

    pub fn ymax(&self) -> i32 {
        self.ymax
    }

    pub fn xmax(&self) -> i32 {
        self.xmax
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn width(&self) -> f64 {
        (self.xmax - self.xmin) as f64
    }

    pub fn height(&self) -> f64 {
        (self.ymax - self.ymin) as f64
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// `(y, x)` center.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.ymin + self.ymax) as f64 / 2.0,
            (self.xmin + self.xmax) as f64 / 2.0,
        )
    }

    pub fn intersection_area(&self, other: &NormalizedBox) -> f64 {
        let top = self.ymin.max(other.ymin);
        let left = self.xmin.max(other.xmin);
        let bottom = self.ymax.min(other.ymax);
        let right = self.xmax.min(other.xmax);
        if bottom <= top || right <= left {
            return 0.0;
        }
        ((bottom - top) as f64) * ((right - left) as f64)
    }

    pub fn iou(&self, other: &NormalizedBox) -> f64 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    pub fn center_distance(&self, other: &NormalizedBox) -> f64 {
        let (ay, ax) = self.center();
        let (by, bx) = other.center();
        ((ay - by).powi(2) + (ax - bx).powi(2)).sqrt()
    }

    /// Largest relative change of width or height, measured against `self`.
    pub fn size_delta(&self, other: &NormalizedBox) -> f64 {
        let width_delta = (other.width() - self.width()).abs() / self.width();
        let height_delta = (other.height() - self.height()).abs() / self.height();
        width_delta.max(height_delta)
    }

    /// Converts back to pixel rectangle `(x, y, width, height)` for an image
    /// of the given size. Always at least one pixel in each direction.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let scale = NORMALIZED_SCALE as u64;
        let floor = |value: i32, extent: u32| (value as u64 * extent as u64 / scale) as u32;
        let ceil = |value: i32, extent: u32| {
            ((value as u64 * extent as u64 + scale - 1) / scale) as u32
        };
        let x = floor(self.xmin, width);
        let y = floor(self.ymin, height);
        let right = ceil(self.xmax, width);
        let bottom = ceil(self.ymax, height);
        let x = x.min(width.saturating_sub(1));
        let y = y.min(height.saturating_sub(1));
        let w = right.min(width).saturating_sub(x).max(1);
        let h = bottom.min(height).saturating_sub(y).max(1);
        (x, y, w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> NormalizedBox {
        NormalizedBox::new(ymin, xmin, ymax, xmax, 1.0).expect("valid box")
    }

    #[test]
    fn degenerate_boxes_are_rejected() {
        assert!(NormalizedBox::new(0.0, 0.0, 0.0, 0.0, 0.0).is_none());
        assert!(NormalizedBox::new(500.0, 100.0, 400.0, 200.0, 1.0).is_none());
        assert!(NormalizedBox::new(100.0, 300.0, 200.0, 300.0, 1.0).is_none());
        // Clamping can collapse an out-of-range box to zero area.
        assert!(NormalizedBox::new(1200.0, 0.0, 1500.0, 100.0, 1.0).is_none());
    }

    #[test]
    fn coordinates_and_confidence_are_clamped() {
        let bbox = NormalizedBox::new(-20.0, 10.4, 1300.0, 600.6, 3.0).unwrap();
        assert_eq!((bbox.ymin(), bbox.xmin(), bbox.ymax(), bbox.xmax()), (0, 10, 1000, 601));
        assert_eq!(bbox.confidence(), 1.0);
    }

    #[test]
    fn identical_boxes_have_unit_iou() {
        let a = square(100.0, 100.0, 400.0, 400.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-9);
        assert_eq!(a.center_distance(&a), 0.0);
        assert_eq!(a.size_delta(&a), 0.0);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = square(0.0, 0.0, 300.0, 300.0);
        let b = square(500.0, 500.0, 800.0, 800.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.center_distance(&b) - (2.0f64 * 500.0 * 500.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn shifted_box_metrics() {
        let a = square(0.0, 0.0, 300.0, 300.0);
        let b = square(10.0, 10.0, 310.0, 310.0);
        let expected = (290.0 * 290.0) / (2.0 * 90000.0 - 290.0 * 290.0);
        assert!((a.iou(&b) - expected).abs() < 1e-9);
        assert!((a.center_distance(&b) - 200f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn size_delta_uses_larger_axis_change() {
        let a = square(100.0, 100.0, 300.0, 300.0);
        let b = square(100.0, 100.0, 350.0, 320.0);
        assert!((a.size_delta(&b) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn pixel_round_trip_stays_inside_image() {
        let bbox = NormalizedBox::from_pixels(50.0, 20.0, 150.0, 120.0, 200, 400, 0.9).unwrap();
        assert_eq!((bbox.ymin(), bbox.xmin(), bbox.ymax(), bbox.xmax()), (125, 100, 375, 600));
        assert_eq!(bbox.to_pixel_rect(200, 400), (20, 50, 100, 100));
    }
}
