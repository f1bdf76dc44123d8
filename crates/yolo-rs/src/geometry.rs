//! Axis-aligned box geometry: center/corner conversion, area and IoU.
//!
//! Nothing here knows about coordinate spaces. Every function works the same on
//! normalized `[0, 1]` grid coordinates and on absolute pixels; callers decide
//! which one they hold.

use serde::{Deserialize, Serialize};

/// Box in center form `(cx, cy, w, h)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CenterBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Box in corner form `(x1, y1, x2, y2)` with `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct CornerBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl CenterBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        CenterBox { cx, cy, w, h }
    }

    /// Convert to corner form. `w` and `h` must be non-negative.
    pub fn to_corner(&self) -> CornerBox {
        let half_w = self.w / 2.0;
        let half_h = self.h / 2.0;
        CornerBox {
            x1: self.cx - half_w,
            y1: self.cy - half_h,
            x2: self.cx + half_w,
            y2: self.cy + half_h,
        }
    }
}

impl CornerBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        CornerBox { x1, y1, x2, y2 }
    }

    pub fn to_center(&self) -> CenterBox {
        CenterBox {
            cx: (self.x1 + self.x2) / 2.0,
            cy: (self.y1 + self.y2) / 2.0,
            w: self.x2 - self.x1,
            h: self.y2 - self.y1,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Clamp every coordinate into `[lo, hi]`.
    pub fn clamp(&self, lo: f32, hi: f32) -> CornerBox {
        CornerBox {
            x1: self.x1.clamp(lo, hi),
            y1: self.y1.clamp(lo, hi),
            x2: self.x2.clamp(lo, hi),
            y2: self.y2.clamp(lo, hi),
        }
    }

    /// Multiply x coordinates by `sx` and y coordinates by `sy`.
    pub fn scale(&self, sx: f32, sy: f32) -> CornerBox {
        CornerBox {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f32; 4]> for CornerBox {
    fn from(v: [f32; 4]) -> Self {
        CornerBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<CornerBox> for [f32; 4] {
    fn from(b: CornerBox) -> Self {
        b.to_array()
    }
}

/// Intersection area of two corner-form boxes, 0 when they do not overlap.
pub fn intersection(a: &CornerBox, b: &CornerBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    iw * ih
}

/// Intersection over union in `[0, 1]`.
///
/// Returns 0 when the union is empty (both boxes degenerate).
pub fn iou(a: &CornerBox, b: &CornerBox) -> f32 {
    let inter = intersection(a, b);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// IoU between every pair of `dt` and `gt` boxes.
///
/// Returns a D×G matrix (row-major, `dt.len()` rows, `gt.len()` columns).
pub fn iou_matrix(dt: &[CornerBox], gt: &[CornerBox]) -> Vec<Vec<f32>> {
    dt.iter()
        .map(|d| gt.iter().map(|g| iou(d, g)).collect())
        .collect()
}

/// IoU of two boxes sharing the same center, given only their sizes.
///
/// Used to pick the anchor prior whose shape best matches a ground-truth box.
pub fn shape_iou(a: (f32, f32), b: (f32, f32)) -> f32 {
    let inter = a.0.min(b.0).max(0.0) * a.1.min(b.1).max(0.0);
    let union = a.0 * a.1 + b.0 * b.1 - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_corner_roundtrip() {
        let c = CenterBox::new(50.0, 40.0, 20.0, 10.0);
        let k = c.to_corner();
        assert_eq!(k, CornerBox::new(40.0, 35.0, 60.0, 45.0));
        assert_eq!(k.to_center(), c);
    }

    #[test]
    fn test_iou_basic() {
        let a = CornerBox::new(0.0, 0.0, 10.0, 10.0);
        let b = CornerBox::new(5.0, 5.0, 15.0, 15.0);
        // inter = 25, union = 100 + 100 - 25 = 175
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_symmetric_and_self() {
        let a = CornerBox::new(1.0, 2.0, 7.0, 9.0);
        let b = CornerBox::new(3.0, 1.0, 12.0, 5.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = CornerBox::new(0.0, 0.0, 1.0, 1.0);
        let b = CornerBox::new(2.0, 2.0, 3.0, 3.0);
        assert_eq!(iou(&a, &b), 0.0);
        // touching edges have no area in common
        let c = CornerBox::new(1.0, 0.0, 2.0, 1.0);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_iou_degenerate() {
        let p = CornerBox::new(3.0, 3.0, 3.0, 3.0);
        assert_eq!(iou(&p, &p), 0.0);
    }

    #[test]
    fn test_iou_matrix_shape() {
        let dt = [
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
            CornerBox::new(20.0, 20.0, 30.0, 30.0),
        ];
        let gt = [CornerBox::new(0.0, 0.0, 10.0, 10.0)];
        let m = iou_matrix(&dt, &gt);
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].len(), 1);
        assert!((m[0][0] - 1.0).abs() < 1e-6);
        assert_eq!(m[1][0], 0.0);
    }

    #[test]
    fn test_shape_iou() {
        assert!((shape_iou((4.0, 4.0), (4.0, 4.0)) - 1.0).abs() < 1e-6);
        // 2x2 inside 4x4: 4 / 16
        assert!((shape_iou((2.0, 2.0), (4.0, 4.0)) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_and_scale() {
        let b = CornerBox::new(-0.1, 0.2, 1.3, 0.8).clamp(0.0, 1.0);
        assert_eq!(b, CornerBox::new(0.0, 0.2, 1.0, 0.8));
        let s = b.scale(100.0, 50.0);
        assert!((s.x2 - 100.0).abs() < 1e-4);
        assert!((s.y1 - 10.0).abs() < 1e-4);
    }
}
