//! Anchor-grid codec: raw head output to boxes, and ground truth to targets.
//!
//! A head's output is a `(anchors * (5 + classes), rows, cols)` array. The
//! channel block of anchor `a` starts at `a * (5 + classes)` and holds
//! `[tx, ty, tw, th, objectness, class_0 .. class_{C-1}]`.
//!
//! Decoding (normalized coordinates):
//!
//! ```text
//! cx = (col + sigmoid(tx)) / cols        w = anchor_w * exp(tw) / image_w
//! cy = (row + sigmoid(ty)) / rows        h = anchor_h * exp(th) / image_h
//! ```
//!
//! Encoding applies the exact inverse at the cell containing the box center.

use ndarray::{Array3, Array4, ArrayView3};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geometry::{shape_iou, CenterBox, CornerBox};
use crate::params::{DetectorConfig, ImageSize, ScaleConfig};
use crate::types::GroundTruth;

/// Offsets are kept this far inside `(0, 1)` so their logit stays finite.
const OFFSET_EPS: f32 = 1e-6;

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Logit of `p`, with `p` clamped into `[1e-6, 1 - 1e-6]`.
pub fn inverse_sigmoid(p: f32) -> f32 {
    let p = p.clamp(OFFSET_EPS, 1.0 - OFFSET_EPS);
    (p / (1.0 - p)).ln()
}

/// Softmax of `logits` written into `out`.
pub fn softmax_into(logits: impl Iterator<Item = f32> + Clone, out: &mut Vec<f32>) {
    let max = logits.clone().fold(f32::NEG_INFINITY, f32::max);
    let start = out.len();
    out.extend(logits.map(|v| (v - max).exp()));
    let sum: f32 = out[start..].iter().sum();
    if sum > 0.0 {
        for v in &mut out[start..] {
            *v /= sum;
        }
    }
}

/// One head's output decoded into flat, contiguous buffers.
///
/// Entry `i` is the `(row, col, anchor)` slot with
/// `i = (row * cols + col) * anchors + anchor`.
#[derive(Debug, Clone, Default)]
pub struct DecodedGrid {
    /// Boxes in absolute image pixels, corner form, clamped to the image.
    pub boxes: Vec<CornerBox>,
    pub objectness: Vec<f32>,
    /// `len() * num_classes` class probabilities.
    pub class_probs: Vec<f32>,
    pub num_classes: usize,
}

impl DecodedGrid {
    fn with_capacity(n: usize, num_classes: usize) -> Self {
        DecodedGrid {
            boxes: Vec::with_capacity(n),
            objectness: Vec::with_capacity(n),
            class_probs: Vec::with_capacity(n * num_classes),
            num_classes,
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn probs(&self, i: usize) -> &[f32] {
        &self.class_probs[i * self.num_classes..(i + 1) * self.num_classes]
    }
}

/// Ground truth re-expressed in a head's output layout.
#[derive(Debug, Clone)]
pub struct Target {
    pub scale: String,
    /// Same layout as raw output: inverse-logit position, objectness 0/1 and
    /// a one-hot class vector for assigned slots, zeros elsewhere.
    pub data: Array3<f32>,
    /// `(anchors, rows, cols, 4)` normalized corner box of each assigned slot.
    pub boxes: Array4<f32>,
}

impl Target {
    fn empty(scale: &ScaleConfig, num_classes: usize) -> Self {
        let [c, rows, cols] = scale.output_shape(num_classes);
        Target {
            scale: scale.name.clone(),
            data: Array3::zeros((c, rows, cols)),
            boxes: Array4::zeros((scale.num_anchors(), rows, cols, 4)),
        }
    }

    /// Number of `(cell, anchor)` slots holding an object.
    pub fn num_assigned(&self, num_classes: usize) -> usize {
        let stride = ScaleConfig::values_per_anchor(num_classes);
        let anchors = self.data.dim().0 / stride;
        (0..anchors)
            .map(|a| {
                self.data
                    .index_axis(ndarray::Axis(0), a * stride + 4)
                    .iter()
                    .filter(|&&v| v > 0.0)
                    .count()
            })
            .sum()
    }
}

/// Where an encoded box lives in a head's output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub row: usize,
    pub col: usize,
    pub anchor: usize,
    /// `[tx, ty, tw, th]`.
    pub t: [f32; 4],
}

/// Codec for a single head.
#[derive(Debug, Clone, Copy)]
pub struct AnchorGrid<'a> {
    pub scale: &'a ScaleConfig,
    pub image_size: ImageSize,
    pub num_classes: usize,
}

impl<'a> AnchorGrid<'a> {
    pub fn new(scale: &'a ScaleConfig, image_size: ImageSize, num_classes: usize) -> Self {
        AnchorGrid {
            scale,
            image_size,
            num_classes,
        }
    }

    fn stride(&self) -> usize {
        ScaleConfig::values_per_anchor(self.num_classes)
    }

    /// Fail fast when an output array does not match this head.
    pub fn check_shape(&self, shape: &[usize]) -> Result<()> {
        let expected = self.scale.output_shape(self.num_classes);
        if shape != expected {
            return Err(Error::ShapeMismatch {
                scale: self.scale.name.clone(),
                expected,
                actual: shape.to_vec(),
                anchors: self.scale.num_anchors(),
                classes: self.num_classes,
            });
        }
        Ok(())
    }

    /// Decode one slot's `[tx, ty, tw, th]` into a normalized center box.
    pub fn decode_box(&self, row: usize, col: usize, anchor: usize, t: [f32; 4]) -> CenterBox {
        let prior = self.scale.anchors[anchor];
        CenterBox {
            cx: (col as f32 + sigmoid(t[0])) / self.scale.cols() as f32,
            cy: (row as f32 + sigmoid(t[1])) / self.scale.rows() as f32,
            w: prior.width * t[2].exp() / self.image_size.width as f32,
            h: prior.height * t[3].exp() / self.image_size.height as f32,
        }
    }

    fn to_pixels(&self, normalized: CornerBox) -> CornerBox {
        normalized.clamp(0.0, 1.0).scale(
            self.image_size.width as f32,
            self.image_size.height as f32,
        )
    }

    /// Decode raw network output: sigmoid objectness, softmax class logits and
    /// the exp/sigmoid geometry.
    pub fn decode_raw(&self, output: ArrayView3<f32>) -> Result<DecodedGrid> {
        self.check_shape(output.shape())?;

        let (rows, cols, anchors) = (self.scale.rows(), self.scale.cols(), self.scale.num_anchors());
        let stride = self.stride();
        let mut grid = DecodedGrid::with_capacity(rows * cols * anchors, self.num_classes);

        for row in 0..rows {
            for col in 0..cols {
                for anchor in 0..anchors {
                    let base = anchor * stride;
                    let t = [
                        output[[base, row, col]],
                        output[[base + 1, row, col]],
                        output[[base + 2, row, col]],
                        output[[base + 3, row, col]],
                    ];
                    let center = self.decode_box(row, col, anchor, t);
                    grid.boxes.push(self.to_pixels(center.to_corner()));
                    grid.objectness.push(sigmoid(output[[base + 4, row, col]]));
                    let logits = (0..self.num_classes).map(|c| output[[base + 5 + c, row, col]]);
                    softmax_into(logits, &mut grid.class_probs);
                }
            }
        }

        Ok(grid)
    }

    /// Decode an already-encoded target: objectness and classes are used as
    /// stored and geometry comes from the stored normalized boxes.
    pub fn decode_target(&self, target: &Target) -> Result<DecodedGrid> {
        self.check_shape(target.data.shape())?;

        let (rows, cols, anchors) = (self.scale.rows(), self.scale.cols(), self.scale.num_anchors());
        let stride = self.stride();
        let mut grid = DecodedGrid::with_capacity(rows * cols * anchors, self.num_classes);

        for row in 0..rows {
            for col in 0..cols {
                for anchor in 0..anchors {
                    let base = anchor * stride;
                    let b = &target.boxes;
                    let normalized = CornerBox::new(
                        b[[anchor, row, col, 0]],
                        b[[anchor, row, col, 1]],
                        b[[anchor, row, col, 2]],
                        b[[anchor, row, col, 3]],
                    );
                    grid.boxes.push(self.to_pixels(normalized));
                    grid.objectness.push(target.data[[base + 4, row, col]]);
                    grid.class_probs
                        .extend((0..self.num_classes).map(|c| target.data[[base + 5 + c, row, col]]));
                }
            }
        }

        Ok(grid)
    }

    /// Index of the anchor whose shape best matches a `w x h` pixel box, and
    /// that shape IoU. Earlier anchors win ties.
    pub fn best_anchor(&self, w: f32, h: f32) -> (usize, f32) {
        let mut best = (0, f32::NEG_INFINITY);
        for (i, prior) in self.scale.anchors.iter().enumerate() {
            let v = shape_iou((w, h), (prior.width, prior.height));
            if v > best.1 {
                best = (i, v);
            }
        }
        best
    }

    /// Encode a pixel box at the given anchor of the cell containing its center.
    pub fn encode_box(&self, bbox: &CornerBox, anchor: usize) -> Slot {
        let (rows, cols) = (self.scale.rows() as f32, self.scale.cols() as f32);
        let c = bbox.to_center();
        let gx = c.cx / self.image_size.width as f32 * cols;
        let gy = c.cy / self.image_size.height as f32 * rows;
        let col = gx.floor().clamp(0.0, cols - 1.0);
        let row = gy.floor().clamp(0.0, rows - 1.0);
        let prior = self.scale.anchors[anchor];

        Slot {
            row: row as usize,
            col: col as usize,
            anchor,
            t: [
                inverse_sigmoid(gx - col),
                inverse_sigmoid(gy - row),
                (c.w / prior.width).ln(),
                (c.h / prior.height).ln(),
            ],
        }
    }

    fn write_slot(&self, target: &mut Target, slot: &Slot, gt: &GroundTruth) {
        let base = slot.anchor * self.stride();
        let (r, c) = (slot.row, slot.col);
        for (k, &v) in slot.t.iter().enumerate() {
            target.data[[base + k, r, c]] = v;
        }
        target.data[[base + 4, r, c]] = 1.0;
        for k in 0..self.num_classes {
            target.data[[base + 5 + k, r, c]] = 0.0;
        }
        target.data[[base + 5 + gt.class_index, r, c]] = 1.0;

        let normalized = gt.bbox.scale(
            1.0 / self.image_size.width as f32,
            1.0 / self.image_size.height as f32,
        );
        for (k, v) in normalized.to_array().into_iter().enumerate() {
            target.boxes[[slot.anchor, r, c, k]] = v;
        }
    }

    /// Encode ground truth for this head alone, choosing each box's anchor
    /// among this head's priors.
    ///
    /// Boxes are written in input order, so when two boxes share a slot the
    /// later one wins.
    pub fn encode(&self, ground_truth: &[GroundTruth]) -> Target {
        let mut target = Target::empty(self.scale, self.num_classes);
        for gt in ground_truth {
            if !usable(gt, self.num_classes) {
                continue;
            }
            let (anchor, _) = self.best_anchor(gt.bbox.width(), gt.bbox.height());
            let slot = self.encode_box(&gt.bbox, anchor);
            self.write_slot(&mut target, &slot, gt);
        }
        target
    }
}

/// Degenerate boxes and unknown classes are data issues: logged and skipped.
fn usable(gt: &GroundTruth, num_classes: usize) -> bool {
    let (w, h) = (gt.bbox.width(), gt.bbox.height());
    if !(w > 0.0 && h > 0.0) {
        warn!("skipping degenerate ground-truth box {:?}", gt.bbox);
        return false;
    }
    if gt.class_index >= num_classes {
        warn!(
            "skipping ground-truth box with class {} (only {} classes)",
            gt.class_index, num_classes
        );
        return false;
    }
    true
}

/// Encode ground truth across every head of `config` jointly: each box goes to
/// the single best-matching anchor over all heads. Returns one target per
/// head, in `config.scales` order.
pub fn encode_all(config: &DetectorConfig, ground_truth: &[GroundTruth]) -> Vec<Target> {
    let num_classes = config.num_classes();
    let grids: Vec<AnchorGrid> = config
        .scales
        .iter()
        .map(|s| AnchorGrid::new(s, config.image_size, num_classes))
        .collect();
    let mut targets: Vec<Target> = config
        .scales
        .iter()
        .map(|s| Target::empty(s, num_classes))
        .collect();

    for gt in ground_truth {
        if !usable(gt, num_classes) {
            continue;
        }
        let (w, h) = (gt.bbox.width(), gt.bbox.height());
        let mut best: Option<(usize, usize, f32)> = None;
        for (si, grid) in grids.iter().enumerate() {
            let (anchor, v) = grid.best_anchor(w, h);
            if best.map_or(true, |(_, _, b)| v > b) {
                best = Some((si, anchor, v));
            }
        }
        if let Some((si, anchor, v)) = best {
            let slot = grids[si].encode_box(&gt.bbox, anchor);
            debug!(
                "ground truth {:?} -> scale {} cell ({}, {}) anchor {} (shape iou {:.3})",
                gt.bbox, grids[si].scale.name, slot.row, slot.col, anchor, v
            );
            grids[si].write_slot(&mut targets[si], &slot, gt);
        }
    }

    targets
}
