//! Detection evaluation: per-image TP/FP matching, per-class precision/recall
//! accumulation and VOC-style average precision.
//!
//! AP is the area under the continuous precision envelope (VOC2010 and
//! later): precision at each recall is replaced by the maximum precision at
//! any recall greater or equal, and the envelope is integrated over recall.
//! mAP is the mean AP over classes with at least one ground-truth box.

use std::cmp::Ordering;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::geometry::{iou_matrix, CornerBox};
use crate::params::DetectorConfig;
use crate::types::{Detection, GroundTruth};

/// Append-only precision/recall record of one class.
#[derive(Debug, Clone, Default)]
pub struct PrRecord {
    /// True-positive flag of each scored detection, in arrival order.
    pub tp: Vec<bool>,
    pub scores: Vec<f32>,
    /// Ground-truth boxes seen so far.
    pub num_gt: usize,
}

impl PrRecord {
    pub fn push(&mut self, is_tp: bool, score: f32) {
        self.tp.push(is_tp);
        self.scores.push(score);
    }

    pub fn add_ground_truth(&mut self, n: usize) {
        self.num_gt += n;
    }

    pub fn num_detections(&self) -> usize {
        self.tp.len()
    }

    /// Recall and precision at every rank after sorting detections by score,
    /// highest first (stable on ties).
    ///
    /// Recall is all zeros when there is no ground truth.
    pub fn curve(&self) -> (Vec<f64>, Vec<f64>) {
        let mut inds: Vec<usize> = (0..self.scores.len()).collect();
        inds.sort_by(|&a, &b| {
            self.scores[b]
                .partial_cmp(&self.scores[a])
                .unwrap_or(Ordering::Equal)
        });

        let mut recall = Vec::with_capacity(inds.len());
        let mut precision = Vec::with_capacity(inds.len());
        let mut cum_tp = 0usize;
        for (rank, &i) in inds.iter().enumerate() {
            if self.tp[i] {
                cum_tp += 1;
            }
            precision.push(cum_tp as f64 / (rank + 1) as f64);
            recall.push(if self.num_gt == 0 {
                0.0
            } else {
                cum_tp as f64 / self.num_gt as f64
            });
        }
        (recall, precision)
    }

    /// Average precision, or `None` for a class without ground truth.
    pub fn average_precision(&self) -> Option<f64> {
        if self.num_gt == 0 {
            return None;
        }
        let (recall, precision) = self.curve();
        Some(voc_ap(&recall, &precision))
    }
}

/// Area under the precision envelope of a precision/recall curve.
///
/// `recall` must be non-decreasing, as produced by [`PrRecord::curve`].
pub fn voc_ap(recall: &[f64], precision: &[f64]) -> f64 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);

    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);

    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }

    (0..mrec.len() - 1)
        .filter(|&i| mrec[i + 1] != mrec[i])
        .map(|i| (mrec[i + 1] - mrec[i]) * mpre[i + 1])
        .sum()
}

/// Match outcome of one image.
#[derive(Debug, Clone, Default)]
pub struct ImageMatches {
    /// `(class, is_tp, score)` per scored detection.
    pub detections: Vec<(usize, bool, f32)>,
    /// Ground-truth boxes per class.
    pub gt_counts: Vec<usize>,
}

/// Mark each detection of one image true or false positive.
///
/// Per class, detections are visited by descending score (stable). Each takes
/// the unclaimed ground-truth box of its class with the highest IoU; when that
/// IoU is strictly above `match_iou` the detection is a true positive and
/// claims the box, otherwise it is a false positive.
pub fn match_image(
    predictions: &[Detection],
    ground_truth: &[GroundTruth],
    num_classes: usize,
    match_iou: f32,
) -> ImageMatches {
    let mut matches = ImageMatches {
        detections: Vec::with_capacity(predictions.len()),
        gt_counts: vec![0; num_classes],
    };

    let mut gt_by_class: Vec<Vec<CornerBox>> = vec![Vec::new(); num_classes];
    for gt in ground_truth {
        match gt_by_class.get_mut(gt.class_index) {
            Some(boxes) => boxes.push(gt.bbox),
            None => warn!("ignoring ground truth with unknown class {}", gt.class_index),
        }
    }
    let mut dt_by_class: Vec<Vec<&Detection>> = vec![Vec::new(); num_classes];
    for det in predictions {
        match dt_by_class.get_mut(det.class_index) {
            Some(dets) => dets.push(det),
            None => warn!("ignoring detection with unknown class {}", det.class_index),
        }
    }

    for class in 0..num_classes {
        let gts = &gt_by_class[class];
        matches.gt_counts[class] = gts.len();

        let mut dts = std::mem::take(&mut dt_by_class[class]);
        if dts.is_empty() {
            continue;
        }
        dts.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let dt_boxes: Vec<CornerBox> = dts.iter().map(|d| d.bbox).collect();
        let ious = iou_matrix(&dt_boxes, gts);
        let mut claimed = vec![false; gts.len()];

        for (di, det) in dts.iter().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (gi, &v) in ious[di].iter().enumerate() {
                if claimed[gi] {
                    continue;
                }
                if best.map_or(true, |(_, b)| v > b) {
                    best = Some((gi, v));
                }
            }

            let is_tp = match best {
                Some((gi, v)) if v > match_iou => {
                    claimed[gi] = true;
                    true
                }
                _ => false,
            };
            matches.detections.push((class, is_tp, det.score));
        }
    }

    matches
}

/// Per-class AP entry of an [`EvalSummary`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAp {
    pub name: String,
    /// `None` when the class has no ground truth; such classes are left out of
    /// the mAP.
    pub ap: Option<f64>,
    pub num_gt: usize,
    pub num_det: usize,
}

/// Final result of an evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalSummary {
    pub classes: Vec<ClassAp>,
    /// Mean AP over classes with ground truth; 0 when there are none.
    pub map: f64,
    pub match_iou: f32,
}

impl EvalSummary {
    pub fn ap(&self, class_name: &str) -> Option<f64> {
        self.classes
            .iter()
            .find(|c| c.name == class_name)
            .and_then(|c| c.ap)
    }

    /// Number of classes that entered the mAP.
    pub fn num_evaluated(&self) -> usize {
        self.classes.iter().filter(|c| c.ap.is_some()).count()
    }

    /// Print the per-class AP table followed by the mAP line.
    pub fn summarize(&self) {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0);

        for class in &self.classes {
            let val_str = match class.ap {
                Some(ap) => format!("{:0.3}", ap),
                None => "n/a".to_string(),
            };
            println!(
                " Average Precision  (AP) @[ IoU={:0.2} | class={:>w$} | gt={:>5} | dt={:>6} ] = {}",
                self.match_iou,
                class.name,
                class.num_gt,
                class.num_det,
                val_str,
                w = width
            );
        }
        println!(
            " mean Average Precision (mAP) @[ IoU={:0.2} | classes={} ] = {:0.3}",
            self.match_iou,
            self.num_evaluated(),
            self.map
        );
    }
}

/// Accumulates matches over an evaluation pass; one instance per pass.
#[derive(Debug, Clone)]
pub struct Evaluator {
    class_names: Vec<String>,
    match_iou: f32,
    records: Vec<PrRecord>,
}

impl Evaluator {
    pub fn new(class_names: Vec<String>, match_iou: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&match_iou) {
            return Err(Error::InvalidThreshold {
                name: "match_iou",
                value: match_iou,
            });
        }
        let records = vec![PrRecord::default(); class_names.len()];
        Ok(Evaluator {
            class_names,
            match_iou,
            records,
        })
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        Self::new(config.class_names.clone(), config.thresholds.match_iou)
    }

    pub fn records(&self) -> &[PrRecord] {
        &self.records
    }

    fn append(&mut self, matches: ImageMatches) {
        for (class, is_tp, score) in matches.detections {
            self.records[class].push(is_tp, score);
        }
        for (class, n) in matches.gt_counts.into_iter().enumerate() {
            self.records[class].add_ground_truth(n);
        }
    }

    pub fn evaluate_image(&mut self, predictions: &[Detection], ground_truth: &[GroundTruth]) {
        let matches = match_image(
            predictions,
            ground_truth,
            self.class_names.len(),
            self.match_iou,
        );
        self.append(matches);
    }

    /// Match many images in parallel, then record them in input order.
    pub fn evaluate_batch(&mut self, images: &[(Vec<Detection>, Vec<GroundTruth>)]) {
        let num_classes = self.class_names.len();
        let match_iou = self.match_iou;
        let all: Vec<ImageMatches> = images
            .par_iter()
            .map(|(predictions, ground_truth)| {
                match_image(predictions, ground_truth, num_classes, match_iou)
            })
            .collect();
        for matches in all {
            self.append(matches);
        }
    }

    /// Compute per-class AP and the mAP, consuming the accumulator.
    pub fn finalize(self) -> EvalSummary {
        let classes: Vec<ClassAp> = self
            .records
            .par_iter()
            .zip(self.class_names.par_iter())
            .map(|(record, name)| ClassAp {
                name: name.clone(),
                ap: record.average_precision(),
                num_gt: record.num_gt,
                num_det: record.num_detections(),
            })
            .collect();

        let aps: Vec<f64> = classes.iter().filter_map(|c| c.ap).collect();
        let map = if aps.is_empty() {
            warn!("no class has ground truth, mAP is 0");
            0.0
        } else {
            aps.iter().sum::<f64>() / aps.len() as f64
        };
        info!("mAP {:.4} over {} classes", map, aps.len());

        EvalSummary {
            classes,
            map,
            match_iou: self.match_iou,
        }
    }
}
