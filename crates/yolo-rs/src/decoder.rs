//! Detection decoder: codec, candidate filter and per-class NMS chained
//! together for single- and multi-scale detectors.
//!
//! With several scales every head is decoded and filtered on its own, the
//! survivors are pooled, and NMS runs once per class over the pool. A box that
//! two heads both predict is therefore suppressed exactly like a duplicate
//! from a single head.

use std::collections::BTreeMap;

use ndarray::{Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::codec::{encode_all, AnchorGrid, Target};
use crate::error::{Error, Result};
use crate::filter::{filter_into, Candidate};
use crate::nms::nms_per_class;
use crate::params::{DetectorConfig, ScaleConfig};
use crate::types::{Detection, GroundTruth};

pub struct Decoder {
    config: DetectorConfig,
}

impl Decoder {
    /// Build a decoder; the configuration is validated here.
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Decoder { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_multi_scale(&self) -> bool {
        self.config.scales.len() > 1
    }

    fn grid<'a>(&'a self, scale: &'a ScaleConfig) -> AnchorGrid<'a> {
        AnchorGrid::new(scale, self.config.image_size, self.config.num_classes())
    }

    fn check_keys<'k>(&self, keys: impl Iterator<Item = &'k String>) -> Result<()> {
        for key in keys {
            if self.config.scale(key).is_none() {
                return Err(Error::UnknownScale(key.clone()));
            }
        }
        Ok(())
    }

    /// Decode one image's raw output, given as one
    /// `(anchors * (5 + classes), rows, cols)` array per scale name.
    pub fn decode(&self, outputs: &BTreeMap<String, Array3<f32>>) -> Result<Vec<Detection>> {
        self.check_keys(outputs.keys())?;
        self.decode_views(|scale| {
            outputs
                .get(&scale.name)
                .map(|a| a.view())
                .ok_or_else(|| Error::MissingScale(scale.name.clone()))
        })
    }

    /// Decode a batch given as one `(batch, channels, rows, cols)` array per
    /// scale name. Images are decoded in parallel; results keep batch order.
    pub fn decode_batch(&self, outputs: &BTreeMap<String, Array4<f32>>) -> Result<Vec<Vec<Detection>>> {
        self.check_keys(outputs.keys())?;
        let mut batch = None;
        for scale in &self.config.scales {
            let array = outputs
                .get(&scale.name)
                .ok_or_else(|| Error::MissingScale(scale.name.clone()))?;
            let n = array.dim().0;
            match batch {
                None => batch = Some(n),
                Some(b) if b != n => {
                    return Err(Error::InvalidConfig(format!(
                        "scale `{}` has batch size {}, expected {}",
                        scale.name, n, b
                    )))
                }
                Some(_) => {}
            }
        }

        (0..batch.unwrap_or(0))
            .into_par_iter()
            .map(|i| {
                self.decode_views(|scale| {
                    outputs
                        .get(&scale.name)
                        .map(|a| a.index_axis(Axis(0), i))
                        .ok_or_else(|| Error::MissingScale(scale.name.clone()))
                })
            })
            .collect()
    }

    fn decode_views<'b, F>(&self, view_of: F) -> Result<Vec<Detection>>
    where
        F: Fn(&ScaleConfig) -> Result<ArrayView3<'b, f32>>,
    {
        let mut candidates = Vec::new();
        for scale in &self.config.scales {
            let decoded = self.grid(scale).decode_raw(view_of(scale)?)?;
            let before = candidates.len();
            filter_into(&decoded, &self.config.thresholds, &mut candidates);
            debug!(
                "scale {}: {} of {} slots pass the filter",
                scale.name,
                candidates.len() - before,
                decoded.len()
            );
        }
        Ok(self.suppress(candidates))
    }

    /// Decode already-encoded targets (one per scale) through the same filter
    /// and NMS as raw output.
    pub fn decode_targets(&self, targets: &[Target]) -> Result<Vec<Detection>> {
        let mut candidates = Vec::new();
        for target in targets {
            let scale = self
                .config
                .scale(&target.scale)
                .ok_or_else(|| Error::UnknownScale(target.scale.clone()))?;
            let decoded = self.grid(scale).decode_target(target)?;
            filter_into(&decoded, &self.config.thresholds, &mut candidates);
        }
        Ok(self.suppress(candidates))
    }

    /// Encode ground truth into one target per scale (best anchor over all
    /// scales).
    pub fn encode(&self, ground_truth: &[GroundTruth]) -> Vec<Target> {
        encode_all(&self.config, ground_truth)
    }

    /// Ground truth as the pipeline sees it: encoded into targets, then decoded
    /// back through the filter and NMS.
    pub fn ground_truth_via_targets(&self, ground_truth: &[GroundTruth]) -> Result<Vec<GroundTruth>> {
        let decoded = self.decode_targets(&self.encode(ground_truth))?;
        Ok(decoded.iter().map(GroundTruth::from).collect())
    }

    fn suppress(&self, candidates: Vec<Candidate>) -> Vec<Detection> {
        let keep = nms_per_class(
            &candidates,
            self.config.num_classes(),
            self.config.thresholds.nms_iou,
        );
        debug!("nms kept {} of {} candidates", keep.len(), candidates.len());

        keep.into_iter()
            .map(|i| {
                let c = &candidates[i];
                Detection {
                    bbox: c.bbox,
                    class_index: c.class_index,
                    class_name: self.config.class_names[c.class_index].clone(),
                    score: c.score,
                    objectness: c.objectness,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{iou, CornerBox};
    use crate::params::{AnchorPrior, ImageSize, Thresholds};

    fn config(scales: Vec<ScaleConfig>) -> DetectorConfig {
        DetectorConfig {
            image_size: ImageSize::new(64, 64),
            class_names: vec!["cat".into(), "dog".into()],
            scales,
            thresholds: Thresholds::default(),
        }
    }

    fn single() -> DetectorConfig {
        config(vec![ScaleConfig::new(
            "s",
            4,
            4,
            vec![AnchorPrior::new(16.0, 16.0), AnchorPrior::new(32.0, 32.0)],
        )])
    }

    /// Raw output with every objectness logit strongly negative.
    fn background(scale: &ScaleConfig, num_classes: usize) -> Array3<f32> {
        let [c, h, w] = scale.output_shape(num_classes);
        let mut a = Array3::zeros((c, h, w));
        for anchor in 0..scale.num_anchors() {
            a.index_axis_mut(Axis(0), anchor * (5 + num_classes) + 4).fill(-20.0);
        }
        a
    }

    #[test]
    fn test_low_objectness_gives_nothing() {
        let cfg = single();
        let decoder = Decoder::new(cfg.clone()).unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("s".to_string(), background(&cfg.scales[0], 2));
        assert!(decoder.decode(&outputs).unwrap().is_empty());
    }

    #[test]
    fn test_single_hot_slot() {
        let cfg = single();
        let decoder = Decoder::new(cfg.clone()).unwrap();
        let mut a = background(&cfg.scales[0], 2);
        // anchor 1 at (row 2, col 1): objectness high, class "dog"
        let base = 7;
        a[[base + 4, 2, 1]] = 10.0;
        a[[base + 6, 2, 1]] = 5.0;
        let mut outputs = BTreeMap::new();
        outputs.insert("s".to_string(), a);

        let dets = decoder.decode(&outputs).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "dog");
        // center (1.5, 2.5) cells of 16px, anchor 32x32
        let expected = CornerBox::new(8.0, 24.0, 40.0, 56.0);
        assert!(iou(&dets[0].bbox, &expected) > 0.999);
        assert!(dets[0].score > 0.9);
    }

    #[test]
    fn test_missing_and_unknown_scale() {
        let cfg = single();
        let decoder = Decoder::new(cfg.clone()).unwrap();
        let outputs: BTreeMap<String, Array3<f32>> = BTreeMap::new();
        assert!(matches!(decoder.decode(&outputs), Err(Error::MissingScale(_))));

        let mut outputs = BTreeMap::new();
        outputs.insert("s".to_string(), background(&cfg.scales[0], 2));
        outputs.insert("zzz".to_string(), background(&cfg.scales[0], 2));
        assert!(matches!(decoder.decode(&outputs), Err(Error::UnknownScale(_))));
    }

    #[test]
    fn test_wrong_channel_count_fails() {
        let decoder = Decoder::new(single()).unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("s".to_string(), Array3::zeros((12, 4, 4)));
        assert!(matches!(
            decoder.decode(&outputs),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_multi_scale_duplicates_suppressed() {
        let fine = ScaleConfig::new("fine", 4, 4, vec![AnchorPrior::new(32.0, 32.0)]);
        let coarse = ScaleConfig::new("coarse", 2, 2, vec![AnchorPrior::new(32.0, 32.0)]);
        let cfg = config(vec![fine.clone(), coarse.clone()]);
        let decoder = Decoder::new(cfg).unwrap();
        assert!(decoder.is_multi_scale());

        // both heads predict a 32x32 box centred at (32, 32)
        let mut a = background(&fine, 2);
        a[[4, 1, 1]] = 8.0;
        a[[0, 1, 1]] = 20.0; // sigmoid -> 1, cx = 2/4
        a[[1, 1, 1]] = 20.0;
        a[[5, 1, 1]] = 4.0;
        let mut b = background(&coarse, 2);
        b[[4, 0, 0]] = 6.0;
        b[[0, 0, 0]] = 20.0; // cx = 1/2
        b[[1, 0, 0]] = 20.0;
        b[[5, 0, 0]] = 4.0;

        let mut outputs = BTreeMap::new();
        outputs.insert("fine".to_string(), a);
        outputs.insert("coarse".to_string(), b);
        let dets = decoder.decode(&outputs).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_index, 0);
        // the fine head had the higher objectness
        assert!(dets[0].objectness > sigmoid_of(7.0));
    }

    fn sigmoid_of(x: f32) -> f32 {
        crate::codec::sigmoid(x)
    }

    #[test]
    fn test_decode_batch_keeps_order() {
        let cfg = single();
        let decoder = Decoder::new(cfg.clone()).unwrap();
        let first = background(&cfg.scales[0], 2);
        let mut second = background(&cfg.scales[0], 2);
        second[[4, 0, 0]] = 10.0;
        second[[5, 0, 0]] = 5.0;
        let stacked = ndarray::stack(Axis(0), &[first.view(), second.view()]).unwrap();

        let mut outputs = BTreeMap::new();
        outputs.insert("s".to_string(), stacked);
        let dets = decoder.decode_batch(&outputs).unwrap();
        assert_eq!(dets.len(), 2);
        assert!(dets[0].is_empty());
        assert_eq!(dets[1].len(), 1);
    }

    #[test]
    fn test_target_roundtrip() {
        let decoder = Decoder::new(DetectorConfig::yolo_v3_voc()).unwrap();
        let gts = vec![
            GroundTruth::new(CornerBox::new(12.0, 30.0, 140.0, 200.0), 14),
            GroundTruth::new(CornerBox::new(250.0, 260.0, 300.0, 410.0), 6),
            GroundTruth::new(CornerBox::new(5.0, 5.0, 20.0, 18.0), 2),
        ];
        let back = decoder.ground_truth_via_targets(&gts).unwrap();
        assert_eq!(back.len(), gts.len());
        for gt in &gts {
            let found = back
                .iter()
                .find(|b| b.class_index == gt.class_index)
                .unwrap();
            for (a, b) in found.bbox.to_array().iter().zip(gt.bbox.to_array()) {
                assert!((a - b).abs() < 1e-3);
            }
        }
    }
}
