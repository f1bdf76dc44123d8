use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pascal VOC class names, in label-index order.
pub const VOC_CLASSES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Anchor prior size in input-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPrior {
    pub width: f32,
    pub height: f32,
}

impl AnchorPrior {
    pub fn new(width: f32, height: f32) -> Self {
        AnchorPrior { width, height }
    }
}

/// Network input size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        ImageSize { width, height }
    }
}

/// One detection head: its grid and its ordered anchor priors.
///
/// Anchor order is the order in which the head's output channels are laid out
/// and is used unchanged for both encoding and decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Scale identifier, e.g. `"C5"` or `"stride-32"`.
    pub name: String,
    /// Grid resolution as `[rows, cols]`.
    pub grid: [usize; 2],
    pub anchors: Vec<AnchorPrior>,
}

impl ScaleConfig {
    pub fn new(name: impl Into<String>, rows: usize, cols: usize, anchors: Vec<AnchorPrior>) -> Self {
        ScaleConfig {
            name: name.into(),
            grid: [rows, cols],
            anchors,
        }
    }

    pub fn rows(&self) -> usize {
        self.grid[0]
    }

    pub fn cols(&self) -> usize {
        self.grid[1]
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    /// Channels per anchor: `tx, ty, tw, th, objectness` plus one per class.
    pub fn values_per_anchor(num_classes: usize) -> usize {
        5 + num_classes
    }

    /// Expected `(channels, rows, cols)` of this scale's raw output.
    pub fn output_shape(&self, num_classes: usize) -> [usize; 3] {
        [
            self.num_anchors() * Self::values_per_anchor(num_classes),
            self.rows(),
            self.cols(),
        ]
    }
}

/// Filtering, suppression and matching thresholds, each in `[0, 1]`.
///
/// Setting a filter threshold to 0 disables that stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// IoU above which NMS suppresses a lower-scoring box.
    pub nms_iou: f32,
    /// Minimum objectness (exclusive).
    pub objectness: f32,
    /// Minimum best class probability (exclusive).
    pub class_prob: f32,
    /// Minimum `objectness * best class probability` (exclusive).
    pub score: f32,
    /// IoU above which a detection matches a ground-truth box during evaluation.
    pub match_iou: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            nms_iou: 0.5,
            objectness: 0.1,
            class_prob: 0.1,
            score: 0.1,
            match_iou: 0.5,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        let all = [
            ("nms_iou", self.nms_iou),
            ("objectness", self.objectness),
            ("class_prob", self.class_prob),
            ("score", self.score),
            ("match_iou", self.match_iou),
        ];
        for (name, value) in all {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }
}

/// Static description of a detector's output space.
///
/// One scale gives the single-scale (YOLOv2 style) pipeline, several give the
/// multi-scale (YOLOv3 style) one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub image_size: ImageSize,
    /// Class names; the index is the class identifier.
    pub class_names: Vec<String>,
    pub scales: Vec<ScaleConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl DetectorConfig {
    /// Load a JSON configuration file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config: DetectorConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn scale(&self, name: &str) -> Option<&ScaleConfig> {
        self.scales.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        if self.image_size.width == 0 || self.image_size.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "image size must be positive, got {}x{}",
                self.image_size.width, self.image_size.height
            )));
        }
        if self.class_names.is_empty() {
            return Err(Error::InvalidConfig("no class names given".into()));
        }
        if self.scales.is_empty() {
            return Err(Error::InvalidConfig("no scales given".into()));
        }

        let mut seen = HashSet::new();
        for scale in &self.scales {
            if !seen.insert(scale.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate scale `{}`",
                    scale.name
                )));
            }
            if scale.rows() == 0 || scale.cols() == 0 {
                return Err(Error::InvalidConfig(format!(
                    "scale `{}` has an empty grid",
                    scale.name
                )));
            }
            if scale.anchors.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "scale `{}` has no anchors",
                    scale.name
                )));
            }
            for anchor in &scale.anchors {
                let ok = anchor.width.is_finite()
                    && anchor.height.is_finite()
                    && anchor.width > 0.0
                    && anchor.height > 0.0;
                if !ok {
                    return Err(Error::InvalidConfig(format!(
                        "scale `{}` has a non-positive anchor {:?}",
                        scale.name, anchor
                    )));
                }
            }
        }
        Ok(())
    }

    /// YOLOv2 on Pascal VOC: one 13x13 head with five anchors at 416x416.
    pub fn yolo_v2_voc() -> Self {
        // anchors are published in grid units; one cell is 32 pixels
        let stride = 32.0;
        let anchors = [
            (1.3221, 1.73145),
            (3.19275, 4.00944),
            (5.05587, 8.09892),
            (9.47112, 4.84053),
            (11.2364, 10.0071),
        ]
        .iter()
        .map(|&(w, h)| AnchorPrior::new(w * stride, h * stride))
        .collect();

        DetectorConfig {
            image_size: ImageSize::new(416, 416),
            class_names: VOC_CLASSES.iter().map(|s| s.to_string()).collect(),
            scales: vec![ScaleConfig::new("C5", 13, 13, anchors)],
            thresholds: Thresholds::default(),
        }
    }

    /// YOLOv3 on Pascal VOC: three heads (strides 8, 16, 32) at 416x416.
    pub fn yolo_v3_voc() -> Self {
        let anchors = |pairs: [(f32, f32); 3]| -> Vec<AnchorPrior> {
            pairs.iter().map(|&(w, h)| AnchorPrior::new(w, h)).collect()
        };

        DetectorConfig {
            image_size: ImageSize::new(416, 416),
            class_names: VOC_CLASSES.iter().map(|s| s.to_string()).collect(),
            scales: vec![
                ScaleConfig::new("C3", 52, 52, anchors([(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)])),
                ScaleConfig::new("C4", 26, 26, anchors([(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)])),
                ScaleConfig::new(
                    "C5",
                    13,
                    13,
                    anchors([(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)]),
                ),
            ],
            thresholds: Thresholds::default(),
        }
    }
}
