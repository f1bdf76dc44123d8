use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geometry::CornerBox;

/// A ground-truth box in absolute image pixels (corner form) with its label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub bbox: CornerBox,
    #[serde(rename = "category")]
    pub class_index: usize,
}

impl GroundTruth {
    pub fn new(bbox: CornerBox, class_index: usize) -> Self {
        GroundTruth { bbox, class_index }
    }
}

/// A final detection: absolute pixel corner box, class and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: CornerBox,
    pub class_index: usize,
    pub class_name: String,
    /// `objectness * best class probability`.
    pub score: f32,
    pub objectness: f32,
}

impl From<&Detection> for GroundTruth {
    fn from(det: &Detection) -> Self {
        GroundTruth::new(det.bbox, det.class_index)
    }
}

/// Ground-truth annotations for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnnotations {
    pub id: u64,
    #[serde(default)]
    pub boxes: Vec<GroundTruth>,
}

/// Ground-truth interchange document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundTruthFile {
    #[serde(default)]
    pub images: Vec<ImageAnnotations>,
}

/// A dense tensor stored as its shape plus row-major values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Raw detector output for one image, keyed by scale name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutputs {
    pub id: u64,
    pub scales: BTreeMap<String, StoredTensor>,
}

/// Detector output interchange document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputsFile {
    #[serde(default)]
    pub images: Vec<ImageOutputs>,
}
