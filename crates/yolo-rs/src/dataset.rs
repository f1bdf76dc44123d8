//! Loading and indexing of the ground-truth and detector-output documents.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use ndarray::{Array3, Ix3};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::decoder::Decoder;
use crate::error::Result;
use crate::eval::{EvalSummary, Evaluator};
use crate::types::{Detection, GroundTruth, GroundTruthFile, OutputsFile, StoredTensor};

/// Ground truth and raw outputs for an evaluation run, indexed by image id.
pub struct Dataset {
    pub ground_truth: GroundTruthFile,
    pub outputs: OutputsFile,
    /// img_id -> index into ground_truth.images
    gt_index: HashMap<u64, usize>,
    /// img_id -> index into outputs.images
    out_index: HashMap<u64, usize>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

/// Turn a stored `(channels, rows, cols)` tensor into an array.
pub fn to_array(tensor: &StoredTensor) -> Result<Array3<f32>> {
    let array = ndarray::ArrayD::from_shape_vec(tensor.shape.clone(), tensor.data.clone())?;
    Ok(array.into_dimensionality::<Ix3>()?)
}

impl Dataset {
    /// Load both JSON documents and build indices.
    pub fn new(gt_file: &Path, outputs_file: &Path) -> Result<Self> {
        let ground_truth: GroundTruthFile = read_json(gt_file)?;
        let outputs: OutputsFile = read_json(outputs_file)?;
        Ok(Self::from_parts(ground_truth, outputs))
    }

    pub fn from_parts(ground_truth: GroundTruthFile, outputs: OutputsFile) -> Self {
        let gt_index = ground_truth
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| (img.id, i))
            .collect();
        let out_index = outputs
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| (img.id, i))
            .collect();
        Dataset {
            ground_truth,
            outputs,
            gt_index,
            out_index,
        }
    }

    /// Ids of every image in either document, ascending.
    pub fn image_ids(&self) -> Vec<u64> {
        let ids: BTreeSet<u64> = self
            .gt_index
            .keys()
            .chain(self.out_index.keys())
            .copied()
            .collect();
        ids.into_iter().collect()
    }

    /// Ground truth of an image; empty when the image has no annotations.
    pub fn ground_truth_for(&self, img_id: u64) -> &[GroundTruth] {
        self.gt_index
            .get(&img_id)
            .map(|&i| self.ground_truth.images[i].boxes.as_slice())
            .unwrap_or(&[])
    }

    /// Raw outputs of an image keyed by scale name, or `None` if absent.
    pub fn outputs_for(&self, img_id: u64) -> Result<Option<BTreeMap<String, Array3<f32>>>> {
        let Some(&i) = self.out_index.get(&img_id) else {
            return Ok(None);
        };
        let mut scales = BTreeMap::new();
        for (name, tensor) in &self.outputs.images[i].scales {
            scales.insert(name.clone(), to_array(tensor)?);
        }
        Ok(Some(scales))
    }

    fn prepare_image(
        &self,
        decoder: &Decoder,
        img_id: u64,
        through_targets: bool,
    ) -> Result<(Vec<Detection>, Vec<GroundTruth>)> {
        let detections = match self.outputs_for(img_id)? {
            Some(outputs) => decoder.decode(&outputs)?,
            None => {
                warn!("image {} has no detector output", img_id);
                Vec::new()
            }
        };
        let annotations = self.ground_truth_for(img_id);
        let ground_truth = if through_targets {
            decoder.ground_truth_via_targets(annotations)?
        } else {
            annotations.to_vec()
        };
        Ok((detections, ground_truth))
    }

    /// Decode every image and evaluate it against its ground truth.
    ///
    /// With `through_targets` the annotations are encoded into targets and
    /// decoded through the same pipeline as the predictions before matching.
    pub fn evaluate(&self, decoder: &Decoder, through_targets: bool) -> Result<EvalSummary> {
        let ids = self.image_ids();
        info!("decoding {} images", ids.len());

        let images = ids
            .par_iter()
            .map(|&id| self.prepare_image(decoder, id, through_targets))
            .collect::<Result<Vec<_>>>()?;

        let mut evaluator = Evaluator::from_config(decoder.config())?;
        evaluator.evaluate_batch(&images);
        Ok(evaluator.finalize())
    }

    /// Decoded detections of every image, ascending by id.
    pub fn detections(&self, decoder: &Decoder) -> Result<Vec<(u64, Vec<Detection>)>> {
        self.image_ids()
            .par_iter()
            .map(|&id| -> Result<(u64, Vec<Detection>)> {
                let dets = match self.outputs_for(id)? {
                    Some(outputs) => decoder.decode(&outputs)?,
                    None => Vec::new(),
                };
                Ok((id, dets))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::geometry::CornerBox;
    use crate::types::{ImageAnnotations, ImageOutputs};

    #[test]
    fn test_to_array_checks_rank() {
        let ok = StoredTensor {
            shape: vec![2, 1, 3],
            data: vec![0.0; 6],
        };
        assert_eq!(to_array(&ok).unwrap().dim(), (2, 1, 3));

        let bad_len = StoredTensor {
            shape: vec![2, 1, 3],
            data: vec![0.0; 5],
        };
        assert!(matches!(to_array(&bad_len), Err(Error::Tensor(_))));

        let bad_rank = StoredTensor {
            shape: vec![6],
            data: vec![0.0; 6],
        };
        assert!(to_array(&bad_rank).is_err());
    }

    #[test]
    fn test_index_and_ids() {
        let gt = GroundTruthFile {
            images: vec![
                ImageAnnotations {
                    id: 3,
                    boxes: vec![GroundTruth::new(CornerBox::new(0.0, 0.0, 4.0, 4.0), 0)],
                },
                ImageAnnotations { id: 1, boxes: vec![] },
            ],
        };
        let outputs = OutputsFile {
            images: vec![ImageOutputs {
                id: 7,
                scales: BTreeMap::new(),
            }],
        };
        let ds = Dataset::from_parts(gt, outputs);
        assert_eq!(ds.image_ids(), vec![1, 3, 7]);
        assert_eq!(ds.ground_truth_for(3).len(), 1);
        assert!(ds.ground_truth_for(7).is_empty());
        assert!(ds.outputs_for(3).unwrap().is_none());
        assert!(ds.outputs_for(7).unwrap().unwrap().is_empty());
    }
}
