use crate::codec::DecodedGrid;
use crate::geometry::CornerBox;
use crate::params::Thresholds;

/// A box that survived thresholding and waits for NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Absolute image pixels, corner form.
    pub bbox: CornerBox,
    pub class_index: usize,
    /// `objectness * best class probability`.
    pub score: f32,
    pub objectness: f32,
}

/// Index and value of the largest probability; the first one wins ties.
pub fn best_class(probs: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &p) in probs.iter().enumerate() {
        if p > best.1 {
            best = (i, p);
        }
    }
    best
}

/// Per-slot keep flags: objectness, best class probability and score must
/// each exceed their threshold.
pub fn keep_mask(grid: &DecodedGrid, thresholds: &Thresholds) -> Vec<bool> {
    (0..grid.len())
        .map(|i| {
            let objectness = grid.objectness[i];
            let (_, prob) = best_class(grid.probs(i));
            objectness > thresholds.objectness
                && prob > thresholds.class_prob
                && objectness * prob > thresholds.score
        })
        .collect()
}

/// Append every slot of `grid` passing [`keep_mask`] to `out`, in slot order.
pub fn filter_into(grid: &DecodedGrid, thresholds: &Thresholds, out: &mut Vec<Candidate>) {
    let mask = keep_mask(grid, thresholds);
    for i in (0..grid.len()).filter(|&i| mask[i]) {
        let (class_index, prob) = best_class(grid.probs(i));
        let objectness = grid.objectness[i];
        out.push(Candidate {
            bbox: grid.boxes[i],
            class_index,
            score: objectness * prob,
            objectness,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(objectness: Vec<f32>, class_probs: Vec<f32>) -> DecodedGrid {
        let n = objectness.len();
        DecodedGrid {
            boxes: (0..n)
                .map(|i| CornerBox::new(i as f32, 0.0, i as f32 + 1.0, 1.0))
                .collect(),
            objectness,
            num_classes: class_probs.len() / n,
            class_probs,
        }
    }

    #[test]
    fn test_best_class_first_wins() {
        assert_eq!(best_class(&[0.2, 0.4, 0.4]), (1, 0.4));
    }

    #[test]
    fn test_all_three_thresholds() {
        let t = Thresholds {
            nms_iou: 0.5,
            objectness: 0.3,
            class_prob: 0.5,
            score: 0.25,
            match_iou: 0.5,
        };
        let g = grid(
            vec![0.9, 0.2, 0.9, 0.4],
            vec![
                0.1, 0.9, // passes: 0.81
                0.1, 0.9, // objectness too low
                0.5, 0.5, // class prob not above 0.5
                0.4, 0.6, // score 0.24 too low
            ],
        );
        assert_eq!(keep_mask(&g, &t), vec![true, false, false, false]);

        let mut out = Vec::new();
        filter_into(&g, &t, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_index, 1);
        assert!((out[0].score - 0.81).abs() < 1e-6);
        assert_eq!(out[0].bbox, CornerBox::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_zero_thresholds_keep_everything_positive() {
        let t = Thresholds {
            nms_iou: 0.5,
            objectness: 0.0,
            class_prob: 0.0,
            score: 0.0,
            match_iou: 0.5,
        };
        let g = grid(vec![0.01, 0.02], vec![1.0, 0.0, 0.3, 0.7]);
        let mut out = Vec::new();
        filter_into(&g, &t, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_empty_grid() {
        let g = DecodedGrid::default();
        let mut out = Vec::new();
        filter_into(&g, &Thresholds::default(), &mut out);
        assert!(out.is_empty());
    }
}
