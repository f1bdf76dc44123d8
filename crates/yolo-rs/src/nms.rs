//! Greedy per-class non-maximum suppression.

use std::cmp::Ordering;

use crate::filter::Candidate;
use crate::geometry::{iou, CornerBox};

/// Greedy NMS over boxes of a single class.
///
/// Returns indices into `boxes` in the order they were kept, highest score
/// first. Equal scores keep their input order. A box is suppressed when its
/// IoU with an already kept box is strictly above `iou_threshold`.
pub fn nms(boxes: &[CornerBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    // stable sort, so ties stay in input order
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut suppressed = vec![false; boxes.len()];
    let mut keep = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[pos + 1..] {
            if !suppressed[j] && iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Run [`nms`] independently for every class present in `candidates`.
///
/// Returns indices into `candidates`: class 0's survivors first, then class 1,
/// and so on; within a class, in kept order.
pub fn nms_per_class(candidates: &[Candidate], num_classes: usize, iou_threshold: f32) -> Vec<usize> {
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (i, c) in candidates.iter().enumerate() {
        if let Some(bucket) = by_class.get_mut(c.class_index) {
            bucket.push(i);
        }
    }

    let mut keep = Vec::new();
    for members in by_class.iter().filter(|m| !m.is_empty()) {
        let boxes: Vec<CornerBox> = members.iter().map(|&i| candidates[i].bbox).collect();
        let scores: Vec<f32> = members.iter().map(|&i| candidates[i].score).collect();
        keep.extend(nms(&boxes, &scores, iou_threshold).into_iter().map(|k| members[k]));
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(bbox: CornerBox, class_index: usize, score: f32) -> Candidate {
        Candidate {
            bbox,
            class_index,
            score,
            objectness: score,
        }
    }

    #[test]
    fn test_overlapping_pair_keeps_higher() {
        // IoU = 90 / 100 = 0.9
        let boxes = [
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
            CornerBox::new(0.0, 0.0, 10.0, 9.0),
        ];
        let keep = nms(&boxes, &[0.6, 0.8], 0.5);
        assert_eq!(keep, vec![1]);
    }

    #[test]
    fn test_kept_order_is_score_descending() {
        let boxes = [
            CornerBox::new(0.0, 0.0, 1.0, 1.0),
            CornerBox::new(5.0, 5.0, 6.0, 6.0),
            CornerBox::new(9.0, 9.0, 10.0, 10.0),
        ];
        assert_eq!(nms(&boxes, &[0.2, 0.9, 0.5], 0.5), vec![1, 2, 0]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let boxes = [
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
        ];
        assert_eq!(nms(&boxes, &[0.7, 0.7], 0.5), vec![0]);
    }

    #[test]
    fn test_threshold_is_strict() {
        // IoU exactly 0.5
        let boxes = [
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
            CornerBox::new(0.0, 0.0, 10.0, 5.0),
        ];
        assert_eq!(nms(&boxes, &[0.9, 0.8], 0.5).len(), 2);
    }

    #[test]
    fn test_idempotent_and_subset() {
        let boxes = [
            CornerBox::new(0.0, 0.0, 10.0, 10.0),
            CornerBox::new(1.0, 1.0, 11.0, 11.0),
            CornerBox::new(2.0, 0.0, 12.0, 10.0),
            CornerBox::new(30.0, 30.0, 40.0, 40.0),
            CornerBox::new(31.0, 30.0, 41.0, 40.0),
        ];
        let scores = [0.9, 0.8, 0.85, 0.4, 0.7];
        let keep = nms(&boxes, &scores, 0.5);
        assert!(keep.len() <= boxes.len());

        let kept_boxes: Vec<CornerBox> = keep.iter().map(|&i| boxes[i]).collect();
        let kept_scores: Vec<f32> = keep.iter().map(|&i| scores[i]).collect();
        let again = nms(&kept_boxes, &kept_scores, 0.5);
        assert_eq!(again, (0..keep.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty() {
        assert!(nms(&[], &[], 0.5).is_empty());
        assert!(nms_per_class(&[], 3, 0.5).is_empty());
    }

    #[test]
    fn test_classes_do_not_suppress_each_other() {
        let b = CornerBox::new(0.0, 0.0, 10.0, 10.0);
        let candidates = [cand(b, 1, 0.9), cand(b, 0, 0.5), cand(b, 1, 0.8)];
        let keep = nms_per_class(&candidates, 2, 0.5);
        // class 0 first, then class 1
        assert_eq!(keep, vec![1, 0]);
    }
}
