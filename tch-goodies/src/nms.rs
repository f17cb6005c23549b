use crate::{boxes::TlbrTensor, common::*};
use bbox::prelude::*;

/// Greedy non-maximum suppression.
///
/// Boxes are visited in descending score order. A box is kept unless it
/// overlaps an already kept box with IoU at or above `iou_threshold`.
/// Returns the kept indexes in visiting order, at most `max_output` of them.
pub fn nms(
    bboxes: &TlbrTensor,
    scores: &Tensor,
    iou_threshold: f64,
    max_output: Option<usize>,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        let n_bboxes = bboxes.num_samples();
        let n_scores = scores
            .size1()
            .map_err(|_| format_err!("scores should be a 1d tensor"))?;
        ensure!(
            n_bboxes == n_scores,
            "boxes and scores should have same number of elements in dimension 0"
        );
        ensure!(
            (0.0..=1.0).contains(&iou_threshold),
            "iou_threshold must be in range [0, 1]"
        );

        let device = bboxes.device();
        let max_output = max_output.unwrap_or(n_bboxes as usize);
        let rects = bboxes.to_rects();
        let scores = Vec::<f32>::from(&scores.to_kind(Kind::Float));

        let order: Vec<usize> = (0..rects.len())
            .sorted_by(|&lhs, &rhs| scores[rhs].total_cmp(&scores[lhs]))
            .collect();

        let mut keep: Vec<i64> = vec![];

        for &index in &order {
            if keep.len() >= max_output {
                break;
            }

            let candidate = &rects[index];
            let suppressed = keep.iter().any(|&kept| {
                let iou = candidate.iou_with(&rects[kept as usize], 1e-8) as f64;
                iou > 0.0 && iou >= iou_threshold
            });

            if !suppressed {
                keep.push(index as i64);
            }
        }

        Ok(Tensor::of_slice(&keep)
            .set_requires_grad(false)
            .to_device(device))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_overlapping_boxes() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0.0f32, 0.0, 0.5, 0.5, // highest score
            0.0, 0.05, 0.5, 0.55, // overlaps the first
            0.6, 0.6, 0.9, 0.9, // disjoint
        ])
        .view([3, 4]);
        let scores = Tensor::of_slice(&[0.9f32, 0.8, 0.7]);
        let boxes = TlbrTensor::from_packed(&boxes)?;

        let keep = Vec::<i64>::from(&nms(&boxes, &scores, 0.7, None)?);
        assert_eq!(keep, vec![0, 2]);

        let keep = Vec::<i64>::from(&nms(&boxes, &scores, 0.7, Some(1))?);
        assert_eq!(keep, vec![0]);
        Ok(())
    }
}
