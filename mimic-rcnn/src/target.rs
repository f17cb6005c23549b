//! Training targets for the RPN and for proposal sampling.

use crate::{common::*, config::MimicConfig};

pub use detection_targets::*;
pub use rpn_targets::*;

mod detection_targets {
    use super::*;

    /// Sampled ROIs of one image and their regression targets.
    ///
    /// All tensors have `train_rois_per_image` rows. Negative ROIs and
    /// zero padding carry class id 0 and zero deltas.
    #[derive(Debug, TensorLike)]
    pub struct DetectionTargets {
        /// Sampled ROIs in shape `[rois, 4]`, positives first.
        pub rois: Tensor,
        /// Target class ids in shape `[rois]`.
        pub class_ids: Tensor,
        /// Normalized target deltas in shape `[rois, 4]`.
        pub deltas: Tensor,
        /// Target masks in shape `[rois, mask_h, mask_w]`.
        pub masks: Option<Tensor>,
    }

    /// Assigns ground truth to the proposals of one image.
    pub trait DetectionTargetAssigner: Debug + Send {
        /// `proposals` is `[num_proposals, 4]` zero padded, `gt_class_ids` is
        /// `[num_gt]` where 0 marks padding and negative ids mark crowd boxes,
        /// `gt_boxes` is `[num_gt, 4]` in normalized coordinates and
        /// `gt_masks` is `[num_gt, image_h, image_w]`.
        fn assign(
            &self,
            proposals: &Tensor,
            gt_class_ids: &Tensor,
            gt_boxes: &Tensor,
            gt_masks: Option<&Tensor>,
        ) -> Result<DetectionTargets>;
    }

    #[derive(Debug, Clone)]
    pub struct ProposalTargetSamplerInit {
        pub train_rois_per_image: i64,
        pub roi_positive_ratio: f64,
        pub bbox_std_dev: [f64; 4],
        pub mask_shape: [i64; 2],
        pub positive_iou: f64,
        pub crowd_iou: f64,
    }

    impl ProposalTargetSamplerInit {
        pub fn from_config(config: &MimicConfig) -> Self {
            Self {
                train_rois_per_image: config.train_rois_per_image,
                roi_positive_ratio: config.roi_positive_ratio.raw(),
                bbox_std_dev: config.bbox_std_dev(),
                mask_shape: config.mask_shape,
                positive_iou: 0.5,
                crowd_iou: 0.001,
            }
        }

        pub fn build(self) -> Result<ProposalTargetSampler> {
            let Self {
                train_rois_per_image,
                roi_positive_ratio,
                bbox_std_dev,
                mask_shape,
                positive_iou,
                crowd_iou,
            } = self;
            ensure!(
                train_rois_per_image > 0,
                "train_rois_per_image must be positive"
            );
            ensure!(
                roi_positive_ratio > 0.0 && roi_positive_ratio <= 1.0,
                "roi_positive_ratio must be in range (0, 1]"
            );
            ensure!(
                (0.0..=1.0).contains(&positive_iou) && (0.0..=1.0).contains(&crowd_iou),
                "IoU thresholds must be in range [0, 1]"
            );
            ensure!(
                bbox_std_dev.iter().all(|&std| std > 0.0),
                "bbox_std_dev must be positive"
            );

            Ok(ProposalTargetSampler {
                train_rois_per_image,
                roi_positive_ratio,
                bbox_std_dev,
                mask_shape,
                positive_iou,
                crowd_iou,
            })
        }
    }

    /// Samples positive and negative ROIs by IoU with ground truth.
    ///
    /// ROIs with IoU at least `positive_iou` against any box are positive.
    /// Those below are negative unless they touch a crowd box. Positives are
    /// capped at `roi_positive_ratio` of the ROI budget and negatives keep
    /// that ratio. An image without ground truth yields no ROI at all.
    #[derive(Debug, Clone)]
    pub struct ProposalTargetSampler {
        train_rois_per_image: i64,
        roi_positive_ratio: f64,
        bbox_std_dev: [f64; 4],
        mask_shape: [i64; 2],
        positive_iou: f64,
        crowd_iou: f64,
    }

    impl ProposalTargetSampler {
        fn empty_targets(&self, device: Device, with_masks: bool) -> DetectionTargets {
            let rois = self.train_rois_per_image;
            let [mask_h, mask_w] = self.mask_shape;
            DetectionTargets {
                rois: Tensor::zeros(&[rois, 4], (Kind::Float, device)),
                class_ids: Tensor::zeros(&[rois], (Kind::Int64, device)),
                deltas: Tensor::zeros(&[rois, 4], (Kind::Float, device)),
                masks: with_masks
                    .then(|| Tensor::zeros(&[rois, mask_h, mask_w], (Kind::Float, device))),
            }
        }

        /// Shuffle the indexes selected by `mask` and keep at most `limit`.
        fn sample(mask: &Tensor, limit: i64) -> Tensor {
            let indexes = mask.nonzero().view([-1]);
            let count = indexes.size()[0];
            let order = Tensor::randperm(count, (Kind::Int64, indexes.device()));
            indexes.index_select(0, &order).narrow(0, 0, limit.min(count))
        }

        /// Crop each ROI out of its assigned full-image mask and resize it.
        fn mask_targets(&self, rois: &TlbrTensor, masks: &Tensor) -> Result<Tensor> {
            let (num_rois, mask_h, mask_w) = masks.size3()?;
            let [out_h, out_w] = self.mask_shape;
            let device = masks.device();

            let crops: Vec<_> = rois
                .to_rects()
                .into_iter()
                .zip(0..num_rois)
                .map(|(rect, index)| -> Result<_> {
                    let cells = rect
                        .clip_to(&TLBR::unit_window())
                        .to_grid_cells(mask_h as f32, mask_w as f32);
                    let [t, l, b, r] = cells.tlbr();
                    let (b, r) = (b.min(mask_h), r.min(mask_w));
                    if b <= t || r <= l {
                        return Ok(Tensor::zeros(&[out_h, out_w], (Kind::Float, device)));
                    }
                    let crop = masks
                        .get(index)
                        .narrow(0, t, b - t)
                        .narrow(1, l, r - l)
                        .to_kind(Kind::Float)
                        .view([1, 1, b - t, r - l]);
                    let resized = crop
                        .f_upsample_bilinear2d(&[out_h, out_w], false, None, None)?
                        .view([out_h, out_w])
                        .round();
                    Ok(resized)
                })
                .try_collect()?;

            if crops.is_empty() {
                return Ok(Tensor::zeros(&[0, out_h, out_w], (Kind::Float, device)));
            }
            Ok(Tensor::f_stack(&crops, 0)?)
        }
    }

    impl DetectionTargetAssigner for ProposalTargetSampler {
        fn assign(
            &self,
            proposals: &Tensor,
            gt_class_ids: &Tensor,
            gt_boxes: &Tensor,
            gt_masks: Option<&Tensor>,
        ) -> Result<DetectionTargets> {
            tch::no_grad(|| -> Result<_> {
                let device = proposals.device();
                let num_gt = gt_class_ids.size1()?;
                ensure!(
                    gt_boxes.size() == vec![num_gt, 4],
                    "expect [{}, 4] ground truth boxes, but get shape {:?}",
                    num_gt,
                    gt_boxes.size()
                );
                if let Some(gt_masks) = gt_masks {
                    let (num_masks, _, _) = gt_masks.size3()?;
                    ensure!(num_masks == num_gt, "the number of masks must match boxes");
                }

                // drop zero padded proposals
                let proposals = {
                    let valid = proposals.abs().sum_dim_intlist(&[1], false, Kind::Float).gt(0.0);
                    proposals.index_select(0, &valid.nonzero().view([-1]))
                };

                let gt_index = gt_class_ids.gt(0).nonzero().view([-1]);
                let crowd_index = gt_class_ids.lt(0).nonzero().view([-1]);
                if gt_index.size()[0] == 0 || proposals.size()[0] == 0 {
                    return Ok(self.empty_targets(device, gt_masks.is_some()));
                }

                let class_ids = gt_class_ids.index_select(0, &gt_index);
                let boxes = TlbrTensor::from_packed(&gt_boxes.index_select(0, &gt_index))?;
                let masks = gt_masks.map(|masks| masks.index_select(0, &gt_index));
                let proposals = TlbrTensor::from_packed(&proposals)?;

                let overlaps = proposals.iou_matrix(&boxes);
                let (roi_iou_max, _) = overlaps.max_dim(1, false);

                let no_crowd = if crowd_index.size()[0] > 0 {
                    let crowd = TlbrTensor::from_packed(&gt_boxes.index_select(0, &crowd_index))?;
                    let (crowd_iou_max, _) = proposals.iou_matrix(&crowd).max_dim(1, false);
                    crowd_iou_max.lt(self.crowd_iou)
                } else {
                    roi_iou_max.ones_like().to_kind(Kind::Bool)
                };

                let positive_mask = roi_iou_max.ge(self.positive_iou);
                let negative_mask = roi_iou_max.lt(self.positive_iou).logical_and(&no_crowd);

                let positive_limit =
                    (self.train_rois_per_image as f64 * self.roi_positive_ratio) as i64;
                let positive_index = Self::sample(&positive_mask, positive_limit);
                let num_positive = positive_index.size()[0];
                let negative_limit =
                    (num_positive as f64 / self.roi_positive_ratio) as i64 - num_positive;
                let negative_index = Self::sample(&negative_mask, negative_limit);

                let positive_rois = proposals.index_select(&positive_index);
                let negative_rois = proposals.index_select(&negative_index);

                let assignment = overlaps
                    .index_select(0, &positive_index)
                    .argmax(Some(1), false);
                let roi_gt_boxes = boxes.index_select(&assignment);
                let roi_class_ids = class_ids.index_select(0, &assignment);

                let std_dev = Tensor::of_slice(&self.bbox_std_dev)
                    .to_kind(Kind::Float)
                    .to_device(device)
                    .view([1, 4]);
                let deltas = positive_rois
                    .to_cycxhw()
                    .deltas_to(&roi_gt_boxes.to_cycxhw())
                    / std_dev;

                let masks = masks
                    .map(|masks| {
                        let assigned = masks.index_select(0, &assignment);
                        self.mask_targets(&positive_rois, &assigned)
                    })
                    .transpose()?;

                let rois = Tensor::cat(&[positive_rois.to_packed(), negative_rois.to_packed()], 0);
                let num_rois = self.train_rois_per_image;

                Ok(DetectionTargets {
                    rois: rois.f_pad_rows(num_rois)?,
                    class_ids: roi_class_ids.f_pad_rows(num_rois)?,
                    deltas: deltas.f_pad_rows(num_rois)?,
                    masks: masks.map(|masks| masks.f_pad_rows(num_rois)).transpose()?,
                })
            })
        }
    }
}

mod rpn_targets {
    use super::*;

    /// Anchor labels and regression targets of one image.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RpnTargets {
        /// 1 for positive, -1 for negative and 0 for ignored anchors.
        pub matches: Vec<i64>,
        /// Normalized deltas of positive anchors in anchor order, zero padded
        /// to the number of trained anchors.
        pub deltas: Vec<BoxDelta<f32>>,
    }

    impl RpnTargets {
        /// Returns `[num_anchors]` matches and `[num_train_anchors, 4]` deltas.
        pub fn to_tensors(&self) -> (Tensor, Tensor) {
            let matches = Tensor::of_slice(&self.matches);
            let deltas: Vec<f32> = self.deltas.iter().flat_map(|delta| delta.to_array()).collect();
            let deltas = Tensor::of_slice(&deltas).view([-1, 4]);
            (matches, deltas)
        }
    }

    /// Labels anchors against ground truth for RPN training.
    #[derive(Debug, Clone)]
    pub struct RpnTargetBuilder {
        pub train_anchors_per_image: usize,
        pub rpn_bbox_std_dev: [f32; 4],
        pub positive_iou: f32,
        pub negative_iou: f32,
        pub crowd_iou: f32,
    }

    impl RpnTargetBuilder {
        pub fn from_config(config: &MimicConfig) -> Self {
            Self {
                train_anchors_per_image: config.rpn_train_anchors_per_image,
                rpn_bbox_std_dev: config.rpn_bbox_std_dev().map(|std| std as f32),
                positive_iou: 0.7,
                negative_iou: 0.3,
                crowd_iou: 0.001,
            }
        }

        /// Label pixel anchors against pixel ground truth boxes.
        ///
        /// Anchors with IoU at least `positive_iou` are positive, and so is
        /// the best anchor of each box. Anchors below `negative_iou` that do
        /// not touch a crowd box (negative class id) are negative. At most
        /// half of the trained anchors are positive and negatives fill the
        /// rest; surplus labels are reset to 0 at random.
        pub fn build_rpn_targets<R>(
            &self,
            anchors: &[TLBR<f32>],
            gt_class_ids: &[i64],
            gt_boxes: &[TLBR<f32>],
            rng: &mut R,
        ) -> Result<RpnTargets>
        where
            R: Rng + ?Sized,
        {
            ensure!(
                gt_class_ids.len() == gt_boxes.len(),
                "the number of class ids and boxes must match"
            );

            let (crowd_boxes, gt): (Vec<_>, Vec<_>) = gt_class_ids
                .iter()
                .zip(gt_boxes)
                .filter(|&(&class_id, _)| class_id != 0)
                .partition(|&(&class_id, _)| class_id < 0);
            let crowd_boxes: Vec<_> = crowd_boxes.into_iter().map(|(_, rect)| rect).collect();
            let gt: Vec<_> = gt.into_iter().map(|(_, rect)| rect).collect();

            // (best IoU, best box index) per anchor
            let anchor_best: Vec<(f32, Option<usize>)> = anchors
                .iter()
                .map(|anchor| {
                    gt.iter()
                        .enumerate()
                        .map(|(index, rect)| (anchor.iou_with(*rect, 0.0), Some(index)))
                        .fold((0.0, None), |best, curr| if curr.0 > best.0 { curr } else { best })
                })
                .collect();

            let mut matches: Vec<i64> = anchors
                .iter()
                .zip(&anchor_best)
                .map(|(anchor, &(iou, _))| {
                    let touches_crowd = crowd_boxes
                        .iter()
                        .any(|crowd| anchor.iou_with(*crowd, 0.0) >= self.crowd_iou);
                    if iou < self.negative_iou && !touches_crowd {
                        -1
                    } else {
                        0
                    }
                })
                .collect();

            // the best anchors of each box, ties included
            for rect in &gt {
                let ious: Vec<f32> = anchors
                    .iter()
                    .map(|anchor| anchor.iou_with(*rect, 0.0))
                    .collect();
                let max_iou = ious.iter().copied().fold(0.0f32, f32::max);
                if max_iou > 0.0 {
                    ious.iter()
                        .zip(matches.iter_mut())
                        .filter(|&(&iou, _)| iou == max_iou)
                        .for_each(|(_, label)| *label = 1);
                }
            }

            anchor_best
                .iter()
                .zip(matches.iter_mut())
                .filter(|((iou, _), _)| *iou >= self.positive_iou)
                .for_each(|(_, label)| *label = 1);

            // balance positives and negatives
            let positive_limit = self.train_anchors_per_image / 2;
            Self::reset_surplus(&mut matches, 1, positive_limit, rng);
            let num_positive = matches.iter().filter(|&&label| label == 1).count();
            let negative_limit = self.train_anchors_per_image - num_positive;
            Self::reset_surplus(&mut matches, -1, negative_limit, rng);

            let mut deltas: Vec<_> = matches
                .iter()
                .zip(anchors)
                .zip(&anchor_best)
                .filter(|&((&label, _), _)| label == 1)
                .map(|((_, anchor), &(_, best))| -> Result<_> {
                    // a positive anchor always has a best box since it
                    // either passed the IoU threshold or was a best anchor
                    let gt_index =
                        best.ok_or_else(|| format_err!("positive anchor without ground truth"))?;
                    let delta = anchor
                        .to_cycxhw()
                        .deltas_to(&gt[gt_index].to_cycxhw())
                        .normalize(self.rpn_bbox_std_dev);
                    Ok(delta)
                })
                .try_collect()?;
            deltas.resize(self.train_anchors_per_image, BoxDelta::zeros());

            Ok(RpnTargets { matches, deltas })
        }

        fn reset_surplus<R>(matches: &mut [i64], label: i64, limit: usize, rng: &mut R)
        where
            R: Rng + ?Sized,
        {
            let indexes: Vec<usize> = matches
                .iter()
                .enumerate()
                .filter(|&(_, &value)| value == label)
                .map(|(index, _)| index)
                .collect();
            if indexes.len() <= limit {
                return;
            }
            let surplus = indexes.len() - limit;
            indexes
                .choose_multiple(rng, surplus)
                .for_each(|&index| matches[index] = 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> Result<ProposalTargetSampler> {
        ProposalTargetSamplerInit {
            train_rois_per_image: 8,
            roi_positive_ratio: 0.5,
            bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
            mask_shape: [4, 4],
            positive_iou: 0.5,
            crowd_iou: 0.001,
        }
        .build()
    }

    #[test]
    fn sampled_rois_are_balanced() -> Result<()> {
        let proposals = Tensor::of_slice(&[
            0.0f32, 0.0, 0.5, 0.5, // matches the box
            0.0, 0.0, 0.45, 0.5, // matches the box
            0.6, 0.6, 0.9, 0.9, // background
            0.5, 0.0, 1.0, 0.4, // background
            0.0, 0.0, 0.0, 0.0, // padding
        ])
        .view([5, 4]);
        let gt_class_ids = Tensor::of_slice(&[3i64, 0]);
        let gt_boxes = Tensor::of_slice(&[0.0f32, 0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]).view([2, 4]);
        let gt_masks = Tensor::ones(&[2, 16, 16], (Kind::Uint8, Device::Cpu));

        let targets = sampler()?.assign(&proposals, &gt_class_ids, &gt_boxes, Some(&gt_masks))?;
        assert_eq!(targets.rois.size(), vec![8, 4]);
        assert_eq!(
            Vec::<i64>::from(&targets.class_ids),
            vec![3, 3, 0, 0, 0, 0, 0, 0]
        );

        // two positives and two negatives
        let valid = targets
            .rois
            .abs()
            .sum_dim_intlist(&[1], false, Kind::Float)
            .gt(0.0);
        assert_eq!(i64::from(valid.sum(Kind::Int64)), 4);

        let masks = targets.masks.unwrap();
        assert_eq!(masks.size(), vec![8, 4, 4]);
        assert_eq!(f64::from(masks.get(0).sum(Kind::Float)), 16.0);
        assert_eq!(f64::from(masks.get(2).sum(Kind::Float)), 0.0);
        Ok(())
    }

    #[test]
    fn image_without_ground_truth_has_no_rois() -> Result<()> {
        let proposals = Tensor::of_slice(&[0.1f32, 0.1, 0.4, 0.4]).view([1, 4]);
        let gt_class_ids = Tensor::zeros(&[3], (Kind::Int64, Device::Cpu));
        let gt_boxes = Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu));

        let targets = sampler()?.assign(&proposals, &gt_class_ids, &gt_boxes, None)?;
        assert_eq!(targets.rois.size(), vec![8, 4]);
        assert_eq!(f64::from(targets.rois.abs().sum(Kind::Float)), 0.0);
        assert!(targets.masks.is_none());
        Ok(())
    }

    #[test]
    fn rpn_targets_label_best_anchor() -> Result<()> {
        let anchors = vec![
            TLBR::from_tlbr([0.0, 0.0, 16.0, 16.0]),
            TLBR::from_tlbr([0.0, 8.0, 16.0, 24.0]),
            TLBR::from_tlbr([32.0, 32.0, 48.0, 48.0]),
            TLBR::from_tlbr([100.0, 100.0, 116.0, 116.0]),
        ];
        let gt_boxes = vec![TLBR::from_tlbr([2.0, 1.0, 14.0, 15.0])];
        let builder = RpnTargetBuilder {
            train_anchors_per_image: 4,
            rpn_bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
            positive_iou: 0.7,
            negative_iou: 0.3,
            crowd_iou: 0.001,
        };

        let mut rng = StdRng::seed_from_u64(0);
        let targets = builder.build_rpn_targets(&anchors, &[1], &gt_boxes, &mut rng)?;
        assert_eq!(targets.matches[0], 1);
        assert_eq!(targets.matches[2], -1);
        assert_eq!(targets.matches[3], -1);
        assert_eq!(targets.deltas.len(), 4);

        let delta = targets.deltas[0];
        approx::assert_abs_diff_eq!(delta.dy, 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(delta.dx, 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(delta.dh, (12.0f32 / 16.0).ln() / 0.2, epsilon = 1e-5);
        assert_eq!(targets.deltas[1], BoxDelta::zeros());

        let (matches, deltas) = targets.to_tensors();
        assert_eq!(matches.size(), vec![4]);
        assert_eq!(deltas.size(), vec![4, 4]);
        Ok(())
    }

    #[test]
    fn rpn_targets_respect_budget() -> Result<()> {
        let anchors: Vec<_> = (0..100)
            .map(|index| {
                let offset = index as f32 * 20.0;
                TLBR::from_tlbr([offset, 0.0, offset + 16.0, 16.0])
            })
            .collect();
        let builder = RpnTargetBuilder {
            train_anchors_per_image: 10,
            rpn_bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
            positive_iou: 0.7,
            negative_iou: 0.3,
            crowd_iou: 0.001,
        };
        let mut rng = StdRng::seed_from_u64(1);

        // no ground truth at all
        let targets = builder.build_rpn_targets(&anchors, &[], &[], &mut rng)?;
        assert_eq!(targets.matches.iter().filter(|&&label| label == -1).count(), 10);
        assert_eq!(targets.matches.iter().filter(|&&label| label == 1).count(), 0);

        // a crowd box excludes the anchors it touches from negatives
        let crowd = vec![TLBR::from_tlbr([0.0, 0.0, 2000.0, 16.0])];
        let targets = builder.build_rpn_targets(&anchors, &[-1], &crowd, &mut rng)?;
        assert!(targets.matches.iter().all(|&label| label == 0));
        Ok(())
    }
}
