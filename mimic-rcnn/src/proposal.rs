//! Proposal selection from anchor scores and deltas.

use crate::{batch::batch_slice, common::*};

/// The unit window in normalized coordinates.
pub const UNIT_WINDOW: [f64; 4] = [0.0, 0.0, 1.0, 1.0];

/// Refine `[num, 4]` boxes by `[num, 4]` deltas in `(dy, dx, log(dh), log(dw))`.
pub fn apply_box_deltas(boxes: &Tensor, deltas: &Tensor) -> Result<Tensor> {
    let refined = TlbrTensor::from_packed(boxes)?
        .to_cycxhw()
        .apply_deltas(deltas)?
        .to_tlbr()
        .to_packed();
    Ok(refined)
}

/// Clamp `[num, 4]` boxes into a `[y1, x1, y2, x2]` window.
pub fn clip_boxes(boxes: &Tensor, window: [f64; 4]) -> Result<Tensor> {
    Ok(TlbrTensor::from_packed(boxes)?
        .clip_to_window(window)
        .to_packed())
}

#[derive(Debug, Clone)]
pub struct ProposalLayerInit {
    pub proposal_count: i64,
    pub nms_threshold: f64,
    pub pre_nms_limit: i64,
    pub rpn_bbox_std_dev: [f64; 4],
}

impl ProposalLayerInit {
    pub fn build(self) -> Result<ProposalLayer> {
        let Self {
            proposal_count,
            nms_threshold,
            pre_nms_limit,
            rpn_bbox_std_dev,
        } = self;

        ensure!(
            proposal_count > 0,
            "proposal_count must be positive, but get {}",
            proposal_count
        );
        ensure!(
            (0.0..=1.0).contains(&nms_threshold),
            "nms_threshold must be in range [0, 1], but get {}",
            nms_threshold
        );
        ensure!(pre_nms_limit > 0, "pre_nms_limit must be positive");
        ensure!(
            rpn_bbox_std_dev.iter().all(|&std| std > 0.0),
            "rpn_bbox_std_dev must be positive"
        );

        Ok(ProposalLayer {
            proposal_count,
            nms_threshold,
            pre_nms_limit,
            rpn_bbox_std_dev,
        })
    }
}

/// Selects a fixed number of proposals per image.
///
/// Per image, the top scoring anchors are refined by their deltas, clipped
/// to the unit window and suppressed greedily. The survivors are padded with
/// all-zero boxes to exactly `proposal_count` rows.
#[derive(Debug, Clone, CopyGetters)]
pub struct ProposalLayer {
    #[getset(get_copy = "pub")]
    proposal_count: i64,
    #[getset(get_copy = "pub")]
    nms_threshold: f64,
    pre_nms_limit: i64,
    rpn_bbox_std_dev: [f64; 4],
}

impl ProposalLayer {
    /// Returns proposals in shape `[batch, proposal_count, 4]`.
    ///
    /// `probs` is `[batch, num_anchors, 2]`, `deltas` is
    /// `[batch, num_anchors, 4]` and `anchors` is `[num_anchors, 4]`.
    pub fn forward(&self, probs: &Tensor, deltas: &Tensor, anchors: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| -> Result<_> {
            let (batch_size, num_anchors, num_classes) = probs.size3()?;
            ensure!(num_classes == 2, "expect background/foreground probabilities");
            ensure!(
                deltas.size() == vec![batch_size, num_anchors, 4],
                "expect [{}, {}, 4] deltas, but get shape {:?}",
                batch_size,
                num_anchors,
                deltas.size()
            );
            ensure!(
                anchors.size() == vec![num_anchors, 4],
                "expect [{}, 4] anchors, but get shape {:?}",
                num_anchors,
                anchors.size()
            );

            let scores = probs.select(2, 1);
            let std_dev = Tensor::of_slice(&self.rpn_bbox_std_dev)
                .to_kind(deltas.kind())
                .to_device(deltas.device())
                .view([1, 1, 4]);
            let deltas = deltas * std_dev;

            let mut outputs = batch_slice(
                &[&scores, &deltas],
                |slices| {
                    let proposals = self.forward_single(&slices[0], &slices[1], anchors)?;
                    Ok(vec![proposals])
                },
                batch_size,
            )?;
            Ok(outputs.remove(0))
        })
    }

    fn forward_single(&self, scores: &Tensor, deltas: &Tensor, anchors: &Tensor) -> Result<Tensor> {
        let num_anchors = scores.size1()?;
        let limit = self.pre_nms_limit.min(num_anchors);

        let (top_scores, top_index) = scores.topk(limit, 0, true, true);
        let pre_nms_anchors = anchors.index_select(0, &top_index);
        let pre_nms_deltas = deltas.index_select(0, &top_index);

        let boxes = apply_box_deltas(&pre_nms_anchors, &pre_nms_deltas)?;
        let boxes = TlbrTensor::from_packed(&boxes)?.clip_to_window(UNIT_WINDOW);

        let keep = nms(
            &boxes,
            &top_scores,
            self.nms_threshold,
            Some(self.proposal_count as usize),
        )?;
        let proposals = boxes.index_select(&keep).to_packed();
        Ok(proposals.f_pad_rows(self.proposal_count)?)
    }
}
