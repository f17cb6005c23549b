//! Region proposal network head.

use crate::common::*;

/// Anchor scores and box deltas concatenated over pyramid levels.
#[derive(Debug, TensorLike)]
pub struct RpnOutput {
    /// Background/foreground logits in shape `[batch, num_anchors, 2]`.
    pub class_logits: Tensor,
    /// Softmax of the logits in shape `[batch, num_anchors, 2]`.
    pub probs: Tensor,
    /// `(dy, dx, log(dh), log(dw))` deltas in shape `[batch, num_anchors, 4]`.
    pub deltas: Tensor,
}

#[derive(Debug, Clone)]
pub struct RpnHeadInit {
    pub in_c: usize,
    pub anchors_per_location: usize,
    pub anchor_stride: usize,
    pub hidden_c: usize,
}

impl RpnHeadInit {
    pub fn new(in_c: usize, anchors_per_location: usize, anchor_stride: usize) -> Self {
        Self {
            in_c,
            anchors_per_location,
            anchor_stride,
            hidden_c: 512,
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<RpnHead> {
        let path = path.borrow();
        let Self {
            in_c,
            anchors_per_location,
            anchor_stride,
            hidden_c,
        } = self;
        ensure!(
            anchors_per_location > 0,
            "anchors_per_location must be positive"
        );
        ensure!(anchor_stride > 0, "anchor_stride must be positive");

        let shared = ConvBn2DInit {
            s: anchor_stride,
            batch_norm: None,
            ..ConvBn2DInit::new(in_c, hidden_c, 3)
        }
        .build(path / "conv_shared");
        let linear = |name: &str, out_c: usize| {
            ConvBn2DInit {
                relu: false,
                batch_norm: None,
                ..ConvBn2DInit::new(hidden_c, out_c, 1)
            }
            .build(path / name)
        };
        let class_raw = linear("class_raw", 2 * anchors_per_location);
        let bbox_pred = linear("bbox_pred", 4 * anchors_per_location);

        Ok(RpnHead {
            shared,
            class_raw,
            bbox_pred,
        })
    }
}

/// Shared 3x3 convolution with sibling 1x1 classifier and regressor.
///
/// One head serves every pyramid level.
#[derive(Debug)]
pub struct RpnHead {
    shared: ConvBn2D,
    class_raw: ConvBn2D,
    bbox_pred: ConvBn2D,
}

impl RpnHead {
    pub fn forward_t(&self, feature_map: &Tensor, train: bool) -> Result<RpnOutput> {
        let (batch_size, _c, _h, _w) = feature_map.size4()?;
        let shared = self.shared.forward_t(feature_map, train);

        // [b, a * k, h, w] -> [b, h * w * a, k]
        let flatten = |xs: Tensor, k: i64| xs.permute(&[0, 2, 3, 1]).contiguous().view([batch_size, -1, k]);

        let class_logits = flatten(self.class_raw.forward_t(&shared, train), 2);
        let probs = class_logits.softmax(-1, Kind::Float);
        let deltas = flatten(self.bbox_pred.forward_t(&shared, train), 4);

        Ok(RpnOutput {
            class_logits,
            probs,
            deltas,
        })
    }

    /// Run the head on each level and concatenate along the anchor dimension.
    pub fn forward_levels(&self, levels: &[&Tensor], train: bool) -> Result<RpnOutput> {
        ensure!(!levels.is_empty(), "at least one pyramid level is required");
        let outputs: Vec<_> = levels
            .iter()
            .map(|level| self.forward_t(level, train))
            .try_collect()?;

        let cat = |select: fn(&RpnOutput) -> &Tensor| {
            let tensors: Vec<_> = outputs.iter().map(select).collect();
            Tensor::cat(&tensors, 1)
        };

        Ok(RpnOutput {
            class_logits: cat(|output| &output.class_logits),
            probs: cat(|output| &output.probs),
            deltas: cat(|output| &output.deltas),
        })
    }
}

impl WeightDecay for RpnHead {
    fn decayed_params(&self) -> Vec<Tensor> {
        chain!(
            self.shared.decayed_params(),
            self.class_raw.decayed_params(),
            self.bbox_pred.decayed_params()
        )
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rpn_head_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RpnHeadInit {
            hidden_c: 16,
            ..RpnHeadInit::new(8, 3, 1)
        }
        .build(&vs.root() / "rpn")?;

        let p2 = Tensor::randn(&[2, 8, 8, 8], (Kind::Float, Device::Cpu));
        let p3 = Tensor::randn(&[2, 8, 4, 4], (Kind::Float, Device::Cpu));
        let output = head.forward_levels(&[&p2, &p3], true)?;

        let num_anchors = (64 + 16) * 3;
        assert_eq!(output.class_logits.size(), vec![2, num_anchors, 2]);
        assert_eq!(output.probs.size(), vec![2, num_anchors, 2]);
        assert_eq!(output.deltas.size(), vec![2, num_anchors, 4]);

        let prob_sum = output.probs.sum_dim_intlist(&[-1], false, Kind::Float);
        let max_err = f64::from((prob_sum - 1.0).abs().max());
        assert_abs_diff_eq!(max_err, 0.0, epsilon = 1e-5);
        Ok(())
    }
}
