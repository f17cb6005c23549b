//! Top-down feature pyramid over ResNet stages.

use crate::{backbone::ResNetOutput, common::*};

/// Fused pyramid levels, all of the same depth.
#[derive(Debug, TensorLike)]
pub struct PyramidOutput {
    pub p2: Tensor,
    pub p3: Tensor,
    pub p4: Tensor,
    pub p5: Tensor,
    /// Extra coarsest level, only used for anchor scoring.
    pub p6: Option<Tensor>,
}

impl PyramidOutput {
    /// Levels P2 to P5.
    pub fn mimic_levels(&self) -> [&Tensor; 4] {
        [&self.p2, &self.p3, &self.p4, &self.p5]
    }

    /// Levels P2 to P6 when P6 is present.
    pub fn rpn_levels(&self) -> Vec<&Tensor> {
        chain!(self.mimic_levels(), self.p6.as_ref()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FpnInit {
    /// Channel counts of C2 to C5.
    pub in_channels: [usize; 4],
    pub depth: usize,
    pub with_p6: bool,
}

impl FpnInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<Fpn> {
        let path = path.borrow();
        let Self {
            in_channels,
            depth,
            with_p6,
        } = self;
        ensure!(depth > 0, "pyramid depth must be positive");

        let conv = |name: String, in_c: usize, k: usize| {
            ConvBn2DInit {
                relu: false,
                batch_norm: None,
                ..ConvBn2DInit::new(in_c, depth, k)
            }
            .build(path / name)
        };

        let laterals: Vec<_> = in_channels
            .iter()
            .zip(2..)
            .map(|(&in_c, level)| conv(format!("lateral{}", level), in_c, 1))
            .collect();
        let smooths: Vec<_> = (2..=5)
            .map(|level| conv(format!("smooth{}", level), depth, 3))
            .collect();

        Ok(Fpn {
            laterals,
            smooths,
            up_sample: UpSample2D::new(2)?,
            sum: Sum2D::new(),
            depth: depth as i64,
            with_p6,
        })
    }
}

#[derive(Debug)]
pub struct Fpn {
    laterals: Vec<ConvBn2D>,
    smooths: Vec<ConvBn2D>,
    up_sample: UpSample2D,
    sum: Sum2D,
    depth: i64,
    with_p6: bool,
}

impl Fpn {
    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn forward_t(&self, input: &ResNetOutput, train: bool) -> Result<PyramidOutput> {
        let ResNetOutput { c2, c3, c4, c5, .. } = input;
        let lateral = |index: usize, xs: &Tensor| self.laterals[index].forward_t(xs, train);

        let m5 = lateral(3, c5);
        let m4 = self.sum.forward([self.up_sample.forward(&m5)?, lateral(2, c4)])?;
        let m3 = self.sum.forward([self.up_sample.forward(&m4)?, lateral(1, c3)])?;
        let m2 = self.sum.forward([self.up_sample.forward(&m3)?, lateral(0, c2)])?;

        let smooth = |index: usize, xs: &Tensor| self.smooths[index].forward_t(xs, train);
        let p2 = smooth(0, &m2);
        let p3 = smooth(1, &m3);
        let p4 = smooth(2, &m4);
        let p5 = smooth(3, &m5);
        let p6 = self
            .with_p6
            .then(|| p5.max_pool2d(&[1, 1], &[2, 2], &[0, 0], &[1, 1], false));

        Ok(PyramidOutput {
            p2,
            p3,
            p4,
            p5,
            p6,
        })
    }
}

impl WeightDecay for Fpn {
    fn decayed_params(&self) -> Vec<Tensor> {
        chain!(self.laterals.decayed_params(), self.smooths.decayed_params()).collect()
    }
}
