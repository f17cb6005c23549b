use crate::{
    batch_norm::{BatchNorm2D, BatchNormInit},
    common::*,
    weight_decay::WeightDecay,
};

#[derive(Debug, Clone)]
pub struct ConvBn2DInit {
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub s: usize,
    pub p: usize,
    pub bias: bool,
    pub relu: bool,
    pub batch_norm: Option<BatchNormInit>,
}

impl ConvBn2DInit {
    pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
            p: k / 2,
            bias: true,
            relu: true,
            batch_norm: Some(Default::default()),
        }
    }

    pub fn build<'p, P>(self, path: P) -> ConvBn2D
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            in_c,
            out_c,
            k,
            s,
            p,
            bias,
            relu,
            batch_norm,
        } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c as i64,
            k as i64,
            nn::ConvConfig {
                stride: s as i64,
                padding: p as i64,
                bias,
                ..Default::default()
            },
        );
        let bn = batch_norm.map(|init| init.build(path / "bn", out_c as i64));

        ConvBn2D { conv, bn, relu }
    }
}

/// Convolution followed by optional batch normalization and ReLU.
#[derive(Debug)]
pub struct ConvBn2D {
    conv: nn::Conv2D,
    bn: Option<BatchNorm2D>,
    relu: bool,
}

impl nn::ModuleT for ConvBn2D {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref conv,
            ref bn,
            relu,
        } = *self;

        let xs = xs.apply(conv);
        let xs = match bn {
            Some(bn) => bn.forward_t(&xs, train),
            None => xs,
        };

        if relu {
            xs.relu()
        } else {
            xs
        }
    }
}

impl WeightDecay for ConvBn2D {
    fn decayed_params(&self) -> Vec<Tensor> {
        let Self { conv, bn, .. } = self;
        let mut params = conv.decayed_params();
        if let Some(bn) = bn {
            params.extend(bn.decayed_params());
        }
        params
    }
}
