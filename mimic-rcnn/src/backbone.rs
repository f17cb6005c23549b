//! ResNet-50/101 feature extractor.

use crate::{common::*, config::Architecture};

/// Feature maps of the five ResNet stages.
///
/// Strides relative to the input are 4, 4, 8, 16 and 32.
#[derive(Debug, TensorLike)]
pub struct ResNetOutput {
    pub c1: Tensor,
    pub c2: Tensor,
    pub c3: Tensor,
    pub c4: Tensor,
    pub c5: Tensor,
}

#[derive(Debug, Clone)]
pub struct ResNetInit {
    pub architecture: Architecture,
    pub in_c: usize,
    /// Divides all filter counts.
    pub width_divisor: usize,
}

impl ResNetInit {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            in_c: 3,
            width_divisor: 1,
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<ResNet> {
        let path = path.borrow();
        let Self {
            architecture,
            in_c,
            width_divisor,
        } = self;
        ensure!(
            width_divisor > 0 && 64 % width_divisor == 0,
            "width_divisor must divide 64, but get {}",
            width_divisor
        );

        let filters = |base: [usize; 3]| base.map(|filter| filter / width_divisor);

        let stem = ConvBn2DInit {
            s: 2,
            p: 0,
            ..ConvBn2DInit::new(in_c, 64 / width_divisor, 7)
        }
        .build(path / "conv1");

        let stage = |index: usize, in_c: usize, base: [usize; 3], stride: usize, count: usize| {
            let path = path / format!("res{}", index);
            let filters = filters(base);
            let first = BottleneckInit {
                in_c,
                filters,
                stride,
                downsample: true,
            }
            .build(&path / "a");
            let rest = (0..count).map(|block| {
                BottleneckInit {
                    in_c: filters[2],
                    filters,
                    stride: 1,
                    downsample: false,
                }
                .build(&path / block_name(block + 1))
            });
            let blocks: Vec<_> = iter::once(first).chain(rest).collect();
            (filters[2], blocks)
        };

        let (c2_c, stage2) = stage(2, 64 / width_divisor, [64, 64, 256], 1, 2);
        let (c3_c, stage3) = stage(3, c2_c, [128, 128, 512], 2, 3);
        let (c4_c, stage4) = stage(
            4,
            c3_c,
            [256, 256, 1024],
            2,
            architecture.stage4_identity_blocks(),
        );
        let (c5_c, stage5) = stage(5, c4_c, [512, 512, 2048], 2, 2);

        Ok(ResNet {
            in_c,
            stem,
            stages: [stage2, stage3, stage4, stage5],
            out_channels: [64 / width_divisor, c2_c, c3_c, c4_c, c5_c],
        })
    }
}

/// Block names follow the `a`, `b`, `c`, ... convention.
fn block_name(index: usize) -> String {
    ((b'a' + index as u8) as char).to_string()
}

#[derive(Debug)]
pub struct ResNet {
    in_c: usize,
    stem: ConvBn2D,
    stages: [Vec<Bottleneck>; 4],
    out_channels: [usize; 5],
}

impl ResNet {
    /// Channel counts of `c1` to `c5`.
    pub fn out_channels(&self) -> [usize; 5] {
        self.out_channels
    }

    pub fn in_channels(&self) -> usize {
        self.in_c
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<ResNetOutput> {
        let (_b, channels, height, width) = input.size4()?;
        ensure!(
            channels == self.in_c as i64,
            "expect {} input channels, but get {}",
            self.in_c,
            channels
        );
        ensure!(
            height % 64 == 0 && width % 64 == 0,
            "input size {}x{} is not divisible by 64",
            height,
            width
        );

        let c1 = self
            .stem
            .forward_t(&input.constant_pad_nd(&[3, 3, 3, 3]), train)
            .max_pool2d(&[3, 3], &[2, 2], &[1, 1], &[1, 1], false);

        let run_stage = |input: &Tensor, blocks: &[Bottleneck]| {
            blocks
                .iter()
                .fold(input.shallow_clone(), |xs, block| block.forward_t(&xs, train))
        };

        let [stage2, stage3, stage4, stage5] = &self.stages;
        let c2 = run_stage(&c1, stage2);
        let c3 = run_stage(&c2, stage3);
        let c4 = run_stage(&c3, stage4);
        let c5 = run_stage(&c4, stage5);

        Ok(ResNetOutput { c1, c2, c3, c4, c5 })
    }
}

impl WeightDecay for ResNet {
    fn decayed_params(&self) -> Vec<Tensor> {
        let mut params = self.stem.decayed_params();
        self.stages
            .iter()
            .for_each(|blocks| params.extend(blocks.decayed_params()));
        params
    }
}

#[derive(Debug, Clone)]
struct BottleneckInit {
    in_c: usize,
    filters: [usize; 3],
    stride: usize,
    /// Adds a strided 1x1 convolution on the skip path.
    downsample: bool,
}

impl BottleneckInit {
    fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Bottleneck {
        let path = path.borrow();
        let Self {
            in_c,
            filters: [f1, f2, f3],
            stride,
            downsample,
        } = self;

        let reduce = ConvBn2DInit {
            s: stride,
            ..ConvBn2DInit::new(in_c, f1, 1)
        }
        .build(path / "branch2a");
        let spatial = ConvBn2DInit::new(f1, f2, 3).build(path / "branch2b");
        let expand = ConvBn2DInit {
            relu: false,
            ..ConvBn2DInit::new(f2, f3, 1)
        }
        .build(path / "branch2c");
        let shortcut = downsample.then(|| {
            ConvBn2DInit {
                s: stride,
                relu: false,
                ..ConvBn2DInit::new(in_c, f3, 1)
            }
            .build(path / "branch1")
        });

        Bottleneck {
            reduce,
            spatial,
            expand,
            shortcut,
        }
    }
}

/// Three-convolution residual block with an additive skip path.
#[derive(Debug)]
struct Bottleneck {
    reduce: ConvBn2D,
    spatial: ConvBn2D,
    expand: ConvBn2D,
    shortcut: Option<ConvBn2D>,
}

impl Bottleneck {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let main = self
            .expand
            .forward_t(
                &self
                    .spatial
                    .forward_t(&self.reduce.forward_t(input, train), train),
                train,
            );
        let skip = match &self.shortcut {
            Some(shortcut) => shortcut.forward_t(input, train),
            None => input.shallow_clone(),
        };
        (main + skip).relu()
    }
}

impl WeightDecay for Bottleneck {
    fn decayed_params(&self) -> Vec<Tensor> {
        let Self {
            reduce,
            spatial,
            expand,
            shortcut,
        } = self;
        chain!(
            reduce.decayed_params(),
            spatial.decayed_params(),
            expand.decayed_params(),
            shortcut.iter().flat_map(|conv| conv.decayed_params())
        )
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resnet_output_strides() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let resnet = ResNetInit {
            width_divisor: 16,
            ..ResNetInit::new(Architecture::ResNet50)
        }
        .build(&vs.root() / "resnet")?;

        let input = Tensor::randn(&[1, 3, 128, 192], (Kind::Float, Device::Cpu));
        let ResNetOutput { c1, c2, c3, c4, c5 } = resnet.forward_t(&input, false)?;

        assert_eq!(c1.size(), vec![1, 4, 32, 48]);
        assert_eq!(c2.size(), vec![1, 16, 32, 48]);
        assert_eq!(c3.size(), vec![1, 32, 16, 24]);
        assert_eq!(c4.size(), vec![1, 64, 8, 12]);
        assert_eq!(c5.size(), vec![1, 128, 4, 6]);
        Ok(())
    }

    #[test]
    fn resnet101_has_deeper_stage4() -> Result<()> {
        let count = |architecture| -> Result<usize> {
            let vs = nn::VarStore::new(Device::Cpu);
            ResNetInit {
                width_divisor: 64,
                ..ResNetInit::new(architecture)
            }
            .build(&vs.root())?;
            Ok(vs.trainable_variables().len())
        };
        // each identity block owns 3 conv and 3 batch norm layers with 2 tensors each
        assert_eq!(
            count(Architecture::ResNet101)? - count(Architecture::ResNet50)?,
            17 * 12
        );
        Ok(())
    }

    #[test]
    fn non_divisible_input_is_rejected() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let resnet = ResNetInit {
            width_divisor: 64,
            ..ResNetInit::new(Architecture::ResNet50)
        }
        .build(&vs.root())?;
        let input = Tensor::zeros(&[1, 3, 250, 250], (Kind::Float, Device::Cpu));
        assert!(resnet.forward_t(&input, false).is_err());
        Ok(())
    }

    #[test]
    fn batch_norm_params_are_not_decayed() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let resnet = ResNetInit {
            width_divisor: 64,
            ..ResNetInit::new(Architecture::ResNet50)
        }
        .build(&vs.root())?;
        // every conv has a weight and a bias, every batch norm a scale and a shift
        assert_eq!(
            resnet.decayed_params().len() * 2,
            vs.trainable_variables().len()
        );
        Ok(())
    }
}
