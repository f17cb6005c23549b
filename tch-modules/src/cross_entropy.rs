use crate::common::*;

/// Softmax cross entropy over `[samples, classes]` logits with sparse
/// `[samples]` int64 labels.
///
/// Mean reduction over zero samples gives zero instead of NaN, which happens
/// whenever an image has no anchors selected for training.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (num_samples, num_classes) = input.size2()?;
        let target_len = target.size1()?;
        ensure!(
            target.kind() == Kind::Int64 && target_len == num_samples,
            "expect target a [{}] int64 tensor, but get shape {:?} of kind {:?}",
            num_samples,
            target.size(),
            target.kind()
        );
        debug_assert!(
            target.is_empty()
                || (bool::from(target.ge(0).all())
                    && bool::from(target.lt(num_classes).all())),
            "target values must be in range of [0, {})",
            num_classes
        );

        if input.is_empty() {
            let zero = Tensor::zeros(&[], (Kind::Float, input.device()));
            return Ok(match self.reduction {
                Reduction::None => Tensor::zeros(&[0], (Kind::Float, input.device())),
                _ => zero,
            });
        }

        let loss = input
            .log_softmax(1, Kind::Float)
            .gather(1, &target.unsqueeze(1), false)
            .squeeze_dim(1)
            .neg();

        let loss = match self.reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => bail!("unsupported reduction"),
        };
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;

    #[test]
    fn cross_entropy_converges() -> Result<()> {
        let mut rng = rand::thread_rng();
        let device = Device::Cpu;

        let n_samples = 32;
        let n_class = rng.gen_range(2..10);

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let loss_fn = CrossEntropyLoss::new(Reduction::Mean);

        let input = root.randn("input", &[n_samples, n_class], 0.0, 1.0);
        let target =
            Tensor::randint(n_class, &[n_samples], (Kind::Int64, device)).set_requires_grad(false);

        let mut optimizer = nn::Adam::default().build(&vs, 0.1)?;

        for _ in 0..500 {
            let loss = loss_fn.forward(&input, &target)?;
            optimizer.backward_step(&loss);
        }

        let accuracy = i64::from(
            input
                .argmax(Some(1), false)
                .eq_tensor(&target)
                .count_nonzero(0),
        ) as f64
            / n_samples as f64;
        ensure!(accuracy >= 0.99, "the loss does not coverage");

        Ok(())
    }

    #[test]
    fn uniform_logits_give_log_num_classes() -> Result<()> {
        let input = Tensor::zeros(&[4, 2], (Kind::Float, Device::Cpu));
        let target = Tensor::of_slice(&[0i64, 1, 1, 0]);
        let loss = CrossEntropyLoss::new(Reduction::Mean).forward(&input, &target)?;
        assert_abs_diff_eq!(f64::from(&loss), 2f64.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn empty_input_gives_zero() -> Result<()> {
        let input = Tensor::zeros(&[0, 3], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        let loss = CrossEntropyLoss::new(Reduction::Mean).forward(&input, &target)?;
        assert_eq!(f64::from(&loss), 0.0);
        Ok(())
    }
}
