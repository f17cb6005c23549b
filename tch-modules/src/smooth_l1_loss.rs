use crate::common::*;

/// Smooth L1 loss, quadratic below one and linear above.
///
/// `0.5 · d²` for `|d| < 1`, otherwise `|d| - 0.5`.
#[derive(Debug)]
pub struct SmoothL1Loss {
    reduction: Reduction,
}

impl SmoothL1Loss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input shape {:?} does not match target shape {:?}",
            input.size(),
            target.size()
        );

        if input.is_empty() && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())));
        }

        let diff = (input - target).abs();
        let less_than_one = diff.lt(1.0).to_kind(Kind::Float);
        let loss: Tensor = &less_than_one * 0.5 * diff.square() + (1.0 - &less_than_one) * (&diff - 0.5);

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

    #[test]
    fn smooth_l1_switches_at_one() -> Result<()> {
        let input = Tensor::of_slice(&[0.5f32, 3.0, -2.0]);
        let target = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));
        let loss = SmoothL1Loss::new(Reduction::None).forward(&input, &target)?;
        let values = Vec::<f32>::from(&loss);
        assert_abs_diff_eq!(values[0], 0.125, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(values[2], 1.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn empty_mean_is_zero() -> Result<()> {
        let input = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let loss = SmoothL1Loss::new(Reduction::Mean).forward(&input, &input)?;
        assert_eq!(f64::from(&loss), 0.0);
        Ok(())
    }
}
