use crate::common::*;

/// Squared error loss.
#[derive(Debug, Clone)]
pub struct L2Loss {
    reduction: Reduction,
}

impl L2Loss {
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

        // mean of nothing is defined as zero
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())));
        }

        let loss = (input - target).square();

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
    fn l2_loss_sum_and_mean() -> Result<()> {
        let input = Tensor::of_slice(&[1.0f32, 2.0, 3.0]);
        let target = Tensor::of_slice(&[1.0f32, 0.0, 0.0]);

        let sum = L2Loss::new(Reduction::Sum).forward(&input, &target)?;
        let mean = L2Loss::new(Reduction::Mean).forward(&input, &target)?;
        assert_abs_diff_eq!(f64::from(&sum), 13.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&mean), 13.0 / 3.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let input = Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[3, 2], (Kind::Float, Device::Cpu));
        assert!(L2Loss::new(Reduction::Sum).forward(&input, &target).is_err());
    }

    #[test]
    fn mean_of_empty_input_is_zero() -> Result<()> {
        let empty = Tensor::zeros(&[4, 0, 3], (Kind::Float, Device::Cpu));
        let loss = L2Loss::new(Reduction::Mean).forward(&empty, &empty)?;
        assert_eq!(f64::from(&loss), 0.0);
        Ok(())
    }
}
