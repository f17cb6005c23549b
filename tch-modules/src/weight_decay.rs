use crate::common::*;

/// Modules that expose the parameters subject to weight decay.
///
/// Each module decides at construction which of its parameters decay, so
/// normalization scale and shift are excluded by type rather than by name.
pub trait WeightDecay {
    fn decayed_params(&self) -> Vec<Tensor>;
}

impl WeightDecay for nn::Conv2D {
    fn decayed_params(&self) -> Vec<Tensor> {
        let nn::Conv2D { ws, bs, .. } = self;
        let mut params = vec![ws.shallow_clone()];
        params.extend(bs.as_ref().map(Tensor::shallow_clone));
        params
    }
}

impl<T> WeightDecay for [T]
where
    T: WeightDecay,
{
    fn decayed_params(&self) -> Vec<Tensor> {
        self.iter().flat_map(|module| module.decayed_params()).collect()
    }
}

impl<T> WeightDecay for Vec<T>
where
    T: WeightDecay,
{
    fn decayed_params(&self) -> Vec<Tensor> {
        self.as_slice().decayed_params()
    }
}

/// L2 regularization term `Σ weight_decay · Σ(w²) / numel(w)`.
///
/// Returns a zero scalar when no parameter is given.
pub fn l2_regularization(params: &[Tensor], weight_decay: f64, device: Device) -> Tensor {
    params
        .iter()
        .filter(|param| !param.is_empty())
        .map(|param| param.square().sum(Kind::Float) * weight_decay / param.numel() as f64)
        .fold(Tensor::zeros(&[], (Kind::Float, device)), |acc, term| {
            acc + term
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn l2_regularization_is_scaled_mean_square() {
        let params = vec![
            Tensor::of_slice(&[1.0f32, 1.0, 1.0, 1.0]),
            Tensor::of_slice(&[2.0f32, 0.0]),
        ];
        let reg = l2_regularization(&params, 0.1, Device::Cpu);
        // 0.1 * (4 / 4) + 0.1 * (4 / 2)
        assert_abs_diff_eq!(f64::from(&reg), 0.3, epsilon = 1e-6);
    }

    #[test]
    fn empty_regularization_is_zero() {
        let reg = l2_regularization(&[], 0.1, Device::Cpu);
        assert_eq!(f64::from(&reg), 0.0);
    }
}
