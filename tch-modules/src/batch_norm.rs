use crate::{common::*, weight_decay::WeightDecay};

#[cfg(debug_assertions)]
static SMALL_SCALING_WARN: Once = Once::new();

#[derive(Debug, Clone)]
pub struct BatchNormInit {
    pub cudnn_enabled: bool,
    pub eps: f64,
    pub momentum: f64,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Default for BatchNormInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: 1e-3,
            momentum: 0.01,
            ws_init: nn::Init::Const(1.0),
            bs_init: nn::Init::Const(0.0),
        }
    }
}

impl BatchNormInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> BatchNorm2D {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            ws_init,
            bs_init,
        } = self;

        BatchNorm2D {
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            ws: path.var("weight", &[out_dim], ws_init),
            bs: path.var("bias", &[out_dim], bs_init),
            cudnn_enabled,
            eps,
            momentum,
        }
    }
}

/// Batch normalization over `[batch, channels, height, width]` inputs.
///
/// The scale and shift are never subject to weight decay.
#[derive(Debug)]
pub struct BatchNorm2D {
    running_mean: Tensor,
    running_var: Tensor,
    ws: Tensor,
    bs: Tensor,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl nn::ModuleT for BatchNorm2D {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            momentum,
            eps,
            cudnn_enabled,
        } = *self;

        let output = Tensor::batch_norm(
            input,
            Some(ws),
            Some(bs),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        );

        #[cfg(debug_assertions)]
        {
            if bool::from(running_var.abs().le(1e-15).any()) {
                SMALL_SCALING_WARN.call_once(|| {
                    warn!(
                        "runing variance {} is too small",
                        f64::from(running_var.abs().min())
                    );
                });
            }
        }

        output
    }
}

impl WeightDecay for BatchNorm2D {
    fn decayed_params(&self) -> Vec<Tensor> {
        vec![]
    }
}
