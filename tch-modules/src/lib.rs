//! Neural network layers and loss functions built on top of tch.

mod common;

pub mod batch_norm;
pub mod conv_bn_2d;
pub mod cross_entropy;
pub mod l2_loss;
pub mod smooth_l1_loss;
pub mod sum_2d;
pub mod up_sample_2d;
pub mod weight_decay;

pub use batch_norm::*;
pub use conv_bn_2d::*;
pub use cross_entropy::*;
pub use l2_loss::*;
pub use smooth_l1_loss::*;
pub use sum_2d::*;
pub use up_sample_2d::*;
pub use weight_decay::*;
