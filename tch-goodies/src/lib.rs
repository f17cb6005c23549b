//! Tensor helpers shared by the detection crates.

mod common;
pub mod boxes;
pub mod nms;
pub mod tensor;

pub use boxes::*;
pub use nms::*;
pub use tensor::*;
