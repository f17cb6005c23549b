pub use anyhow::{ensure, format_err, Error, Result};
pub use getset::Getters;
pub use itertools::{izip, Itertools};
pub use std::borrow::Borrow;
pub use tch::{Device, IndexOp, Kind, Tensor};
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = Result<T, Error>;
