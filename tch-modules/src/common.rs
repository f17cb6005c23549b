pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use itertools::{izip, Itertools};
pub use log::warn;
pub use std::{borrow::Borrow, sync::Once};
pub use tch::{
    nn::{self, Module as _, ModuleT as _, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_goodies::TensorExt;
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = Result<T, Error>;
