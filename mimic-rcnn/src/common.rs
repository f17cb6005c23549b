pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, BoxDelta, CyCxHW, TLBR};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use itertools::{chain, izip, Itertools as _};
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::Debug,
    iter,
    path::{Path, PathBuf},
};
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_goodies::{nms, CyCxHWTensor, TensorExt as _, TlbrTensor};
pub use tch_modules::{
    BatchNorm2D, BatchNormInit, ConvBn2D, ConvBn2DInit, CrossEntropyLoss, L2Loss, SmoothL1Loss,
    Sum2D, UpSample2D, WeightDecay,
};
pub use tch_tensor_like::TensorLike;
