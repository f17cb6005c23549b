//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, TLBR};
pub use chrono::{DateTime, Local};
pub use futures::{
    future::{self, FutureExt},
    stream::{self, StreamExt},
};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use log::{info, warn};
pub use mimic_rcnn::{
    ImageMeta, MimicConfig, MimicLosses, MimicModel, MimicModelInit, Mode, PyramidAnchors,
    RpnTargetBuilder, TeacherNetwork, TrainingInput,
};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::{Borrow, Cow},
    collections::HashMap,
    fmt::Debug,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    vision, Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};

pub type Fallible<T> = Result<T, Error>;
