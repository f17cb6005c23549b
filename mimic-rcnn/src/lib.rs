//! Feature mimicking for two-stage detectors.
//!
//! A frozen teacher ResNet+FPN supplies pyramid activations that a smaller
//! trainable student learns to reproduce at region-proposal locations,
//! while the student's region proposal network is trained on its usual
//! objectives.

mod common;
pub mod anchors;
pub mod backbone;
pub mod batch;
pub mod config;
pub mod fpn;
pub mod image_meta;
pub mod mimic;
pub mod model;
pub mod proposal;
pub mod rpn;
pub mod target;

pub use anchors::*;
pub use backbone::*;
pub use batch::*;
pub use config::*;
pub use fpn::*;
pub use image_meta::*;
pub use mimic::*;
pub use model::*;
pub use proposal::*;
pub use rpn::*;
pub use target::*;
