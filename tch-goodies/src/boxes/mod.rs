//! Batched bounding box tensors in normalized `(y1, x1, y2, x2)` coordinates.

mod cycxhw;
mod tlbr;

pub use cycxhw::*;
pub use tlbr::*;
