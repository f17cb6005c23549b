//! Safe bounding box types and functions.
//!
//! Boxes use the `(y1, x1, y2, x2)` convention, written here as TLBR
//! (top, left, bottom, right).

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use cycxhw::*;
pub mod cycxhw;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
