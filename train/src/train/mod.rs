//! Training workers.

mod single_device;
mod validation;

pub use single_device::*;
pub use validation::*;
