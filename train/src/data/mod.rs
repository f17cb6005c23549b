//! Dataset loading and batch assembly.

mod batch;
mod csv_dataset;
mod preprocess;

pub use batch::*;
pub use csv_dataset::*;
pub use preprocess::*;
