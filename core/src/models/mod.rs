//! Models trained by the distributed loop.
//!
//! - [`traits::Model`]: the boundary the training loop drives.
//! - [`bert::BertClassifier`]: an encoder-style sentence classifier whose parameters are laid
//!   out by a [`LayoutMap`](crate::dtensor::LayoutMap).

pub mod bert;
pub mod traits;

pub use bert::{BertClassifier, BertConfig, default_layout_map};
pub use traits::{Model, ModelInputs};
