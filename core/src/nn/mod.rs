//! Model building blocks.
//!
//! Layers here are stateless views over gathered parameter values: the distributed
//! [`Parameter`]s live in the model, and each step materialises the full tensors, runs these
//! layers forward and backward, and discards them again.

pub mod activation;
pub mod builder;
pub mod dense;
pub mod embedding;
pub mod module;
pub mod parameter;

pub use activation::Activation;
pub use builder::{Initializer, ParameterBuilder};
pub use dense::Dense;
pub use embedding::Embedding;
pub use module::Module;
pub use parameter::{Parameter, ParameterTensor};
