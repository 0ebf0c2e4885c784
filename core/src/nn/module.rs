use super::parameter::ParameterTensor;

/// Anything that owns trainable parameters.
///
/// Parameters are returned in a fixed order, identical on every client. Optimizer state and
/// the gradient vector of a step are indexed by this order.
pub trait Module: Send + Sync {
    fn trainable_parameters(&self) -> Vec<&dyn ParameterTensor>;

    fn trainable_parameters_mut(&mut self) -> Vec<&mut dyn ParameterTensor>;

    /// Total number of elements across all parameters.
    fn num_parameters(&self) -> usize {
        self.trainable_parameters()
            .iter()
            .map(|p| p.num_elements())
            .sum()
    }
}
