//! Parameter construction under an active layout map.
//!
//! A model builds its parameters through a [`ParameterBuilder`]. Every parameter gets a
//! hierarchical name (`encoder/layer_0/intermediate/kernel`), its layout is resolved from the
//! [`LayoutMap`] at creation time, and its initial value is drawn from a seeded generator.
//! All clients use the same seed and build parameters in the same order, so every client
//! draws the same global values and keeps only its own blocks.

use super::parameter::Parameter;
use crate::dtensor::{DTensor, LayoutMap};
use crate::error::{MeshError, Result};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashSet;

/// How a parameter's initial value is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    Constant(f32),
    /// Normal with mean zero, resampling anything beyond two standard deviations.
    TruncatedNormal { stddev: f32 },
}

impl Initializer {
    fn fill(&self, len: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
        match *self {
            Self::Zeros => Ok(vec![0.0; len]),
            Self::Constant(value) => Ok(vec![value; len]),
            Self::TruncatedNormal { stddev } => {
                let normal = Normal::new(0.0f32, stddev).map_err(|e| {
                    MeshError::Layout(format!("invalid initializer stddev {stddev}: {e}"))
                })?;
                let bound = 2.0 * stddev;
                Ok((0..len)
                    .map(|_| loop {
                        let v = normal.sample(rng);
                        if v.abs() <= bound {
                            break v;
                        }
                    })
                    .collect())
            }
        }
    }
}

pub struct ParameterBuilder<'a> {
    layout_map: &'a LayoutMap,
    scope: Vec<String>,
    rng: StdRng,
    names: HashSet<String>,
}

impl<'a> ParameterBuilder<'a> {
    pub fn new(layout_map: &'a LayoutMap, seed: u64) -> Self {
        Self {
            layout_map,
            scope: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            names: HashSet::new(),
        }
    }

    pub fn layout_map(&self) -> &LayoutMap {
        self.layout_map
    }

    /// Runs `f` with `name` pushed onto the naming scope.
    pub fn scope<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.scope.push(name.to_string());
        let out = f(self);
        self.scope.pop();
        out
    }

    pub fn qualified_name(&self, leaf: &str) -> String {
        let mut parts = self.scope.clone();
        parts.push(leaf.to_string());
        parts.join("/")
    }

    /// Creates the parameter `leaf` in the current scope.
    pub fn parameter<const RANK: usize>(
        &mut self,
        leaf: &str,
        shape: [usize; RANK],
        init: Initializer,
    ) -> Result<Parameter<RANK>> {
        let name = self.qualified_name(leaf);
        if !self.names.insert(name.clone()) {
            return Err(MeshError::Layout(format!("parameter `{name}` created twice")));
        }
        let layout = self.layout_map.resolve(&name, RANK)?;
        let data = init.fill(shape.iter().product(), &mut self.rng)?;
        let global = Tensor::new(data, shape)?;
        let value = DTensor::from_global(&global, layout)?;
        tracing::debug!(parameter = %name, layout = ?value.layout().sharding_specs(), "created parameter");
        Ok(Parameter::new(name, value))
    }
}
