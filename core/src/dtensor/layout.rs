//! Per-tensor sharding specifications.

use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

/// Sharding spec meaning "this axis is not split".
pub const UNSHARDED: &str = "unsharded";

/// How one tensor axis is distributed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sharding {
    /// Every device along every mesh dimension holds the full extent of the axis.
    Unsharded,
    /// The axis is split into `dim_size` contiguous blocks along the named mesh dimension.
    Dim(String),
}

impl Sharding {
    pub fn as_str(&self) -> &str {
        match self {
            Sharding::Unsharded => UNSHARDED,
            Sharding::Dim(name) => name,
        }
    }
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sharding spec per tensor axis, bound to a mesh.
///
/// A mesh dimension appears at most once. Mesh dimensions that no axis names replicate the
/// tensor: every device along them holds the same component.
#[derive(Clone)]
pub struct Layout {
    specs: Vec<Sharding>,
    mesh: Mesh,
}

impl Layout {
    /// Builds a layout from spec strings, each either [`UNSHARDED`] or a mesh dimension name.
    pub fn new<S: AsRef<str>>(specs: &[S], mesh: &Mesh) -> Result<Self> {
        let mut seen = HashSet::new();
        let specs = specs
            .iter()
            .map(|spec| {
                let spec = spec.as_ref();
                if spec == UNSHARDED {
                    return Ok(Sharding::Unsharded);
                }
                if !mesh.contains_dim(spec) {
                    return Err(MeshError::Layout(format!(
                        "`{spec}` is neither `{UNSHARDED}` nor a dimension of mesh {mesh}"
                    )));
                }
                if !seen.insert(spec.to_string()) {
                    return Err(MeshError::Layout(format!(
                        "mesh dimension `{spec}` shards more than one axis"
                    )));
                }
                Ok(Sharding::Dim(spec.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            specs,
            mesh: mesh.clone(),
        })
    }

    /// Fully replicated layout of the given rank.
    pub fn replicated(mesh: &Mesh, rank: usize) -> Self {
        Self {
            specs: vec![Sharding::Unsharded; rank],
            mesh: mesh.clone(),
        }
    }

    /// Axis 0 sharded over `dim`, every other axis unsharded.
    pub fn batch_sharded(mesh: &Mesh, dim: &str, rank: usize) -> Result<Self> {
        let mut specs = vec![UNSHARDED; rank];
        match specs.first_mut() {
            Some(first) => *first = dim,
            None => {
                return Err(MeshError::Layout(
                    "a batch-sharded layout needs rank >= 1".into(),
                ));
            }
        }
        Self::new(&specs, mesh)
    }

    pub fn rank(&self) -> usize {
        self.specs.len()
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn specs(&self) -> &[Sharding] {
        &self.specs
    }

    /// Spec strings, e.g. `["unsharded", "model"]`.
    pub fn sharding_specs(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.as_str().to_string()).collect()
    }

    pub fn is_fully_replicated(&self) -> bool {
        self.specs.iter().all(|s| *s == Sharding::Unsharded)
    }

    /// Number of blocks axis `axis` is split into.
    pub fn num_shards(&self, axis: usize) -> usize {
        match self.specs.get(axis) {
            Some(Sharding::Dim(name)) => self.mesh.dim_size(name).unwrap_or(1),
            _ => 1,
        }
    }

    fn check_rank(&self, global_shape: &[usize]) -> Result<()> {
        if global_shape.len() != self.rank() {
            return Err(MeshError::Layout(format!(
                "layout {self} has rank {} but the tensor has shape {global_shape:?}",
                self.rank()
            )));
        }
        Ok(())
    }

    /// Shape of every device's component for a tensor of `global_shape`.
    pub fn local_shape(&self, global_shape: &[usize]) -> Result<Vec<usize>> {
        self.check_rank(global_shape)?;
        global_shape
            .iter()
            .enumerate()
            .map(|(axis, &extent)| {
                let shards = self.num_shards(axis);
                if extent % shards != 0 {
                    return Err(MeshError::Layout(format!(
                        "axis {axis} of size {extent} cannot be split into {shards} shards by {self}"
                    )));
                }
                Ok(extent / shards)
            })
            .collect()
    }

    /// The block of the global tensor held by global device `device`.
    pub fn device_block(&self, device: usize, global_shape: &[usize]) -> Result<Vec<Range<usize>>> {
        let local = self.local_shape(global_shape)?;
        self.specs
            .iter()
            .zip(local)
            .map(|(spec, extent)| match spec {
                Sharding::Unsharded => Ok(0..extent),
                Sharding::Dim(name) => {
                    let index = self.mesh.coordinate(device, name)?;
                    Ok(index * extent..(index + 1) * extent)
                }
            })
            .collect()
    }
}

impl PartialEq for Layout {
    fn eq(&self, other: &Self) -> bool {
        self.specs == other.specs && self.mesh.description() == other.mesh.description()
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Layout(sharding_specs=[{}], mesh={})",
            self.sharding_specs().join(", "),
            self.mesh
        )
    }
}
