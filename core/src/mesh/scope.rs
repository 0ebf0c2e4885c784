//! The ambient execution scope.
//!
//! Code that cannot take a mesh argument (a model's lazily-built state, a loss evaluated inside
//! a step) asks for [`current_mesh`]. The scope is per thread, i.e. per client, and is only
//! ever installed for the duration of a closure.

use super::Mesh;
use crate::error::{MeshError, Result};
use std::cell::RefCell;

thread_local! {
    static MESH_STACK: RefCell<Vec<Mesh>> = const { RefCell::new(Vec::new()) };
}

/// Pops the scope on drop, including during unwinding.
struct ScopeGuard;

impl ScopeGuard {
    fn enter(mesh: Mesh) -> Self {
        MESH_STACK.with(|stack| stack.borrow_mut().push(mesh));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        MESH_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Runs `f` with `mesh` as the current mesh. Scopes nest.
pub fn run_on<R>(mesh: &Mesh, f: impl FnOnce() -> R) -> R {
    let _guard = ScopeGuard::enter(mesh.clone());
    f()
}

/// The innermost mesh installed by [`run_on`] on this thread.
pub fn current_mesh() -> Result<Mesh> {
    MESH_STACK
        .with(|stack| stack.borrow().last().cloned())
        .ok_or(MeshError::NoMeshInScope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DeviceType, MeshDescription, MeshDim};

    fn mesh(size: usize) -> Mesh {
        let description =
            MeshDescription::new(vec![MeshDim::new("x", size)], DeviceType::Cpu, size);
        Mesh::new(description, 0, 1).unwrap()
    }

    #[test]
    fn test_no_scope() {
        assert!(matches!(current_mesh(), Err(MeshError::NoMeshInScope)));
    }

    #[test]
    fn test_nested_scopes() {
        let outer = mesh(2);
        let inner = mesh(4);
        run_on(&outer, || {
            assert_eq!(current_mesh().unwrap().num_devices(), 2);
            run_on(&inner, || {
                assert_eq!(current_mesh().unwrap().num_devices(), 4);
            });
            assert_eq!(current_mesh().unwrap().num_devices(), 2);
        });
        assert!(current_mesh().is_err());
    }

    #[test]
    fn test_scope_released_on_panic() {
        let m = mesh(2);
        let result = std::panic::catch_unwind(|| run_on(&m, || panic!("step failed")));
        assert!(result.is_err());
        assert!(current_mesh().is_err());
    }
}
