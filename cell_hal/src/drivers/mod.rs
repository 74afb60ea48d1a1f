//! Hardware backend implementations.
//!
//! - [`simulation`] - Software simulation backend for development and testing
//!
//! # Adding New Backends
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement the collaborator traits from [`crate::driver`]
//! 3. Register a [`BackendFactory`](crate::driver_registry::BackendFactory)
//!    in [`register_all_backends`]

pub mod simulation;

use crate::driver::HalResult;
use crate::driver_registry::BackendRegistry;

/// Register all built-in backends.
pub fn register_all_backends(registry: &mut BackendRegistry) -> HalResult<()> {
    registry.register(simulation::BACKEND_NAME, simulation::create_backend)
}
