//! Shared resources
//!
//! Definitions of objects shared across tests and the registry that builds,
//! counts and disposes them.

pub mod definition;
pub mod registry;

pub use definition::{
    InitContext, ResourceDefinition, ResourceHandle, ResourceInstance, ResourceKey, ScopeKey,
    ScopeOwner,
};
pub use registry::ResourceRegistry;
