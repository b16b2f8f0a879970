//! Curated re-exports for embedders.
//!
//! ```rust
//! use datapunk_mesh::prelude::*;
//! ```

pub use crate::{
    CallFailure, CallOptions, CancellationToken, DependencyKind, ErrorKind, HealthStatus,
    Instance, InstanceState, Mesh, MeshConfig, MeshError, Priority, Transport,
};
