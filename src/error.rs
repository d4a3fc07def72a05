//! Error types for resource lookups and builds.

use std::path::PathBuf;
use std::sync::Arc;

/// Errors surfaced by [`Resources`](crate::Resources) operations.
///
/// Programming errors (malformed paths, duplicate registration, corrupted
/// bookkeeping) are not represented here: they panic.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// No generator is registered for the path.
    #[error("no resource registered for path {path}")]
    UnknownResource {
        /// The requested path.
        path: String,
    },

    /// The requested result type does not match the generator's output type.
    #[error("resource {resource} produces {actual}, not {expected}")]
    TypeMismatch {
        /// Debug name of the resource.
        resource: String,
        /// The type the caller asked for.
        expected: &'static str,
        /// The type the generator produces.
        actual: &'static str,
    },

    /// The generator failed synchronously.
    ///
    /// Any `Into<anyhow::Error>` returned from a generator lands here, so
    /// user errors can be propagated with `?`.
    #[error("resource {resource} failed: {error:#}")]
    Generator {
        /// Debug name of the resource.
        resource: String,
        /// The generator's error.
        error: Arc<anyhow::Error>,
    },

    /// A build re-entered a resource that is already being built.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Debug names of the resources forming the cycle.
        path: Vec<String>,
    },

    /// The result is still in flight, or its build failed, so there is
    /// nothing to read or mutate.
    #[error("resource {resource} has no resolved result")]
    Pending {
        /// Debug name of the resource.
        resource: String,
    },

    /// Writing an audit dump failed.
    #[error("failed to write audit to {}", path.display())]
    Audit {
        /// The file being written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ResourceError {
    /// Returns the generator's error if this is a `Generator` variant.
    pub fn generator_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ResourceError::Generator { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Attempts to downcast a generator error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.generator_error().and_then(|e| e.downcast_ref::<E>())
    }
}
