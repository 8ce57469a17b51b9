//! Registration error types.

/// Errors reported by [`TypeRegistry::register`](crate::TypeRegistry::register).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReflectError {
    /// A different descriptor is already registered under this name.
    #[error("type '{name}' is already registered with a different identity")]
    Conflict {
        /// The contested type name.
        name: &'static str,
    },

    /// The descriptor's parent chain does not terminate at a root.
    #[error("type '{name}' has a cyclic parent chain")]
    CyclicParent {
        /// The descriptor whose chain was rejected.
        name: &'static str,
    },
}
