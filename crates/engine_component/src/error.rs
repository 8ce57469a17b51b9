//! Error types for entity, component and dispatch operations.

use engine_reflect::ReflectError;
use thiserror::Error;

use crate::stage::Stage;

/// Failure reported by a component or feature callback.
///
/// A recoverable failure is logged at the dispatch boundary and the stage
/// carries on with the next subject. A fatal failure aborts the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Logged and reported to the listener; siblings still run.
    #[error("{0}")]
    Recoverable(String),

    /// Aborts the rest of the frame.
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    /// A failure that does not stop sibling callbacks.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    /// A failure that aborts the rest of the frame.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns `true` for [`StageError::Fatal`].
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(message) | Self::Fatal(message) => message,
        }
    }
}

impl From<String> for StageError {
    fn from(message: String) -> Self {
        StageError::Recoverable(message)
    }
}

impl From<&str> for StageError {
    fn from(message: &str) -> Self {
        StageError::Recoverable(message.to_string())
    }
}

/// Lifecycle misuse inside a callback, such as registering a stage while
/// inactive, is reported as a recoverable failure.
impl From<EntityError> for StageError {
    fn from(err: EntityError) -> Self {
        StageError::Recoverable(err.to_string())
    }
}

/// Result of a lifecycle or stage callback.
pub type StageResult = Result<(), StageError>;

/// Errors from construction and lifecycle transitions on entities and
/// components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("type `{type_name}` does not derive from `{base}`")]
    NotDerived {
        type_name: &'static str,
        base: &'static str,
    },

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("type `{0}` has no constructor")]
    NotConstructible(&'static str),

    #[error("component `{type_name}` is already attached")]
    AlreadyAttached { type_name: &'static str },

    #[error("entity `{name}` has been destroyed")]
    Destroyed { name: String },

    #[error("cannot parent `{child}` under its own descendant `{parent}`")]
    CyclicParent { child: String, parent: String },

    #[error("component `{type_name}` is not active")]
    NotActive { type_name: &'static str },

    #[error("`{type_name}` failed to activate: {source}")]
    Activation {
        type_name: &'static str,
        #[source]
        source: StageError,
    },

    #[error("`{type_name}` failed to attach: {source}")]
    Attach {
        type_name: &'static str,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Reflect(#[from] ReflectError),
}

/// A fatal callback failure that escaped a stage walk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("`{subject}` failed during {stage}: {message}")]
    Fatal {
        subject: String,
        stage: Stage,
        message: String,
    },
}

impl DispatchError {
    /// Name of the component or feature type that failed.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Fatal { subject, .. } => subject,
        }
    }

    /// The stage that was running.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Fatal { stage, .. } => *stage,
        }
    }
}
