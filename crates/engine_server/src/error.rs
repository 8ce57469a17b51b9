//! Server-layer error types.

use std::path::PathBuf;

use engine_component::{DispatchError, EntityError, Stage, StageError};
use engine_reflect::ReflectError;

/// Errors from loading or validating a [`ServerConfig`](crate::ServerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config text is not valid JSON for the config shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// `fixed_timestep` must be finite and positive.
    #[error("fixed timestep must be a positive number of seconds, got {0}")]
    InvalidTimestep(f64),

    /// `max_fixed_steps` must allow at least one step per frame.
    #[error("max fixed steps must be at least 1")]
    InvalidStepCap,
}

/// Errors from feature management, scene management and frame dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reflect(#[from] ReflectError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    /// A fatal callback failure aborted the frame.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("unknown feature type `{0}`")]
    UnknownType(String),

    #[error("type `{0}` does not derive from `Feature`")]
    NotDerived(&'static str),

    #[error("feature type `{0}` has no constructor")]
    NotConstructible(&'static str),

    /// The handle has already been added to a server.
    #[error("feature `{0}` is already installed")]
    AlreadyAdded(&'static str),

    /// A feature of the same type is already installed.
    #[error("a `{0}` feature is already installed")]
    DuplicateFeature(&'static str),

    #[error("feature `{0}` is not active")]
    NotActive(&'static str),

    /// Features only run in the frame stages.
    #[error("features cannot register for the {0} stage")]
    UnsupportedStage(Stage),

    #[error("feature `{type_name}` failed to activate: {source}")]
    Activation {
        type_name: &'static str,
        #[source]
        source: StageError,
    },
}

/// Misuse of the server from inside a callback is reported as a recoverable
/// failure.
impl From<ServerError> for StageError {
    fn from(err: ServerError) -> Self {
        StageError::Recoverable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_is_transparent() {
        let err = ServerError::from(DispatchError::Fatal {
            subject: "Renderer".into(),
            stage: Stage::Frame,
            message: "device lost".into(),
        });
        assert_eq!(err.to_string(), "`Renderer` failed during Frame: device lost");
    }

    #[test]
    fn test_server_error_becomes_recoverable() {
        let err = StageError::from(ServerError::UnsupportedStage(Stage::Update));
        assert!(!err.is_fatal());
        assert_eq!(err.message(), "features cannot register for the Update stage");
    }
}
