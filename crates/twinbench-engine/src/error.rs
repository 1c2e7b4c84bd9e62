//! Engine error taxonomy.
//!
//! Load failures are retried once with extended search paths before they
//! surface; malformed patch text stays scoped to the evaluation that
//! installed it; a missing entity downgrades coverage/instrumentation to
//! empty results; consistency violations are fatal to the engine.

use std::path::PathBuf;

use crate::parser::ParseError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Dependency/module resolution failure, after the extended-path retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not resolve module `{module}` (searched {searched:?}): {detail}")]
pub struct LoadError {
    pub module: String,
    pub searched: Vec<PathBuf>,
    pub detail: String,
}

/// Malformed source text, with the parse position.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SourceError(pub ParseError);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a target entity set is already registered")]
    AlreadyRegistered,
    #[error("no target entity set is registered")]
    NotRegistered,
    #[error("repository path is not a directory: {0}")]
    InvalidRepository(PathBuf),
    #[error("unknown test id `{0}`")]
    UnknownTest(String),
    #[error("unknown patch version `{0}`")]
    UnknownVersion(String),
    #[error("patch version id `original` is reserved")]
    ReservedVersion,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("entity `{0}` not found")]
    EntityNotFound(String),
    #[error("internal consistency violation: {0}")]
    Consistency(String),
    #[error("io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is scoped to one evaluation (captured into the
    /// run report) rather than fatal to the engine.
    pub fn is_per_evaluation(&self) -> bool {
        matches!(
            self,
            Self::Load(_) | Self::Source(_) | Self::EntityNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_evaluation_classification() {
        let load = EngineError::Load(LoadError {
            module: "helpers".to_string(),
            searched: vec![PathBuf::from("/repo")],
            detail: "no such file".to_string(),
        });
        assert!(load.is_per_evaluation());
        assert!(!EngineError::Consistency("drift".to_string()).is_per_evaluation());
        assert!(!EngineError::AlreadyRegistered.is_per_evaluation());
    }
}
