use std::sync::Arc;

use thiserror::Error;

/// Error produced by a provider while applying a single resource.
///
/// The error is reference-counted so that one failure can fan out to every
/// downstream consumer of the failed resource without cloning the payload.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct ProviderError(#[from] pub(crate) Arc<anyhow::Error>);

impl ProviderError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self(Arc::new(anyhow::anyhow!("{msg}")))
    }
}

impl From<anyhow::Error> for ProviderError {
    fn from(e: anyhow::Error) -> Self {
        ProviderError(Arc::new(e))
    }
}

/// Declaration-time errors. Any of these aborts a run before a single
/// provider call is made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Resource '{0}' is declared twice")]
    DuplicateName(String),

    #[error("Resource '{0}' references unknown resource '{1}'")]
    UnknownResource(String, String),

    #[error("Resource '{0}' references output '{2}', which '{1}' does not expose")]
    UnknownOutput(String, String, String),

    #[error("Dependency cycle between resources: {0}")]
    Cycle(String),
}

/// A broken single-assignment invariant on an eventual value.
///
/// This is always a programming error in graph construction, never a
/// provider failure, so the engine surfaces it immediately and fatally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Eventual value '{0}' resolved twice")]
    AlreadyResolved(String),

    #[error("Eventual value '{0}' settled again after failing")]
    AlreadyFailed(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Couldn't access the state file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse the state file.\n{0}")]
    Format(#[from] serde_json::Error),
}

/// Top-level error for a convergence run.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("Error while persisting converged state:\n{0}")]
    State(#[from] StateError),
}
