use thiserror::Error;

/// Crate-wide error type.
///
/// Design:
/// - Every variant carries owned strings, so the whole enum is `Clone`.
///   A `Barrier` hands the same rejection to every waiter, which requires
///   cloning the error out of shared state.
/// - Contract errors (duplicate registration, bad namespace, double start)
///   fail fast and are never retried internally. Retry is a composable
///   concern; see `sync::backoff`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("provider already registered for {0}")]
    AlreadyRegistered(String),

    #[error("invalid tool key: {0}")]
    InvalidToolKey(String),

    #[error("no provider registered for key {0}")]
    NoProvider(String),

    #[error("failed to configure provider {provider} - missing dependency {dependency}")]
    MissingDependency { provider: String, dependency: String },

    #[error("no tool named {0} in toolbox")]
    NoTool(String),

    #[error("tool {0} has unexpected type")]
    ToolType(String),

    #[error("context previously started")]
    AlreadyStarted,

    #[error("singleton context already initialized")]
    AlreadyBuilt,

    #[error("mutex throttle")]
    Throttle,

    #[error("invalid key: {0}")]
    InvalidStateKey(String),

    #[error("config load failed for {href}: {message}")]
    ConfigLoad { href: String, message: String },

    #[error("barrier cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl ContextError {
    pub fn other(message: impl Into<String>) -> Self {
        ContextError::Other(message.into())
    }
}
