use thiserror::Error;

/// Engine error taxonomy. Every variant carries a human-readable message;
/// `kind()` is the stable machine-readable discriminator.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Store(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn retrieval(msg: impl std::fmt::Display) -> Self {
        Self::Retrieval(msg.to_string())
    }

    pub fn generation(msg: impl std::fmt::Display) -> Self {
        Self::Generation(msg.to_string())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn provider(msg: impl std::fmt::Display) -> Self {
        Self::Provider(msg.to_string())
    }

    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::Store(msg.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Retrieval(_) => "retrieval",
            Self::Generation(_) => "generation",
            Self::Concurrency(_) => "concurrency",
            Self::Provider(_) => "provider",
            Self::Store(_) => "store",
        }
    }

    /// Transient errors are worth retrying with backoff; everything else is
    /// terminal for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retrieval(_) | Self::Provider(_) | Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
