use thiserror::Error;

#[derive(Error, Debug)]
pub enum GapFillerError {
    #[error("GraphQL parse error: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("no arguments")]
    NoArguments,

    #[error("bad argument type: {0}")]
    BadArgumentType(String),

    #[error("context deadline reached")]
    DeadlineReached,

    #[error("pulling timeout")]
    PollingTimeout,

    #[error("no rpc endpoint is available")]
    NoAvailableEndpoint,

    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("RPC error from {endpoint}: {message}")]
    Rpc { endpoint: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ethers::providers::ProviderError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GapFillerError {
    /// Errors that abort the whole HTTP request. Everything else is absorbed
    /// per field during the backfill pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GapFillerError::Parse(_) | GapFillerError::Transport(_))
    }
}

pub type GapFillerResult<T> = Result<T, GapFillerError>;
