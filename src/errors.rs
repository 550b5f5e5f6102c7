/// Failures that can bubble out of the core operations. Handlers map
/// these onto responses at the boundary; nothing below the boundary
/// swallows an upstream failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not authenticated with spotify")]
    NotAuthenticated,

    #[error("token refresh rejected: {0}")]
    RefreshFailed(String),

    #[error("upstream music service error: {0}")]
    Upstream(String),

    #[error("not enough listening history to seed recommendations")]
    InsufficientHistory,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
