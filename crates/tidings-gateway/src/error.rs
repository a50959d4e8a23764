use thiserror::Error;

use tidings_db::StoreError;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// The user already holds a live session.
    #[error("already subscribed")]
    AlreadySubscribed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0} background tasks still running at shutdown")]
    ShutdownTimeout(usize),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
