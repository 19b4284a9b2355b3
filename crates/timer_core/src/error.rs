use thiserror::Error;

pub type Result<T> = std::result::Result<T, TimerError>;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timer notification {0} not found")]
    NotificationNotFound(u64),

    #[error("no timer notification of type `{0}`")]
    TypeNotFound(String),

    #[error("listener {0} is not registered")]
    ListenerNotFound(u64),

    #[error("unable to spawn alarm dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),
}

impl TimerError {
    /// True for the not-found family of errors raised by removal paths.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TimerError::NotificationNotFound(_)
                | TimerError::TypeNotFound(_)
                | TimerError::ListenerNotFound(_)
        )
    }
}
