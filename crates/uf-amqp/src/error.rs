use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmqpError {
    /// Connection or channel could not be created or used
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for AmqpError {
    fn from(e: lapin::Error) -> Self {
        AmqpError::Transport(e.to_string())
    }
}
