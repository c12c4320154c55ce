use thiserror::Error;

use uf_common::ProducerId;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown producer: {0}")]
    UnknownProducer(ProducerId),

    #[error("Recovery request failed: {0}")]
    Recovery(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Timestamp store error: {0}")]
    Store(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] uf_amqp::AmqpError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
