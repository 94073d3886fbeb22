//! Broker error types.

use thiserror::Error;

/// Errors raised by the AMQP transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not open a connection or channel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not accept or confirm a message.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Could not declare a queue or start a consumer.
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// The connection manager was closed.
    #[error("Connection manager is closed")]
    Closed,
}

/// Convenience type alias for broker results.
pub type Result<T> = std::result::Result<T, BrokerError>;
