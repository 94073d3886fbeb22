//! AMQP transport for the operation coordinator.
//!
//! Consumes step events from one durable queue per event type and publishes
//! commands to one durable queue per worker, through a single reconnecting
//! connection.

pub mod config;
pub mod connection;
pub mod error;
pub mod publisher;
pub mod subscriber;

pub use config::{BrokerConfig, QueueTopology, dead_letter_queue};
pub use connection::{ConnectionManager, declare_command_queue, declare_event_queue};
pub use error::{BrokerError, Result};
pub use publisher::AmqpCommandPublisher;
pub use subscriber::{EventSubscriber, OutageBackoff, SubscriberHandle};
