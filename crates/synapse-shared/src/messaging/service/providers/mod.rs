//! Substrate provider implementations

mod amqp;
mod in_memory;

pub use amqp::AmqpSubstrate;
pub use in_memory::InMemorySubstrate;
