//! # Messaging Substrate
//!
//! Topic-oriented publish/subscribe transport behind an internal bus
//! abstraction. The core never assumes a specific broker: providers are
//! enum-dispatched (`SubstrateProvider`), and the `SubstrateClient` facade
//! adds optional circuit-breaker protection on the publish path.
//!
//! ```text
//! SubstrateClient
//!   ├── provider: Arc<SubstrateProvider>            <- InMemory | Amqp
//!   └── circuit_breaker: Option<Arc<CircuitBreaker>> <- fault isolation
//! ```

pub mod client;
pub mod service;
pub mod types;

pub use client::SubstrateClient;
pub use service::{SubstrateProvider, SubstrateService};
pub use types::{topic_matches, InboundMessage, QosLevel, SubstrateError};
