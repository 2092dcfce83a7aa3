//! # Synapse HSP
//!
//! The federation layer: canonical message envelopes with correlation and
//! QoS, payload shapes for the peer wire protocol, the capability registry
//! with TTL staleness, and the connector that routes substrate traffic by
//! message type.
//!
//! Layering: [`envelope`] and [`payloads`] are pure wire shapes;
//! [`correlation`] and [`registry`] are bookkeeping owned by this layer;
//! [`connector`] ties them to a `SubstrateClient`.

pub mod connector;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod payloads;
pub mod registry;
pub mod topics;

pub use connector::{HspConnector, HspEvent};
pub use correlation::CorrelationTable;
pub use envelope::{Envelope, MessageType, Priority, QosParameters};
pub use error::HspError;
pub use payloads::{
    Acknowledgement, AvailabilityStatus, CapabilityAdvertisement, ErrorDetails, FactPayload,
    PeerStatus, TaskRequestPayload, TaskResultPayload,
};
pub use registry::ServiceRegistry;
