//! # Configuration
//!
//! Declarative configuration read once at startup: typed structs with serde
//! defaults for every key, loaded from TOML with environment-variable
//! overrides. Components receive the sub-structs they need through
//! constructor injection; nothing re-reads configuration at runtime.

mod synapse;

pub use synapse::{
    CpuProfile, DiskProfile, GpuProfile, HamConfig, HspConfig, OrchestratorConfig, RamProfile,
    ReconnectConfig, RegistryConfig, ResourceProfile, SubstrateConfig, SubstrateProviderKind,
    SynapseConfig, WebConfig,
};
