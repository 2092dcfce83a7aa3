//! # Status Shapes
//!
//! Read-only, best-effort snapshots for the admin surface. Subsystem blocks
//! are `null` when the subsystem is disabled.

use std::collections::HashMap;

use serde::Serialize;

use synapse_shared::models::TaskStatus;

/// Fields owned by the orchestrator command loop
#[derive(Debug, Clone, Serialize, Default)]
pub struct OrchestratorStatus {
    pub draining: bool,
    pub tasks_in_flight: usize,
    /// Live task statuses plus cumulative terminal counts
    pub tasks_by_state: HashMap<TaskStatus, u64>,
    /// Peer steps currently waiting out a retry delay
    pub active_retries: usize,
}

/// Federation gauges
#[derive(Debug, Clone, Serialize)]
pub struct HspStatus {
    pub connected: bool,
    pub pending_acks: usize,
    pub active_retries: usize,
}

/// Memory store gauges
#[derive(Debug, Clone, Serialize)]
pub struct HamStatus {
    pub record_count: usize,
    pub refused_writes: u64,
}

/// Registry gauges
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub capabilities: usize,
    pub peers_online: usize,
}

/// The full admin status document
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub draining: bool,
    pub tasks_in_flight: usize,
    pub tasks_by_state: HashMap<TaskStatus, u64>,
    pub hsp: Option<HspStatus>,
    pub ham: Option<HamStatus>,
    pub registry: Option<RegistryStatus>,
}
