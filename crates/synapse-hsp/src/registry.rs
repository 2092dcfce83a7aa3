//! # Service Registry
//!
//! In-memory index of advertised peer capabilities. Upserts by
//! `capability_id`, stamps `received_at`, and sweeps stale entries offline
//! past the configured TTL (pruning them entirely at twice the TTL).
//!
//! Read-mostly: lookups come from the orchestrator's dispatch path, mutation
//! from inbound advertisements and the sweeper.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::payloads::{AvailabilityStatus, CapabilityAdvertisement};

/// An advertisement plus registry-side receipt bookkeeping
#[derive(Debug, Clone)]
pub struct RegisteredCapability {
    pub advertisement: CapabilityAdvertisement,
    /// Monotonic receipt instant used for staleness
    pub received_at: Instant,
    /// Wall-clock receipt time for the admin surface
    pub received_wall: DateTime<Utc>,
}

/// Counters reported to the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub capabilities: usize,
    pub peers_online: usize,
}

/// Capability index keyed by `capability_id`, with a peer-side index
#[derive(Debug)]
pub struct ServiceRegistry {
    capabilities: DashMap<String, RegisteredCapability>,
    by_peer: DashMap<String, HashSet<String>>,
    ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            capabilities: DashMap::new(),
            by_peer: DashMap::new(),
            ttl,
        }
    }

    /// Upsert an advertisement and stamp its receipt time
    pub fn register(&self, advertisement: CapabilityAdvertisement) {
        let capability_id = advertisement.capability_id.clone();
        let ai_id = advertisement.ai_id.clone();

        self.by_peer
            .entry(ai_id)
            .or_default()
            .insert(capability_id.clone());

        debug!(
            capability_id = %capability_id,
            ai_id = %advertisement.ai_id,
            version = %advertisement.version,
            "Capability registered"
        );

        self.capabilities.insert(
            capability_id,
            RegisteredCapability {
                advertisement,
                received_at: Instant::now(),
                received_wall: Utc::now(),
            },
        );
    }

    /// Resolve a capability by exact id; `None` when absent or stale-pruned
    pub fn find_by_id(&self, capability_id: &str) -> Option<RegisteredCapability> {
        self.capabilities
            .get(capability_id)
            .map(|entry| entry.clone())
    }

    /// Find online, non-stale advertisements matching a name and/or tags
    pub fn find_by_name_tags(
        &self,
        name: Option<&str>,
        tags: Option<&[String]>,
    ) -> Vec<RegisteredCapability> {
        self.capabilities
            .iter()
            .filter(|entry| {
                let reg = entry.value();
                if reg.advertisement.availability_status != AvailabilityStatus::Online {
                    return false;
                }
                if reg.received_at.elapsed() > self.ttl {
                    return false;
                }
                if let Some(name) = name {
                    if reg.advertisement.name != name {
                        return false;
                    }
                }
                if let Some(tags) = tags {
                    if !tags.iter().all(|t| reg.advertisement.tags.contains(t)) {
                        return false;
                    }
                }
                true
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Resolution used by the orchestrator's peer-step dispatch: exact id
    /// first; failing that, the id is treated as a capability name and the
    /// best advertisement wins (highest version, then earliest received).
    pub fn resolve_for_dispatch(&self, capability_id: &str) -> Option<RegisteredCapability> {
        if let Some(exact) = self.find_by_id(capability_id) {
            if exact.advertisement.availability_status == AvailabilityStatus::Online
                && exact.received_at.elapsed() <= self.ttl
            {
                return Some(exact);
            }
            return None;
        }

        let mut candidates = self.find_by_name_tags(Some(capability_id), None);
        candidates.sort_by(|a, b| {
            compare_versions(&b.advertisement.version, &a.advertisement.version)
                .then(a.received_at.cmp(&b.received_at))
        });
        candidates.into_iter().next()
    }

    /// Flip every capability of a peer on a liveness announcement
    pub fn set_peer_status(&self, ai_id: &str, online: bool) {
        let status = if online {
            AvailabilityStatus::Online
        } else {
            AvailabilityStatus::Offline
        };

        if let Some(ids) = self.by_peer.get(ai_id) {
            for capability_id in ids.iter() {
                if let Some(mut entry) = self.capabilities.get_mut(capability_id) {
                    entry.advertisement.availability_status = status;
                    if online {
                        entry.received_at = Instant::now();
                        entry.received_wall = Utc::now();
                    }
                }
            }
        }
    }

    /// One staleness pass: mark entries past TTL offline, prune past 2×TTL.
    /// Returns (marked_offline, pruned).
    pub fn sweep(&self) -> (usize, usize) {
        let mut marked = 0;
        let mut pruned: Vec<(String, String)> = Vec::new();

        for mut entry in self.capabilities.iter_mut() {
            let age = entry.received_at.elapsed();
            if age > self.ttl * 2 {
                pruned.push((
                    entry.key().clone(),
                    entry.value().advertisement.ai_id.clone(),
                ));
            } else if age > self.ttl
                && entry.advertisement.availability_status == AvailabilityStatus::Online
            {
                entry.advertisement.availability_status = AvailabilityStatus::Offline;
                marked += 1;
            }
        }

        for (capability_id, ai_id) in &pruned {
            self.capabilities.remove(capability_id);
            if let Some(mut ids) = self.by_peer.get_mut(ai_id) {
                ids.remove(capability_id);
            }
        }

        if marked > 0 || !pruned.is_empty() {
            info!(
                marked_offline = marked,
                pruned = pruned.len(),
                "Registry staleness sweep"
            );
        }

        (marked, pruned.len())
    }

    /// Spawn the periodic sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let peers_online: HashSet<String> = self
            .capabilities
            .iter()
            .filter(|e| e.advertisement.availability_status == AvailabilityStatus::Online)
            .map(|e| e.advertisement.ai_id.clone())
            .collect();

        RegistrySnapshot {
            capabilities: self.capabilities.len(),
            peers_online: peers_online.len(),
        }
    }
}

/// Compare dotted numeric versions; non-numeric segments compare as 0
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let (x, y) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(capability_id: &str, ai_id: &str, name: &str, version: &str) -> CapabilityAdvertisement {
        CapabilityAdvertisement {
            capability_id: capability_id.to_string(),
            ai_id: ai_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            version: version.to_string(),
            input_schema: None,
            output_schema: None,
            tags: vec!["nlp".to_string()],
            availability_status: AvailabilityStatus::Online,
        }
    }

    #[test]
    fn test_register_upserts_by_id() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        registry.register(advert("cap:sum", "peer1", "summarize", "1.0"));
        registry.register(advert("cap:sum", "peer1", "summarize", "1.1"));

        let found = registry.find_by_id("cap:sum").unwrap();
        assert_eq!(found.advertisement.version, "1.1");
        assert_eq!(registry.snapshot().capabilities, 1);
    }

    #[test]
    fn test_find_by_name_and_tags() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        registry.register(advert("cap:a", "peer1", "summarize", "1.0"));
        registry.register(advert("cap:b", "peer2", "translate", "1.0"));

        let by_name = registry.find_by_name_tags(Some("summarize"), None);
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].advertisement.capability_id, "cap:a");

        let by_tag = registry.find_by_name_tags(None, Some(&["nlp".to_string()]));
        assert_eq!(by_tag.len(), 2);

        let none = registry.find_by_name_tags(None, Some(&["vision".to_string()]));
        assert!(none.is_empty());
    }

    #[test]
    fn test_resolve_prefers_highest_version_then_earliest() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        registry.register(advert("cap:x1", "peer1", "cap:summarize", "1.2"));
        std::thread::sleep(Duration::from_millis(2));
        registry.register(advert("cap:x2", "peer2", "cap:summarize", "1.10"));
        std::thread::sleep(Duration::from_millis(2));
        registry.register(advert("cap:x3", "peer3", "cap:summarize", "1.10"));

        // No exact id "cap:summarize"; name-based resolution applies.
        // 1.10 > 1.2 numerically; peer2 registered before peer3.
        let resolved = registry.resolve_for_dispatch("cap:summarize").unwrap();
        assert_eq!(resolved.advertisement.ai_id, "peer2");
    }

    #[test]
    fn test_resolve_exact_id_wins() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        registry.register(advert("cap:summarize", "peer9", "other-name", "0.1"));
        let resolved = registry.resolve_for_dispatch("cap:summarize").unwrap();
        assert_eq!(resolved.advertisement.ai_id, "peer9");
    }

    #[test]
    fn test_unknown_capability_absent() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        assert!(registry.resolve_for_dispatch("cap:missing").is_none());
    }

    #[test]
    fn test_sweep_marks_then_prunes() {
        let registry = ServiceRegistry::new(Duration::from_millis(10));
        registry.register(advert("cap:old", "peer1", "old", "1.0"));

        std::thread::sleep(Duration::from_millis(15));
        let (marked, pruned) = registry.sweep();
        assert_eq!((marked, pruned), (1, 0));
        assert_eq!(
            registry.find_by_id("cap:old").unwrap().advertisement.availability_status,
            AvailabilityStatus::Offline
        );

        std::thread::sleep(Duration::from_millis(15));
        let (_, pruned) = registry.sweep();
        assert_eq!(pruned, 1);
        assert!(registry.find_by_id("cap:old").is_none());
    }

    #[test]
    fn test_peer_status_flip() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        registry.register(advert("cap:a", "peer1", "a", "1.0"));

        registry.set_peer_status("peer1", false);
        assert!(registry.resolve_for_dispatch("cap:a").is_none());
        assert_eq!(registry.snapshot().peers_online, 0);

        registry.set_peer_status("peer1", true);
        assert!(registry.resolve_for_dispatch("cap:a").is_some());
    }

    #[test]
    fn test_version_comparison() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("1.10", "1.2"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("2", "10"), Ordering::Less);
    }
}
