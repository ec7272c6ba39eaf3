//! Learned-route table: which systems and components live behind which
//! endpoints.
//!
//! Every frame an endpoint reads teaches the table that the frame's source
//! sysid/compid is reachable through that endpoint. Delivery decisions then
//! follow the policy: broadcast goes everywhere, an exactly-known component
//! routes strictly to the endpoints that have seen it, and an unknown
//! component on a known system falls back to every endpoint that has seen
//! the system. Entries age out per endpoint.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Route table owned by one router instance. Keyed by endpoint index into
/// the router's endpoint arena.
#[derive(Default)]
pub struct RoutingTable {
    /// sysid -> endpoints that have seen it, with last-seen times.
    sys_routes: HashMap<u8, HashMap<usize, Instant>>,
    /// (sysid, compid) -> endpoints that have seen the exact pair.
    comp_routes: HashMap<(u8, u8), HashMap<usize, Instant>>,
}

/// Aggregate counts for logging and the management plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoutingStats {
    /// Distinct system ids learned.
    pub total_systems: usize,
    /// Distinct (sysid, compid) pairs learned.
    pub total_routes: usize,
    /// Distinct endpoints appearing in any route.
    pub total_endpoints: usize,
}

impl RoutingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `endpoint` received a frame originated by
    /// `sysid`/`compid`.
    pub fn learn(&mut self, endpoint: usize, sysid: u8, compid: u8) {
        let now = Instant::now();
        self.sys_routes
            .entry(sysid)
            .or_default()
            .insert(endpoint, now);
        self.comp_routes
            .entry((sysid, compid))
            .or_default()
            .insert(endpoint, now);
    }

    /// Should a frame addressed to `target_sysid`/`target_compid` be
    /// delivered through `endpoint`?
    ///
    /// Targets are the frame convention: `<= 0` is broadcast.
    pub fn should_send(&self, endpoint: usize, target_sysid: i16, target_compid: i16) -> bool {
        if target_sysid <= 0 {
            return true;
        }
        let sysid = target_sysid as u8;

        let Some(sys_eps) = self.sys_routes.get(&sysid) else {
            return false;
        };

        if target_compid > 0 {
            if let Some(comp_eps) = self.comp_routes.get(&(sysid, target_compid as u8)) {
                return comp_eps.contains_key(&endpoint);
            }
            // Known system, unknown component: fall back to the system route
        }

        sys_eps.contains_key(&endpoint)
    }

    /// True if `endpoint` has seen frames from exactly `sysid`/`compid`.
    /// Used to suppress echoing a frame back toward its origin network.
    pub fn owns(&self, endpoint: usize, sysid: u8, compid: u8) -> bool {
        self.comp_routes
            .get(&(sysid, compid))
            .is_some_and(|eps| eps.contains_key(&endpoint))
    }

    /// True if `endpoint` has seen any component of `sysid`. Drives the
    /// sniffer rule.
    pub fn sees_system(&self, endpoint: usize, sysid: u8) -> bool {
        self.sys_routes
            .get(&sysid)
            .is_some_and(|eps| eps.contains_key(&endpoint))
    }

    /// Drops route entries older than `max_age`, per endpoint.
    pub fn prune(&mut self, max_age: Duration) {
        let now = Instant::now();
        let fresh = |eps: &mut HashMap<usize, Instant>| {
            eps.retain(|_, seen| now.duration_since(*seen) < max_age);
            !eps.is_empty()
        };
        self.sys_routes.retain(|_, eps| fresh(eps));
        self.comp_routes.retain(|_, eps| fresh(eps));
    }

    /// Forgets every route through `endpoint` (endpoint removed from the
    /// router).
    pub fn remove_endpoint(&mut self, endpoint: usize) {
        self.sys_routes.retain(|_, eps| {
            eps.remove(&endpoint);
            !eps.is_empty()
        });
        self.comp_routes.retain(|_, eps| {
            eps.remove(&endpoint);
            !eps.is_empty()
        });
    }

    /// Aggregate counts.
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_systems: self.sys_routes.len(),
            total_routes: self.comp_routes.len(),
            total_endpoints: self
                .sys_routes
                .values()
                .flat_map(|eps| eps.keys())
                .collect::<HashSet<_>>()
                .len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_learning() {
        let mut rt = RoutingTable::new();
        assert!(!rt.should_send(0, 100, 1));

        rt.learn(0, 100, 1);
        assert!(rt.should_send(0, 100, 0));
        assert!(rt.should_send(0, 100, 1));
        // Unknown component falls back to the system route
        assert!(rt.should_send(0, 100, 2));
        // Other endpoints have no route
        assert!(!rt.should_send(1, 100, 0));
    }

    #[test]
    fn test_known_component_routes_strictly() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);
        rt.learn(1, 100, 2);

        // System-wide goes to both
        assert!(rt.should_send(0, 100, 0));
        assert!(rt.should_send(1, 100, 0));

        // Exactly-known components route only to their endpoint
        assert!(rt.should_send(0, 100, 1));
        assert!(!rt.should_send(1, 100, 1));
        assert!(rt.should_send(1, 100, 2));
        assert!(!rt.should_send(0, 100, 2));

        // Unknown component: both endpoints know the system
        assert!(rt.should_send(0, 100, 3));
        assert!(rt.should_send(1, 100, 3));
    }

    #[test]
    fn test_system_isolation() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);
        rt.learn(1, 200, 1);

        assert!(rt.should_send(0, 100, 0));
        assert!(!rt.should_send(1, 100, 0));
        assert!(rt.should_send(1, 200, 0));
        assert!(!rt.should_send(0, 200, 0));
    }

    #[test]
    fn test_broadcast_always_sends() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);
        assert!(rt.should_send(0, 0, 0));
        assert!(rt.should_send(99, 0, 0));
        assert!(rt.should_send(99, crate::frame::NO_TARGET, crate::frame::NO_TARGET));
    }

    #[test]
    fn test_owns_is_exact() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);

        assert!(rt.owns(0, 100, 1));
        assert!(!rt.owns(0, 100, 2));
        assert!(!rt.owns(1, 100, 1));
        assert!(rt.sees_system(0, 100));
        assert!(!rt.sees_system(1, 100));
    }

    #[test]
    fn test_prune_ages_out_routes() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);
        assert!(rt.should_send(0, 100, 0));

        std::thread::sleep(Duration::from_millis(30));
        rt.prune(Duration::from_millis(10));
        assert!(!rt.should_send(0, 100, 0));
        assert_eq!(rt.stats().total_systems, 0);
    }

    #[test]
    fn test_remove_endpoint_forgets_routes() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 100, 1);
        rt.learn(1, 100, 2);

        rt.remove_endpoint(0);
        assert!(!rt.should_send(0, 100, 1));
        assert!(rt.should_send(1, 100, 2));
        assert_eq!(rt.stats().total_endpoints, 1);
    }

    #[test]
    fn test_stats_counts() {
        let mut rt = RoutingTable::new();
        rt.learn(0, 1, 1);
        rt.learn(0, 2, 1);
        rt.learn(1, 1, 2);

        let stats = rt.stats();
        assert_eq!(stats.total_systems, 2);
        assert_eq!(stats.total_routes, 3);
        assert_eq!(stats.total_endpoints, 2);
    }
}
