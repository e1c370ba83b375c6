//! UDP route table shared by all sessions of a listener

use dashmap::DashMap;
use relaykit_proto::RouteId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

/// Route table errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Unknown route: {0}")]
    UnknownRoute(RouteId),
}

/// Bidirectional map between UDP peer addresses and route ids
///
/// Ids come from a monotonically increasing counter and are never handed out
/// twice, so a stale id can not silently resolve to a different peer.
/// Entries live until removed explicitly.
pub struct UdpRoutes {
    by_addr: DashMap<SocketAddr, RouteId>,
    by_id: DashMap<RouteId, SocketAddr>,
    next_id: AtomicU64,
}

impl UdpRoutes {
    pub fn new() -> Self {
        Self {
            by_addr: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the route id for `addr`, registering a new route on first sight
    pub fn find_or_add_route_by_addr(&self, addr: SocketAddr) -> RouteId {
        if let Some(id) = self.by_addr.get(&addr) {
            return *id;
        }

        // The entry lock on `by_addr` serialises concurrent first sightings of
        // the same address, so exactly one id is allocated for it.
        *self.by_addr.entry(addr).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.by_id.insert(id, addr);
            trace!("Registered UDP route {} -> {}", id, addr);
            id
        })
    }

    /// Lookup the peer address registered for `id`
    pub fn find_route_by_id(&self, id: RouteId) -> Result<SocketAddr, RouteError> {
        self.by_id
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or(RouteError::UnknownRoute(id))
    }

    /// Lookup the route id of an already registered address
    pub fn find_route_by_addr(&self, addr: &SocketAddr) -> Option<RouteId> {
        self.by_addr.get(addr).map(|entry| *entry.value())
    }

    /// Remove a route; its id is not reused
    pub fn remove_route(&self, id: RouteId) -> Result<SocketAddr, RouteError> {
        let (_, addr) = self
            .by_id
            .remove(&id)
            .ok_or(RouteError::UnknownRoute(id))?;
        self.by_addr.remove_if(&addr, |_, existing| *existing == id);
        trace!("Removed UDP route {} -> {}", id, addr);
        Ok(addr)
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for UdpRoutes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_same_addr_same_id() {
        let routes = UdpRoutes::new();

        let first = routes.find_or_add_route_by_addr(addr("10.0.0.1:5000"));
        let again = routes.find_or_add_route_by_addr(addr("10.0.0.1:5000"));
        assert_eq!(first, again);
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_distinct_addrs_distinct_ids() {
        let routes = UdpRoutes::new();

        let a = routes.find_or_add_route_by_addr(addr("10.0.0.1:5000"));
        let b = routes.find_or_add_route_by_addr(addr("10.0.0.1:5001"));
        let c = routes.find_or_add_route_by_addr(addr("[::1]:5000"));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(routes.len(), 3);
    }

    #[test]
    fn test_lookup_by_id_resolves() {
        let routes = UdpRoutes::new();
        let peer = addr("192.168.1.7:53");

        let id = routes.find_or_add_route_by_addr(peer);
        assert_eq!(routes.find_route_by_id(id), Ok(peer));
        assert_eq!(routes.find_route_by_addr(&peer), Some(id));
    }

    #[test]
    fn test_unknown_id_is_error() {
        let routes = UdpRoutes::new();
        assert_eq!(routes.find_route_by_id(42), Err(RouteError::UnknownRoute(42)));
    }

    #[test]
    fn test_removed_id_is_not_reused() {
        let routes = UdpRoutes::new();
        let peer = addr("10.1.1.1:9000");

        let id = routes.find_or_add_route_by_addr(peer);
        assert_eq!(routes.remove_route(id), Ok(peer));
        assert!(routes.is_empty());
        assert!(routes.find_route_by_id(id).is_err());

        let new_id = routes.find_or_add_route_by_addr(peer);
        assert_ne!(id, new_id);
        assert_eq!(routes.find_route_by_id(new_id), Ok(peer));
    }

    #[test]
    fn test_remove_unknown_route() {
        let routes = UdpRoutes::new();
        assert_eq!(routes.remove_route(7), Err(RouteError::UnknownRoute(7)));
    }
}
