//! Route table behaviour under concurrent sessions
//!
//! Many sessions on one listener share a single table. This verifies:
//! 1. Concurrent first sightings of one address agree on a single id
//! 2. Every id handed out resolves back to its address
//! 3. Ids stay unique across addresses

use relaykit_router::UdpRoutes;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

fn peer(i: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 20_000 + i))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_agrees_on_ids() {
    let routes = Arc::new(UdpRoutes::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let routes = routes.clone();
        handles.push(tokio::spawn(async move {
            (0..100u16)
                .map(|i| (i, routes.find_or_add_route_by_addr(peer(i))))
                .collect::<Vec<_>>()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("task panicked"));
    }

    // Every task saw the same id for the same address
    let reference = &results[0];
    for other in &results[1..] {
        assert_eq!(reference, other);
    }

    let ids: HashSet<_> = reference.iter().map(|(_, id)| *id).collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(routes.len(), 100);

    for (i, id) in reference {
        assert_eq!(routes.find_route_by_id(*id).unwrap(), peer(*i));
    }
}

#[test]
fn test_any_registration_sequence_is_consistent() {
    let routes = UdpRoutes::new();
    let sequence = [3u16, 1, 3, 7, 1, 1, 9, 7, 3, 2];

    let mut first_seen = std::collections::HashMap::new();
    for i in sequence {
        let id = routes.find_or_add_route_by_addr(peer(i));
        let expected = *first_seen.entry(i).or_insert(id);
        assert_eq!(id, expected, "address {} changed route id", peer(i));
        assert_eq!(routes.find_route_by_id(id).unwrap(), peer(i));
    }

    assert_eq!(routes.len(), first_seen.len());
}
