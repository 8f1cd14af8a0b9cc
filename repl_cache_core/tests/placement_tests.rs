use repl_cache_core::{ClusterView, NodeDescriptor, Placement, TopologyInfo};
use std::collections::HashSet;

fn node(id: &str, site: &str, rack: &str) -> NodeDescriptor {
    NodeDescriptor::new(id, TopologyInfo::new().with_site(site).with_rack(rack), "local")
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{}", i)).collect()
}

#[test]
fn test_owner_lists_agree_across_independent_placements() {
    let view = ClusterView::new(
        7,
        vec![node("a", "s1", "r1"), node("b", "s1", "r2"), node("c", "s2", "r1"), node("d", "s2", "r2")],
    );
    // Each node computes placement on its own
    let first = Placement::default().with_owner_count(Some(2));
    let second = Placement::default().with_owner_count(Some(2));
    for key in keys(200) {
        let ours = first.owners_for(&key, &view);
        let theirs = second.owners_for(&key, &view);
        assert_eq!(ours.ids(), theirs.ids());
        assert_eq!(ours.view_id(), 7);
    }
}

#[test]
fn test_owners_spread_across_sites() {
    let view = ClusterView::new(
        3,
        vec![
            node("a", "s1", "r1"),
            node("b", "s1", "r2"),
            node("c", "s2", "r1"),
            node("d", "s2", "r2"),
            node("e", "s3", "r1"),
            node("f", "s3", "r2"),
        ],
    );
    for owners in [2, 3] {
        let placement = Placement::default().with_owner_count(Some(owners));
        for key in keys(500) {
            let list = placement.owners_for(&key, &view);
            assert_eq!(list.len(), owners);
            let sites: HashSet<_> = list
                .owners()
                .iter()
                .map(|m| m.topology.site_id.clone())
                .collect();
            assert_eq!(sites.len(), owners, "owners of {} share a site", key);
        }
    }
}

#[test]
fn test_owner_count_beyond_sites_spreads_racks() {
    let view = ClusterView::new(
        1,
        vec![node("a", "s1", "r1"), node("b", "s1", "r1"), node("c", "s1", "r2"), node("d", "s2", "r1")],
    );
    let placement = Placement::default().with_owner_count(Some(3));
    for key in keys(300) {
        let list = placement.owners_for(&key, &view);
        let racks: HashSet<_> = list
            .owners()
            .iter()
            .map(|m| (m.topology.site_id.clone(), m.topology.rack_id.clone()))
            .collect();
        assert_eq!(racks.len(), 3, "owners of {} share a rack", key);
    }
}

#[test]
fn test_adding_a_node_moves_few_primaries() {
    let members = vec![node("a", "s1", "r1"), node("b", "s1", "r1"), node("c", "s1", "r1")];
    let before = ClusterView::new(1, members.clone());
    let after = before.with_member(node("d", "s1", "r1"));
    let placement = Placement::default();

    let sample = keys(1000);
    let moved = sample
        .iter()
        .filter(|key| {
            let old = placement.owners_for(key, &before);
            let new = placement.owners_for(key, &after);
            old.primary().map(|p| p.id.clone()) != new.primary().map(|p| p.id.clone())
        })
        .count();
    // Ideal is a quarter of the keys
    assert!(moved > 100, "only {} of 1000 primaries moved", moved);
    assert!(moved < 450, "{} of 1000 primaries moved", moved);
}
