use std::collections::HashSet;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Duration;

use kademlia_dht::core::{AddOutcome, Contact, NodeId, RoutingTable};

fn make_node_id(byte: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = byte;
    NodeId(id)
}

fn make_contact(byte: u8) -> Contact {
    Contact::new(
        make_node_id(byte),
        SocketAddr::from(([127, 0, 0, 1], 20_000 + byte as u16)),
    )
}

fn table(k: usize) -> RoutingTable {
    RoutingTable::new(make_node_id(0x00), k, Duration::from_secs(3600))
}

#[test]
fn routing_table_orders_contacts_by_distance() {
    let mut table = table(4);

    let contacts = [make_contact(0x10), make_contact(0x20), make_contact(0x08)];
    for contact in &contacts {
        table.add_contact(contact.clone());
    }

    let target = make_node_id(0x18);
    let closest = table.find_neighbors(&target, None, 3);
    let ids: Vec<u8> = closest.iter().map(|c| c.id.0[0]).collect();
    assert_eq!(ids, vec![0x10, 0x08, 0x20]);
}

#[test]
fn routing_table_respects_bucket_capacity() {
    let mut table = table(2);

    let contacts = [make_contact(0x80), make_contact(0xC0), make_contact(0xA0)];
    let outcomes: Vec<AddOutcome> = contacts
        .iter()
        .map(|contact| table.add_contact(contact.clone()))
        .collect();

    assert_eq!(outcomes[0], AddOutcome::Inserted);
    assert_eq!(outcomes[1], AddOutcome::Inserted);
    assert_eq!(
        outcomes[2],
        AddOutcome::Full {
            head: make_contact(0x80)
        }
    );

    let closest = table.find_neighbors(&make_node_id(0x90), None, 10);
    let ids: Vec<u8> = closest.iter().map(|c| c.id.0[0]).collect();
    assert_eq!(closest.len(), 2);
    assert!(ids.contains(&0x80));
    assert!(ids.contains(&0xC0));
}

#[test]
fn buckets_never_exceed_k_and_partition_the_space() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut table = RoutingTable::new(NodeId(rng.gen()), 3, Duration::from_secs(3600));

    for port in 0..400u16 {
        let contact = Contact::new(NodeId(rng.gen()), SocketAddr::from(([10, 0, 0, 1], port)));
        table.add_contact(contact);
    }

    let buckets = table.buckets();
    assert!(buckets.len() > 1);
    assert_eq!(buckets[0].range().0, NodeId::ZERO);
    assert_eq!(buckets[buckets.len() - 1].range().1, NodeId::MAX);
    for bucket in buckets {
        assert!(bucket.len() <= 3);
        for contact in bucket.contacts() {
            assert!(bucket.covers(&contact.distance_to(table.self_id())));
        }
    }
    for pair in buckets.windows(2) {
        assert!(pair[0].range().1 < pair[1].range().0);
    }
}

#[test]
fn find_neighbors_is_sorted_unique_bounded_and_excludes() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut table = RoutingTable::new(NodeId(rng.gen()), 4, Duration::from_secs(3600));

    for port in 0..200u16 {
        let contact = Contact::new(NodeId(rng.gen()), SocketAddr::from(([10, 0, 0, 2], port)));
        table.add_contact(contact);
    }
    let known = table.contacts();
    let excluded = known[0].id;

    for _ in 0..32 {
        let target = NodeId(rng.gen());
        let count = rng.gen_range(1..12);
        let found = table.find_neighbors(&target, Some(&excluded), count);

        assert!(found.len() <= count);
        assert!(found.iter().all(|c| c.id != excluded));
        let unique: HashSet<NodeId> = found.iter().map(|c| c.id).collect();
        assert_eq!(unique.len(), found.len());
        for pair in found.windows(2) {
            assert!(pair[0].distance_to(&target) < pair[1].distance_to(&target));
        }

        // Nothing left out is closer than the farthest returned contact.
        if let Some(farthest) = found.last() {
            let bound = farthest.distance_to(&target);
            let closer_missing = known
                .iter()
                .filter(|c| c.id != excluded && !unique.contains(&c.id))
                .any(|c| c.distance_to(&target) < bound);
            assert!(!closer_missing);
        }
    }
}

#[test]
fn removed_contact_is_new_again() {
    let mut table = table(4);
    let contact = make_contact(0x42);

    table.add_contact(contact.clone());
    assert!(!table.is_new_node(&contact));

    assert!(table.remove_contact(&contact.id));
    assert!(table.is_new_node(&contact));
    assert!(!table.remove_contact(&contact.id));
}

#[tokio::test(start_paused = true)]
async fn only_quiet_buckets_are_lonely() {
    let mut table = RoutingTable::new(make_node_id(0x00), 1, Duration::from_secs(60));
    table.add_contact(make_contact(0x80));
    // Splits the table so 0x80 and 0x40 land in separate buckets.
    table.add_contact(make_contact(0x40));
    assert!(table.lonely_buckets().is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    table.add_contact(make_contact(0x40));

    let lonely = table.lonely_buckets();
    assert!(!lonely.is_empty());
    assert!(lonely
        .iter()
        .all(|bucket| !bucket.contacts().iter().any(|c| c.id == make_node_id(0x40))));
    assert!(lonely
        .iter()
        .any(|bucket| bucket.contacts().iter().any(|c| c.id == make_node_id(0x80))));
}
