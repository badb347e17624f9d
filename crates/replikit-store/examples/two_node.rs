//! Example: two nodes editing the same document, with conflict detection.

use std::sync::Arc;

use replikit::{BroadcastSink, Notifier, ReplicationConfig, ReplicationIntake};
use replikit_store::{put_local, replicate, resolve_local, DocumentKind, MemoryStore, Transactional};
use serde_json::json;

fn main() {
    let config = ReplicationConfig::default();
    let alice = MemoryStore::<DocumentKind>::with_local_id("alice");
    let bob = MemoryStore::<DocumentKind>::with_local_id("bob");

    let sink = BroadcastSink::new(16);
    let mut conflicts = sink.subscribe();
    let notifier = Arc::new(Notifier::new());
    notifier.register(Arc::new(sink));
    let intake = ReplicationIntake::builder()
        .config(config.clone())
        .notifier(notifier)
        .build()
        .expect("default config is valid");

    println!("=== Replicated topic with conflict detection ===\n");

    // Alice writes, Bob receives it.
    let body = json!({ "topic": "Project kickoff" });
    let metadata = put_local(&alice, "rooms/1", body.clone(), &config).unwrap();
    let outcome = replicate(&bob, &intake, "rooms/1", metadata, Some(body)).unwrap();
    println!("Bob receives Alice's write: {outcome:?}");

    // Both edit while offline.
    put_local(&bob, "rooms/1", json!({ "topic": "Design review" }), &config).unwrap();
    let body = json!({ "topic": "Sprint planning" });
    let metadata = put_local(&alice, "rooms/1", body.clone(), &config).unwrap();

    println!("\n--- Concurrent edits ---");
    let outcome = replicate(&bob, &intake, "rooms/1", metadata, Some(body)).unwrap();
    println!("Bob receives Alice's edit: {outcome:?}");
    if let Ok(notification) = conflicts.try_recv() {
        println!("Conflict raised on {}: {:?}", notification.id, notification.conflicts);
    }
    println!("Bob's keys: {:?}", bob.keys());

    // Bob settles it; the resolution descends from both sides.
    let body = json!({ "topic": "Sprint planning + Design review" });
    let metadata = resolve_local(&bob, "rooms/1", Some(body.clone()), &config).unwrap();
    println!("\n--- Bob resolves ---");
    println!("Bob's keys: {:?}", bob.keys());

    let outcome = replicate(&alice, &intake, "rooms/1", metadata, Some(body)).unwrap();
    println!("Alice receives the resolution: {outcome:?}");
    let topic = alice.get("rooms/1").unwrap().and_then(|item| item.data().cloned());
    println!("Alice's topic: {topic:?}");
}
