#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use audit_anchor::anchor::{InMemoryLedger, RetryPolicy};
use audit_anchor::audit::{AuditEvent, BatchPolicy, Digest};
use audit_anchor::database::{AnchorLedger, Database};
use audit_anchor::service::AnchorPipeline;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// Create a test event with a distinct actor and payload
pub fn create_test_event(n: usize) -> AuditEvent {
    AuditEvent::new(
        "user",
        format!("user-{}", n),
        "core.records.update",
        format!("{{\"record\":{}}}", n).into_bytes(),
    )
}

pub fn create_test_events(count: usize) -> Vec<AuditEvent> {
    (0..count).map(create_test_event).collect()
}

pub fn test_hashes(count: usize) -> Vec<Digest> {
    (0..count)
        .map(|i| Digest::hash(format!("event-{}", i).as_bytes()))
        .collect()
}

pub fn size_policy(max_events: usize) -> BatchPolicy {
    BatchPolicy {
        max_events,
        max_age: Duration::from_secs(3600),
    }
}

/// Pipeline over the given ledger and store with zero-delay retries
pub fn create_test_pipeline(
    max_events: usize,
    max_retries: u32,
    ledger: Arc<InMemoryLedger>,
    store: Arc<dyn AnchorLedger>,
) -> AnchorPipeline {
    AnchorPipeline::new(
        size_policy(max_events),
        RetryPolicy::immediate(max_retries),
        ledger,
        store,
    )
}
