use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Lifecycle status of a queued item.
///
/// Allowed transitions:
///
/// ```text
///           enqueue                 lease_batch
/// Pending ──────────► (created) ───────────────► Leased
///    ▲                                             │
///    │ release_lease / lease expiry (retry + 1)    │
///    └─────────────────────────────────────────────┤
///                                                  │ mark_sent ──► Sent
///                                                  │ mark_dead ──► Dead
/// ```
///
/// `Sent` and `Dead` are terminal; terminal rows only leave the queue
/// through `delete_sent` / `delete_dead` / `trim_oldest_by_count`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ItemStatus {
    Pending = 0,
    Leased = 1,
    Sent = 2,
    Dead = 3,
}

/// An item handed out by [`EventQueue::lease_batch`].
///
/// The payload is the exact JSON document given at enqueue time; the queue
/// never parses or rewrites it.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    /// Store-assigned identifier, strictly increasing and never reused.
    pub id: i64,
    /// RFC 3339 UTC instant stamped at enqueue.
    pub created_utc: String,
    /// Caller-chosen event kind (e.g. `"heartbeat"`); opaque to the queue.
    pub kind: String,
    /// The event payload as a JSON document.
    pub payload_json: String,
    /// Number of times this item went back to `Pending` after a claim.
    pub retry_count: u32,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub sent: u64,
    pub dead: u64,
    pub total: u64,
}

pub type DynEventQueue = Arc<dyn EventQueue>;

/// Crash-safe FIFO queue with leased-batch delivery semantics.
///
/// Exactly one process opens a given queue file at a time (single-writer);
/// within that process every operation is safe to call from multiple tasks.
/// All multi-step operations are atomic: they either apply fully or not at
/// all.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Performs initial setup required before actually using the queue
    ///
    /// This function should be called first, before using any of the other functions.
    async fn setup(&self) -> anyhow::Result<()>;

    /// Inserts an already-serialized JSON payload as a new `Pending` item.
    ///
    /// Returns the assigned id. The queue treats `payload_json` as opaque
    /// bytes; callers are responsible for handing over valid JSON.
    async fn enqueue_raw(&self, kind: &str, payload_json: &str) -> anyhow::Result<i64>;

    /// Claims up to `batch_size` pending items for `lease_for`.
    ///
    /// Runs as one serialized transaction: expired leases are first
    /// reclaimed (back to `Pending`, `retry_count` + 1), then the oldest
    /// pending items are claimed and returned ordered by ascending id.
    /// The transaction commits even when nothing could be claimed, so
    /// reclamation is durable on its own.
    async fn lease_batch(&self, batch_size: usize, lease_for: Duration) -> anyhow::Result<Vec<LeasedItem>>;

    /// Transitions the given rows to `Sent` and clears their lease.
    ///
    /// Unconditional by id and therefore idempotent; re-acking is harmless.
    /// Returns the number of rows updated.
    async fn mark_sent(&self, ids: &[i64]) -> anyhow::Result<u64>;

    /// Transitions the given rows to `Dead` and clears their lease.
    ///
    /// Intended for policy layers above the queue (e.g. a maximum retry
    /// threshold). Unconditional by id. Returns the number of rows updated.
    async fn mark_dead(&self, ids: &[i64]) -> anyhow::Result<u64>;

    /// Voluntarily returns currently `Leased` rows to `Pending`.
    ///
    /// Increments `retry_count`; rows not in `Leased` are left untouched.
    /// Must not be used on items that are also left to expire naturally, as
    /// the two paths would double-count the retry.
    async fn release_lease(&self, ids: &[i64]) -> anyhow::Result<u64>;

    /// Permanently removes `Sent` rows; returns the count removed.
    async fn delete_sent(&self) -> anyhow::Result<u64>;

    /// Permanently removes `Dead` rows; returns the count removed.
    async fn delete_dead(&self) -> anyhow::Result<u64>;

    /// Bounded-growth safety valve.
    ///
    /// When the total row count exceeds `max_rows`, deletes the excess
    /// lowest-id rows regardless of status. Returns the count removed.
    async fn trim_oldest_by_count(&self, max_rows: u64) -> anyhow::Result<u64>;

    /// Number of `Pending` rows.
    async fn pending_count(&self) -> anyhow::Result<u64>;

    /// Total number of rows, any status.
    async fn total_count(&self) -> anyhow::Result<u64>;

    /// Row counts broken down by status.
    async fn stats(&self) -> anyhow::Result<QueueStats>;
}

/// Serializing convenience over [`EventQueue::enqueue_raw`].
#[async_trait]
pub trait EventQueueExt {
    /// Serializes `payload` to JSON and enqueues it as a new `Pending` item.
    async fn enqueue<T: Serialize + Sync>(&self, kind: &str, payload: &T) -> anyhow::Result<i64>;
}

#[async_trait]
impl<Q: EventQueue + ?Sized> EventQueueExt for Q {
    async fn enqueue<T: Serialize + Sync>(&self, kind: &str, payload: &T) -> anyhow::Result<i64> {
        let payload_json = serde_json::to_string(payload)?;
        self.enqueue_raw(kind, &payload_json).await
    }
}
