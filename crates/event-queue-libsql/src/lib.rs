#[macro_use]
extern crate tracing;

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use event_queue::{EventQueue, ItemStatus, LeasedItem, QueueStats};
use libsql::Connection;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;

#[rustfmt::skip]
pub use libsql;

// Typically, migrations should not be modified once released, and we should only be appending to this list.
const MIGRATIONS: &[&str] = &[
    // Migration 0 - Initial schema
    include_str!("../migrations/01_queue_items.sql"),
];

/// Implementation of [`EventQueue`] using libSQL as the backend.
///
/// This follows the claim/ack patterns of SQLite-backed job queues:
/// - <https://dev.37signals.com/introducing-solid-queue/>
/// - <https://kerkour.com/rust-job-queue-with-postgresql>
///
/// The schema version is tracked through the 'user_version' value, a
/// lightweight integer stored at a fixed offset in the SQLite file:
/// - <https://sqlite.org/pragma.html#pragma_user_version>
pub struct LibSqlEventQueue {
    // libSQL does not support interleaved transactions on a single
    // connection object, and the queue file has exactly one writing process.
    // The mutex is held for the full duration of every operation, so each
    // transaction observes and produces a consistent state.
    conn: Mutex<Connection>,
}

impl LibSqlEventQueue {
    /// Opens (or creates) the queue database at `path`.
    ///
    /// The path can be a file path for local SQLite, or `:memory:` for an
    /// in-memory database. [`EventQueue::setup`] must be called before any
    /// other operation.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let conn = libsql::Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("failed to open libSQL database at {path}"))?
            .connect()
            .context("failed to connect to libSQL")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    async fn apply_pragmas(conn: &Connection) -> anyhow::Result<()> {
        // WAL + synchronous=NORMAL: transactions survive a process crash and
        // stay corruption-free; at most the last fsync window can be lost on
        // host power loss. The busy timeout bounds how long a contended
        // operation blocks before surfacing SQLITE_BUSY.
        const PRAGMAS: &str = "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -3000;
            PRAGMA auto_vacuum = INCREMENTAL;
            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to batch execute SQL query")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(conn: &Connection) -> anyhow::Result<()> {
        let user_version = query_user_version(conn).await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    conn.execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    update_user_version(conn, migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        return Ok(());

        async fn query_user_version(conn: &Connection) -> anyhow::Result<usize> {
            let row = conn
                .query("PRAGMA user_version", ())
                .await
                .context("failed to execute SQL query")?
                .next()
                .await
                .context("failed to read the row")?
                .context("no row returned")?;

            let value = row.get::<u64>(0).context("failed to read user_version value")?;

            usize::try_from(value).context("user_version does not fit in usize")
        }

        async fn update_user_version(conn: &Connection, value: usize) -> anyhow::Result<()> {
            let sql_query = format!("PRAGMA user_version = {value}");

            conn.execute(&sql_query, ())
                .await
                .context("failed to execute SQL query")?;

            Ok(())
        }
    }

    /// Sets the given rows to a terminal status and clears their lease.
    async fn mark_terminal(&self, ids: &[i64], status: ItemStatus) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().await;

        let sql_query = format!(
            "UPDATE queue_items SET status = ?, lease_until_ms = NULL WHERE id IN ({})",
            repeat_qm(ids.len())
        );

        let mut params: Vec<libsql::Value> = vec![libsql::Value::from(status as u32)];
        params.extend(ids.iter().copied().map(libsql::Value::from));

        let changed = conn
            .execute(&sql_query, params)
            .await
            .with_context(|| format!("failed to mark rows {status:?}"))?;

        trace!(changed, ?status, "Marked rows terminal");

        Ok(changed)
    }

    /// Removes every row in the given terminal status.
    async fn delete_terminal(&self, status: ItemStatus) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;

        let removed = conn
            .execute("DELETE FROM queue_items WHERE status = ?", [status as u32])
            .await
            .with_context(|| format!("failed to delete {status:?} rows"))?;

        trace!(removed, ?status, "Deleted terminal rows");

        Ok(removed)
    }

    async fn count_where(&self, sql_query: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;

        let row = conn
            .query(sql_query, ())
            .await
            .context("failed to execute count query")?
            .next()
            .await
            .context("failed to read the count row")?
            .context("no count row returned")?;

        row.get::<u64>(0).context("failed to read count value")
    }
}

#[async_trait]
impl EventQueue for LibSqlEventQueue {
    async fn setup(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        Self::apply_pragmas(&conn).await?;
        Self::migrate(&conn).await?;
        Ok(())
    }

    async fn enqueue_raw(&self, kind: &str, payload_json: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;

        let created_utc = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format enqueue timestamp")?;

        let sql_query = "INSERT INTO queue_items (created_utc, kind, payload, status, retry_count)
            VALUES (:created_utc, :kind, :payload, :status, 0)
            RETURNING id";

        let params = (
            (":created_utc", created_utc),
            (":kind", kind),
            (":payload", payload_json.as_bytes().to_vec()),
            (":status", ItemStatus::Pending as u32),
        );

        let row = conn
            .query(sql_query, params)
            .await
            .context("failed to insert queue item")?
            .next()
            .await
            .context("failed to read the inserted row")?
            .context("insert returned no row")?;

        let id = row.get::<i64>(0).context("failed to read assigned id")?;

        trace!(id, kind, "Enqueued item");

        Ok(id)
    }

    async fn lease_batch(&self, batch_size: usize, lease_for: Duration) -> anyhow::Result<Vec<LeasedItem>> {
        let conn = self.conn.lock().await;

        let now_ms = now_unix_ms();
        let lease_until_ms = now_ms.saturating_add(duration_millis(lease_for));

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .context("failed to begin lease transaction")?;

        match lease_batch_tx(&conn, batch_size, now_ms, lease_until_ms).await {
            Ok(items) => {
                conn.execute("COMMIT", ())
                    .await
                    .context("failed to commit lease transaction")?;
                Ok(items)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn mark_sent(&self, ids: &[i64]) -> anyhow::Result<u64> {
        self.mark_terminal(ids, ItemStatus::Sent).await
    }

    async fn mark_dead(&self, ids: &[i64]) -> anyhow::Result<u64> {
        self.mark_terminal(ids, ItemStatus::Dead).await
    }

    async fn release_lease(&self, ids: &[i64]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().await;

        let sql_query = format!(
            "UPDATE queue_items
             SET status = ?, lease_until_ms = NULL, retry_count = retry_count + 1
             WHERE status = ? AND id IN ({})",
            repeat_qm(ids.len())
        );

        let mut params: Vec<libsql::Value> = vec![
            libsql::Value::from(ItemStatus::Pending as u32),
            libsql::Value::from(ItemStatus::Leased as u32),
        ];
        params.extend(ids.iter().copied().map(libsql::Value::from));

        let changed = conn
            .execute(&sql_query, params)
            .await
            .context("failed to release leases")?;

        trace!(changed, "Released leases");

        Ok(changed)
    }

    async fn delete_sent(&self) -> anyhow::Result<u64> {
        self.delete_terminal(ItemStatus::Sent).await
    }

    async fn delete_dead(&self) -> anyhow::Result<u64> {
        self.delete_terminal(ItemStatus::Dead).await
    }

    async fn trim_oldest_by_count(&self, max_rows: u64) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .context("failed to begin trim transaction")?;

        match trim_tx(&conn, max_rows).await {
            Ok(removed) => {
                conn.execute("COMMIT", ())
                    .await
                    .context("failed to commit trim transaction")?;

                if removed > 0 {
                    warn!(removed, max_rows, "Trimmed oldest rows to bound queue growth");
                }

                Ok(removed)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn pending_count(&self) -> anyhow::Result<u64> {
        self.count_where("SELECT COUNT(*) FROM queue_items WHERE status = 0").await
    }

    async fn total_count(&self) -> anyhow::Result<u64> {
        self.count_where("SELECT COUNT(*) FROM queue_items").await
    }

    async fn stats(&self) -> anyhow::Result<QueueStats> {
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM queue_items GROUP BY status", ())
            .await
            .context("failed to query queue stats")?;

        let mut stats = QueueStats::default();

        while let Some(row) = rows.next().await.context("failed to read stats row")? {
            let status = row.get::<i64>(0).context("failed to read status value")?;
            let count = row.get::<u64>(1).context("failed to read status count")?;

            match status {
                0 => stats.pending = count,
                1 => stats.leased = count,
                2 => stats.sent = count,
                3 => stats.dead = count,
                other => warn!(status = other, count, "Unknown status value in queue file"),
            }

            stats.total += count;
        }

        Ok(stats)
    }
}

/// Body of the lease transaction; the caller owns BEGIN/COMMIT/ROLLBACK.
async fn lease_batch_tx(
    conn: &Connection,
    batch_size: usize,
    now_ms: i64,
    lease_until_ms: i64,
) -> anyhow::Result<Vec<LeasedItem>> {
    // Step 1: expired leases go back to Pending, counting the retry.
    let reclaim_query = "UPDATE queue_items
        SET status = :pending, lease_until_ms = NULL, retry_count = retry_count + 1
        WHERE status = :leased AND lease_until_ms <= :now_ms";

    let reclaim_params = (
        (":pending", ItemStatus::Pending as u32),
        (":leased", ItemStatus::Leased as u32),
        (":now_ms", now_ms),
    );

    let reclaimed = conn
        .execute(reclaim_query, reclaim_params)
        .await
        .context("failed to reclaim expired leases")?;

    if reclaimed > 0 {
        debug!(reclaimed, "Reclaimed expired leases");
    }

    // Step 2: pick candidates, oldest first.
    let select_query = "SELECT id FROM queue_items
        WHERE status = :pending
        ORDER BY id ASC
        LIMIT :batch_size";

    let select_params = (
        (":pending", ItemStatus::Pending as u32),
        (":batch_size", i64::try_from(batch_size).unwrap_or(i64::MAX)),
    );

    let mut rows = conn
        .query(select_query, select_params)
        .await
        .context("failed to select lease candidates")?;

    let mut candidate_ids: Vec<i64> = Vec::new();

    while let Some(row) = rows.next().await.context("failed to read candidate row")? {
        candidate_ids.push(row.get::<i64>(0).context("failed to read candidate id")?);
    }

    // The transaction still commits so the reclamation above is durable.
    if candidate_ids.is_empty() {
        return Ok(Vec::new());
    }

    // Step 3: claim the candidates.
    let claim_query = format!(
        "UPDATE queue_items SET status = ?, lease_until_ms = ? WHERE id IN ({})",
        repeat_qm(candidate_ids.len())
    );

    let mut claim_params: Vec<libsql::Value> = vec![
        libsql::Value::from(ItemStatus::Leased as u32),
        libsql::Value::from(lease_until_ms),
    ];
    claim_params.extend(candidate_ids.iter().copied().map(libsql::Value::from));

    conn.execute(&claim_query, claim_params)
        .await
        .context("failed to claim lease candidates")?;

    // Step 4: read the claimed rows back, FIFO by id.
    let read_query = format!(
        "SELECT id, created_utc, kind, payload, retry_count
         FROM queue_items
         WHERE id IN ({})
         ORDER BY id ASC",
        repeat_qm(candidate_ids.len())
    );

    let read_params: Vec<libsql::Value> = candidate_ids.iter().copied().map(libsql::Value::from).collect();

    let mut rows = conn
        .query(&read_query, read_params)
        .await
        .context("failed to read claimed rows")?;

    let mut items = Vec::with_capacity(candidate_ids.len());

    while let Some(row) = rows.next().await.context("failed to read claimed row")? {
        let payload: Vec<u8> = row.get(3).context("failed to read payload")?;
        let retry_count = row.get::<u64>(4).context("failed to read retry_count")?;

        items.push(LeasedItem {
            id: row.get::<i64>(0).context("failed to read id")?,
            created_utc: row.get::<String>(1).context("failed to read created_utc")?,
            kind: row.get::<String>(2).context("failed to read kind")?,
            payload_json: String::from_utf8(payload).context("payload is not valid UTF-8")?,
            retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        });
    }

    trace!(count = items.len(), lease_until_ms, "Leased batch");

    Ok(items)
}

/// Body of the trim transaction; the caller owns BEGIN/COMMIT/ROLLBACK.
async fn trim_tx(conn: &Connection, max_rows: u64) -> anyhow::Result<u64> {
    let row = conn
        .query("SELECT COUNT(*) FROM queue_items", ())
        .await
        .context("failed to count rows")?
        .next()
        .await
        .context("failed to read the count row")?
        .context("no count row returned")?;

    let total = row.get::<u64>(0).context("failed to read total count")?;

    if total <= max_rows {
        return Ok(0);
    }

    let excess = total - max_rows;

    let delete_query = "DELETE FROM queue_items
        WHERE id IN (SELECT id FROM queue_items ORDER BY id ASC LIMIT ?)";

    let removed = conn
        .execute(delete_query, [i64::try_from(excess).unwrap_or(i64::MAX)])
        .await
        .context("failed to delete excess rows")?;

    Ok(removed)
}

fn repeat_qm(count: usize) -> String {
    let mut placeholders = "?,".repeat(count);
    placeholders.pop();
    placeholders
}

fn now_unix_ms() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(elapsed) => duration_millis(elapsed),
        // Clock before the epoch; treat as the epoch itself.
        Err(_) => 0,
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
