//! Store operations (§4.1). Every public method here is one serializable transaction on the
//! writer pool; reads for the operator CLI go through the reader pool instead.

use anyhow::Context;
use bridge_core::{ArchivedMessage, DataType, Destination, Message, MetricPoint, NewMessage, Priority, Source, Status};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use crate::pool::StorePools;

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    source: String,
    destination: String,
    topic_or_node: String,
    value: String,
    data_type: String,
    status: String,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    created_at: i64,
    processed_at: Option<i64>,
    expire_at: i64,
    lease_owner: Option<String>,
    lease_deadline: Option<i64>,
    last_error: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> anyhow::Result<Message> {
        Ok(Message {
            id: self.id,
            source: parse_source(&self.source)?,
            destination: parse_destination(&self.destination)?,
            topic_or_node: self.topic_or_node,
            value: self.value,
            data_type: DataType::from_str(&self.data_type).map_err(anyhow::Error::msg)?,
            status: Status::from_str(&self.status).map_err(anyhow::Error::msg)?,
            priority: Priority::from_i32(self.priority as i32)
                .with_context(|| format!("invalid priority {}", self.priority))?,
            retry_count: self.retry_count as i32,
            max_retries: self.max_retries as i32,
            created_at: from_millis(self.created_at),
            processed_at: self.processed_at.map(from_millis),
            expire_at: from_millis(self.expire_at),
            lease_owner: self.lease_owner,
            lease_deadline: self.lease_deadline.map(from_millis),
            last_error: self.last_error,
        })
    }
}

fn parse_source(s: &str) -> anyhow::Result<Source> {
    Ok(match s {
        "mqtt" => Source::Mqtt,
        "opcua" => Source::Opcua,
        "sap" => Source::Sap,
        "internal" => Source::Internal,
        other => anyhow::bail!("unknown source: {other}"),
    })
}

fn parse_destination(s: &str) -> anyhow::Result<Destination> {
    Ok(match s {
        "mqtt" => Destination::Mqtt,
        "opcua" => Destination::Opcua,
        "sap" => Destination::Sap,
        other => anyhow::bail!("unknown destination: {other}"),
    })
}

fn source_str(s: Source) -> &'static str {
    match s {
        Source::Mqtt => "mqtt",
        Source::Opcua => "opcua",
        Source::Sap => "sap",
        Source::Internal => "internal",
    }
}

fn destination_str(d: Destination) -> &'static str {
    match d {
        Destination::Mqtt => "mqtt",
        Destination::Opcua => "opcua",
        Destination::Sap => "sap",
    }
}

#[derive(Clone)]
pub struct Store {
    pools: StorePools,
}

impl Store {
    pub fn new(pools: StorePools) -> Self {
        Self { pools }
    }

    /// `insert(message) -> id` (§4.1). When `new_message.coalesce` is set and a `pending` row
    /// already exists for `(destination, topic_or_node)` at the same priority, that row's
    /// value is replaced and its `created_at` refreshed instead of inserting a duplicate
    /// (§4.2 Coalescing).
    pub async fn insert(&self, new_message: &NewMessage) -> anyhow::Result<i64> {
        let mut tx = self.pools.writer.begin().await.context("begin insert tx")?;
        let now = Utc::now();
        let now_ms = to_millis(now);

        if new_message.coalesce {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM messages
                 WHERE destination = ?1 AND topic_or_node = ?2 AND status = 'pending' AND priority = ?3
                 LIMIT 1",
            )
            .bind(destination_str(new_message.destination))
            .bind(&new_message.topic_or_node)
            .bind(new_message.priority.as_i32())
            .fetch_optional(&mut *tx)
            .await
            .context("lookup coalesce target")?;

            if let Some(id) = existing {
                sqlx::query("UPDATE messages SET value = ?1, created_at = ?2 WHERE id = ?3")
                    .bind(&new_message.value)
                    .bind(now_ms)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("coalesce update")?;
                tx.commit().await.context("commit coalesce tx")?;
                return Ok(id);
            }
        }

        let expire_at_ms = to_millis(now + new_message.ttl);
        let result = sqlx::query(
            "INSERT INTO messages (
                source, destination, topic_or_node, value, data_type, status, priority,
                retry_count, max_retries, created_at, next_attempt_at, expire_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?8, ?9)",
        )
        .bind(source_str(new_message.source))
        .bind(destination_str(new_message.destination))
        .bind(&new_message.topic_or_node)
        .bind(&new_message.value)
        .bind(new_message.data_type.to_string())
        .bind(new_message.priority.as_i32())
        .bind(new_message.max_retries)
        .bind(now_ms)
        .bind(expire_at_ms)
        .execute(&mut *tx)
        .await
        .context("insert message")?;

        tx.commit().await.context("commit insert tx")?;
        Ok(result.last_insert_rowid())
    }

    /// `claim(limit, worker_id, lease_duration) -> [messages]` (§4.1). Runs on the single
    /// writer connection, so the `SELECT` + `UPDATE` pair is immune to lost-update races
    /// across workers without needing `SELECT ... FOR UPDATE SKIP LOCKED` (SQLite has none).
    pub async fn claim(
        &self,
        limit: i64,
        worker_id: &str,
        lease_duration: Duration,
    ) -> anyhow::Result<Vec<Message>> {
        let mut tx = self.pools.writer.begin().await.context("begin claim tx")?;
        let now = Utc::now();
        let now_ms = to_millis(now);
        let lease_deadline_ms = to_millis(now + chrono::Duration::from_std(lease_duration)?);

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM messages
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY priority ASC, created_at ASC
             LIMIT ?2",
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("select claimable")?;

        if ids.is_empty() {
            tx.commit().await.ok();
            return Ok(Vec::new());
        }

        for id in &ids {
            sqlx::query(
                "UPDATE messages SET status = 'processing', lease_owner = ?1, lease_deadline = ?2
                 WHERE id = ?3",
            )
            .bind(worker_id)
            .bind(lease_deadline_ms)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("mark claimed")?;
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT id, source, destination, topic_or_node, value, data_type, status, priority,
                    retry_count, max_retries, created_at, processed_at, expire_at, lease_owner,
                    lease_deadline, last_error
             FROM messages WHERE id IN ({placeholders})
             ORDER BY priority ASC, created_at ASC"
        );
        let mut q = sqlx::query_as::<_, MessageRow>(&query);
        for id in &ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&mut *tx).await.context("fetch claimed rows")?;

        tx.commit().await.context("commit claim tx")?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// `complete(id)` (§4.1).
    pub async fn complete(&self, id: i64) -> anyhow::Result<()> {
        let now_ms = to_millis(Utc::now());
        sqlx::query("UPDATE messages SET status = 'completed', processed_at = ?1 WHERE id = ?2")
            .bind(now_ms)
            .bind(id)
            .execute(&self.pools.writer)
            .await
            .context("complete message")?;
        Ok(())
    }

    /// `fail_retry(id, error, backoff)` (§4.1). Returns `true` if the message was requeued,
    /// `false` if its retry budget was exhausted and it was archived as terminally `failed`.
    pub async fn fail_retry(&self, id: i64, error: &str, backoff: Duration) -> anyhow::Result<bool> {
        let mut tx = self.pools.writer.begin().await.context("begin fail_retry tx")?;

        let row = sqlx::query(
            "SELECT source, destination, topic_or_node, value, retry_count, max_retries
             FROM messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("fetch message for fail_retry")?;

        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;
        let next_retry_count = retry_count + 1;

        if next_retry_count <= max_retries {
            let now_ms = to_millis(Utc::now());
            let next_attempt_ms = to_millis(Utc::now() + chrono::Duration::from_std(backoff)?);
            sqlx::query(
                "UPDATE messages SET status = 'pending', retry_count = ?1, next_attempt_at = ?2,
                     lease_owner = NULL, lease_deadline = NULL, last_error = ?3
                 WHERE id = ?4",
            )
            .bind(next_retry_count)
            .bind(next_attempt_ms)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("requeue message")?;
            let _ = now_ms;
            tx.commit().await.context("commit fail_retry requeue")?;
            return Ok(true);
        }

        archive_and_finalize(&mut tx, id, &row, error, next_retry_count, "failed").await?;
        tx.commit().await.context("commit fail_retry archive")?;
        Ok(false)
    }

    /// Archives a message as `failed` unconditionally, ignoring its remaining retry budget
    /// (§4.6: a `Permanent` egress outcome archives regardless of budget).
    pub async fn fail_permanent(&self, id: i64, error: &str) -> anyhow::Result<()> {
        let mut tx = self.pools.writer.begin().await.context("begin fail_permanent tx")?;
        let row = sqlx::query(
            "SELECT source, destination, topic_or_node, value, retry_count, max_retries
             FROM messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("fetch message for fail_permanent")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        archive_and_finalize(&mut tx, id, &row, error, retry_count, "failed").await?;
        tx.commit().await.context("commit fail_permanent tx")?;
        Ok(())
    }

    /// `expire_due(now)` (§4.1). Sweeps rows past `expire_at` that are still non-terminal.
    pub async fn expire_due(&self) -> anyhow::Result<u64> {
        let mut tx = self.pools.writer.begin().await.context("begin expire_due tx")?;
        let now_ms = to_millis(Utc::now());

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM messages
             WHERE expire_at <= ?1 AND status IN ('pending', 'processing')",
        )
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await
        .context("select expired")?;

        for id in &ids {
            let row = sqlx::query(
                "SELECT source, destination, topic_or_node, value, retry_count, max_retries
                 FROM messages WHERE id = ?1",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("fetch message for expiry")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            archive_and_finalize(&mut tx, *id, &row, "ttl", retry_count, "expired").await?;
        }

        tx.commit().await.context("commit expire_due tx")?;
        Ok(ids.len() as u64)
    }

    /// `reclaim_stuck(now)` (§4.1). Returns abandoned leases to `pending`, bumping
    /// `retry_count`; a lease whose bumped `retry_count` would exceed `max_retries` is archived
    /// as `failed` instead, the same budget check `fail_retry` applies, so repeated sweeps of a
    /// permanently stuck message can't push `retry_count` past its budget while still `pending`
    /// (property 6 / §3.4).
    pub async fn reclaim_stuck(&self) -> anyhow::Result<u64> {
        let mut tx = self.pools.writer.begin().await.context("begin reclaim_stuck tx")?;
        let now_ms = to_millis(Utc::now());

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE status = 'processing' AND lease_deadline <= ?1",
        )
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await
        .context("select stuck leases")?;

        for id in &ids {
            let row = sqlx::query(
                "SELECT source, destination, topic_or_node, value, retry_count, max_retries
                 FROM messages WHERE id = ?1",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("fetch message for reclaim_stuck")?;

            let retry_count: i64 = row.try_get("retry_count")?;
            let max_retries: i64 = row.try_get("max_retries")?;
            let next_retry_count = retry_count + 1;

            if next_retry_count <= max_retries {
                sqlx::query(
                    "UPDATE messages SET status = 'pending', retry_count = ?1,
                         lease_owner = NULL, lease_deadline = NULL
                     WHERE id = ?2",
                )
                .bind(next_retry_count)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("requeue stuck lease")?;
            } else {
                archive_and_finalize(&mut tx, *id, &row, "lease expired, retry budget exhausted", next_retry_count, "failed")
                    .await?;
            }
        }

        tx.commit().await.context("commit reclaim_stuck tx")?;
        Ok(ids.len() as u64)
    }

    /// `cleanup(older_than)` (§4.1). Removes `completed` rows older than the retention cutoff.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let cutoff_ms = to_millis(older_than);
        let result = sqlx::query(
            "DELETE FROM messages WHERE status = 'completed' AND processed_at < ?1",
        )
        .bind(cutoff_ms)
        .execute(&self.pools.writer)
        .await
        .context("cleanup completed rows")?;
        Ok(result.rows_affected())
    }

    /// All `processing` rows back to `pending`, unconditionally, for operator recovery
    /// (§6.3 `reset`). `last_error` is left intact (§9 Open question).
    pub async fn reset_processing(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending', lease_owner = NULL, lease_deadline = NULL
             WHERE status = 'processing'",
        )
        .execute(&self.pools.writer)
        .await
        .context("reset processing rows")?;
        Ok(result.rows_affected())
    }

    pub async fn count_status(&self, status: Status) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = ?1")
            .bind(status.to_string())
            .fetch_one(&self.pools.reader)
            .await
            .context("count by status")?;
        Ok(count)
    }

    pub async fn record_metrics(&self, points: &[MetricPoint]) -> anyhow::Result<()> {
        let mut tx = self.pools.writer.begin().await.context("begin metrics tx")?;
        for p in points {
            sqlx::query(
                "INSERT INTO statistics (timestamp, metric_name, metric_value) VALUES (?1, ?2, ?3)",
            )
            .bind(to_millis(p.timestamp))
            .bind(&p.metric_name)
            .bind(p.metric_value)
            .execute(&mut *tx)
            .await
            .context("insert metric point")?;
        }
        tx.commit().await.context("commit metrics tx")?;
        Ok(())
    }

    /// Latest value for each metric name (§6.3 `stats`).
    pub async fn latest_metrics(&self) -> anyhow::Result<Vec<MetricPoint>> {
        let rows = sqlx::query(
            "SELECT s.timestamp, s.metric_name, s.metric_value
             FROM statistics s
             INNER JOIN (
                 SELECT metric_name, MAX(timestamp) AS ts FROM statistics GROUP BY metric_name
             ) latest ON latest.metric_name = s.metric_name AND latest.ts = s.timestamp",
        )
        .fetch_all(&self.pools.reader)
        .await
        .context("fetch latest metrics")?;

        rows.into_iter()
            .map(|row| {
                Ok(MetricPoint {
                    timestamp: from_millis(row.try_get::<i64, _>("timestamp")?),
                    metric_name: row.try_get("metric_name")?,
                    metric_value: row.try_get("metric_value")?,
                })
            })
            .collect()
    }

    /// Full metric history (§6.3 `export`).
    pub async fn metrics_history(&self) -> anyhow::Result<Vec<MetricPoint>> {
        let rows = sqlx::query(
            "SELECT timestamp, metric_name, metric_value FROM statistics ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pools.reader)
        .await
        .context("fetch metric history")?;

        rows.into_iter()
            .map(|row| {
                Ok(MetricPoint {
                    timestamp: from_millis(row.try_get::<i64, _>("timestamp")?),
                    metric_name: row.try_get("metric_name")?,
                    metric_value: row.try_get("metric_value")?,
                })
            })
            .collect()
    }

    /// Oldest N `pending` rows (§6.3 `pending`).
    pub async fn query_pending(&self, limit: i64) -> anyhow::Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, source, destination, topic_or_node, value, data_type, status, priority,
                    retry_count, max_retries, created_at, processed_at, expire_at, lease_owner,
                    lease_deadline, last_error
             FROM messages WHERE status = 'pending'
             ORDER BY priority ASC, created_at ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pools.reader)
        .await
        .context("query pending")?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Newest N archive rows (§6.3 `failed`).
    pub async fn query_failed(&self, limit: i64) -> anyhow::Result<Vec<ArchivedMessage>> {
        let rows = sqlx::query(
            "SELECT id, original_id, source, destination, topic_or_node, value, error_message,
                    failed_at, retry_count
             FROM failed_messages ORDER BY failed_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pools.reader)
        .await
        .context("query failed archive")?;

        rows.into_iter()
            .map(|row| {
                Ok(ArchivedMessage {
                    id: row.try_get("id")?,
                    original_id: row.try_get("original_id")?,
                    source: parse_source(&row.try_get::<String, _>("source")?)?,
                    destination: parse_destination(&row.try_get::<String, _>("destination")?)?,
                    topic_or_node: row.try_get("topic_or_node")?,
                    value: row.try_get("value")?,
                    error_message: row.try_get("error_message")?,
                    failed_at: from_millis(row.try_get::<i64, _>("failed_at")?),
                    retry_count: row.try_get("retry_count")?,
                })
            })
            .collect()
    }

    pub fn reader_pool(&self) -> &sqlx::SqlitePool {
        &self.pools.reader
    }
}

async fn archive_and_finalize(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
    row: &sqlx::sqlite::SqliteRow,
    error: &str,
    retry_count: i64,
    terminal_status: &str,
) -> anyhow::Result<()> {
    let source: String = row.try_get("source")?;
    let destination: String = row.try_get("destination")?;
    let topic_or_node: String = row.try_get("topic_or_node")?;
    let value: String = row.try_get("value")?;
    let now_ms = to_millis(Utc::now());

    sqlx::query(
        "INSERT INTO failed_messages (
            original_id, source, destination, topic_or_node, value, error_message,
            failed_at, retry_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(id)
    .bind(&source)
    .bind(&destination)
    .bind(&topic_or_node)
    .bind(&value)
    .bind(error)
    .bind(now_ms)
    .bind(retry_count)
    .execute(&mut **tx)
    .await
    .context("insert archive row")?;

    sqlx::query(
        "UPDATE messages SET status = ?1, retry_count = ?2, lease_owner = NULL,
             lease_deadline = NULL, last_error = ?3, processed_at = ?4
         WHERE id = ?5",
    )
    .bind(terminal_status)
    .bind(retry_count)
    .bind(error)
    .bind(now_ms)
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("finalize message row")?;

    Ok(())
}
