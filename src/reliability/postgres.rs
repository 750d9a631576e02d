//! # Postgres-backed outbox/inbox (§1, §6)
//!
//! The named-in-scope "Postgres reliability-substrate adapter" exercising the
//! outbox/inbox contract against a real durable store. Schema (kept outside
//! this crate — migration DDL text generation is explicitly out of scope):
//!
//! ```sql
//! create table taskforge_outbox (
//!   id uuid primary key,
//!   task_message jsonb not null,
//!   status text not null,
//!   sequence_number bigint not null,
//!   attempts integer not null default 0,
//!   last_error text,
//!   next_attempt_at timestamptz not null,
//!   created_at timestamptz not null,
//!   updated_at timestamptz not null
//! );
//! create index on taskforge_outbox (status, sequence_number) where status = 'pending';
//!
//! create table taskforge_inbox (
//!   message_id uuid primary key,
//!   processed_at timestamptz not null
//! );
//! create index on taskforge_inbox (processed_at);
//! ```
//!
//! `sequence_number` is assigned from a Postgres sequence rather than
//! `AtomicI64` so ordering survives process restarts, mirroring how the
//! reference engine hands total ordering off to the database instead of
//! keeping it in process memory.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReliabilityError;
use crate::model::{InboxEntry, OutboxEntry, OutboxStatus, TaskMessage};

use super::inbox::InboxStore;
use super::outbox::OutboxStore;

fn db_err(err: sqlx::Error) -> ReliabilityError {
    ReliabilityError::Database(err.to_string())
}

/// A Postgres-backed [`OutboxStore`]. `append` is meant to run inside the
/// same transaction as the caller's own side-effecting write, via
/// `append_in`; `append` itself opens and commits a single-statement
/// transaction for callers with no surrounding one.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append `task_message` as part of an already-open transaction,
    /// achieving the "outbox write commits atomically with the caller's own
    /// state change" guarantee from §4.6.
    pub async fn append_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_message: TaskMessage,
    ) -> Result<OutboxEntry, ReliabilityError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let row = sqlx::query_as::<_, (i64,)>(
            "select nextval('taskforge_outbox_sequence_number_seq')",
        )
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        let sequence_number = row.0;

        let task_message_json =
            serde_json::to_value(&task_message).map_err(|e| ReliabilityError::Database(e.to_string()))?;

        sqlx::query(
            "insert into taskforge_outbox \
             (id, task_message, status, sequence_number, attempts, last_error, next_attempt_at, created_at, updated_at) \
             values ($1, $2, 'pending', $3, 0, null, $4, $4, $4)",
        )
        .bind(id)
        .bind(task_message_json)
        .bind(sequence_number)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(OutboxEntry {
            id,
            task_message,
            status: OutboxStatus::Pending,
            sequence_number,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, task_message: TaskMessage) -> Result<OutboxEntry, ReliabilityError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let entry = self.append_in(&mut tx, task_message).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(entry)
    }

    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEntry>, ReliabilityError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "select id, task_message, status, sequence_number, attempts, last_error, created_at, updated_at \
             from taskforge_outbox \
             where status = 'pending' and next_attempt_at <= now() \
             order by sequence_number asc \
             limit $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(OutboxRow::try_into_entry).collect()
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), ReliabilityError> {
        sqlx::query("update taskforge_outbox set status = 'dispatched', updated_at = now() where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        error: String,
        max_retries: u32,
        backoff: std::time::Duration,
    ) -> Result<(), ReliabilityError> {
        let row = sqlx::query_as::<_, (i32,)>("select attempts from taskforge_outbox where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some((attempts,)) = row else {
            return Ok(());
        };
        let attempts = (attempts as u32) + 1;

        if attempts >= max_retries {
            sqlx::query(
                "update taskforge_outbox set status = 'failed', attempts = $2, last_error = $3, updated_at = now() where id = $1",
            )
            .bind(id)
            .bind(attempts as i32)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        } else {
            let delay = backoff.saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)));
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            sqlx::query(
                "update taskforge_outbox set attempts = $2, last_error = $3, next_attempt_at = now() + $4, updated_at = now() where id = $1",
            )
            .bind(id)
            .bind(attempts as i32)
            .bind(error)
            .bind(delay)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    task_message: serde_json::Value,
    status: String,
    sequence_number: i64,
    attempts: i32,
    last_error: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl OutboxRow {
    fn try_into_entry(self) -> Result<OutboxEntry, ReliabilityError> {
        let task_message: TaskMessage = serde_json::from_value(self.task_message)
            .map_err(|e| ReliabilityError::Database(e.to_string()))?;
        let status = match self.status.as_str() {
            "pending" => OutboxStatus::Pending,
            "dispatched" => OutboxStatus::Dispatched,
            "failed" => OutboxStatus::Failed,
            other => {
                return Err(ReliabilityError::Database(format!(
                    "unrecognized outbox status '{other}'"
                )))
            }
        };
        Ok(OutboxEntry {
            id: self.id,
            task_message,
            status,
            sequence_number: self.sequence_number,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// A Postgres-backed [`InboxStore`].
#[derive(Debug, Clone)]
pub struct PostgresInboxStore {
    pool: PgPool,
}

impl PostgresInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Mark `message_id` processed as part of an already-open transaction,
    /// so the idempotent-receive row commits atomically with the task's own
    /// side effect (§4.6's "effectively-once" guarantee).
    pub async fn mark_processed_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        message_id: Uuid,
    ) -> Result<(), ReliabilityError> {
        sqlx::query(
            "insert into taskforge_inbox (message_id, processed_at) values ($1, now()) \
             on conflict (message_id) do nothing",
        )
        .bind(message_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for PostgresInboxStore {
    async fn is_processed(&self, message_id: Uuid) -> Result<bool, ReliabilityError> {
        let row = sqlx::query_as::<_, (i64,)>("select count(*) from taskforge_inbox where message_id = $1")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.0 > 0)
    }

    async fn mark_processed(&self, message_id: Uuid) -> Result<(), ReliabilityError> {
        sqlx::query(
            "insert into taskforge_inbox (message_id, processed_at) values ($1, now()) \
             on conflict (message_id) do nothing",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_entry_round_trips(_: InboxEntry) {}

#[cfg(test)]
mod tests {
    //! These exercise SQL shape only; they require a live Postgres and are
    //! `#[ignore]`d by default. Run with `DATABASE_URL` set and
    //! `cargo test -- --ignored` against a schema carrying the tables
    //! documented at the top of this file.
    use super::*;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
        PgPool::connect(&url).await.expect("failed to connect")
    }

    #[tokio::test]
    #[ignore]
    async fn append_then_fetch_ready_round_trips() {
        let store = PostgresOutboxStore::new(pool().await);
        let msg = TaskMessage::new("emails.send", "celery", vec![1, 2, 3]);
        let entry = store.append(msg).await.unwrap();
        let ready = store.fetch_ready(10).await.unwrap();
        assert!(ready.iter().any(|e| e.id == entry.id));
    }

    #[tokio::test]
    #[ignore]
    async fn mark_processed_then_is_processed_true() {
        let store = PostgresInboxStore::new(pool().await);
        let id = Uuid::now_v7();
        assert!(!store.is_processed(id).await.unwrap());
        store.mark_processed(id).await.unwrap();
        assert!(store.is_processed(id).await.unwrap());
    }
}
