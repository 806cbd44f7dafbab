use chrono::{DateTime, Utc};
use sqlx::Row;

use liaison_core::domain::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStatus};
use liaison_core::domain::session::{ChannelKind, ContactId, OrgId, SessionId};

use super::{DeadLetterRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDeadLetterRepository {
    pool: DbPool,
}

impl SqlDeadLetterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp '{value}': {e}")))
}

fn decode<T>(result: Result<T, sqlx::Error>) -> Result<T, RepositoryError> {
    result.map_err(|e| RepositoryError::Decode(e.to_string()))
}

const DEAD_LETTER_COLUMNS: &str = "id, org_id, channel, recipient, content, session_id, status,
        attempts, last_error, first_attempt_at, last_attempt_at, next_retry_at";

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetterEntry, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let org_id: String = decode(row.try_get("org_id"))?;
    let channel_str: String = decode(row.try_get("channel"))?;
    let recipient: String = decode(row.try_get("recipient"))?;
    let content: String = decode(row.try_get("content"))?;
    let session_id: Option<String> = decode(row.try_get("session_id"))?;
    let status_str: String = decode(row.try_get("status"))?;
    let attempts: i64 = decode(row.try_get("attempts"))?;
    let last_error: String = decode(row.try_get("last_error"))?;
    let first_attempt_at_str: String = decode(row.try_get("first_attempt_at"))?;
    let last_attempt_at_str: String = decode(row.try_get("last_attempt_at"))?;
    let next_retry_at_str: String = decode(row.try_get("next_retry_at"))?;

    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel '{channel_str}'")))?;
    let status = DeadLetterStatus::parse(&status_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown dead letter status '{status_str}'"))
    })?;

    Ok(DeadLetterEntry {
        id: DeadLetterId(id),
        org_id: OrgId(org_id),
        channel,
        recipient: ContactId(recipient),
        content,
        session_id: session_id.map(SessionId),
        status,
        attempts: attempts as u32,
        last_error,
        first_attempt_at: parse_timestamp(&first_attempt_at_str)?,
        last_attempt_at: parse_timestamp(&last_attempt_at_str)?,
        next_retry_at: parse_timestamp(&next_retry_at_str)?,
    })
}

#[async_trait::async_trait]
impl DeadLetterRepository for SqlDeadLetterRepository {
    async fn find_by_id(
        &self,
        id: &DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_queue WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_entry(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dead_letter_queue (id, org_id, channel, recipient, content, session_id,
                                            status, attempts, last_error, first_attempt_at,
                                            last_attempt_at, next_retry_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 attempts = excluded.attempts,
                 last_error = excluded.last_error,
                 last_attempt_at = excluded.last_attempt_at,
                 next_retry_at = excluded.next_retry_at",
        )
        .bind(&entry.id.0)
        .bind(&entry.org_id.0)
        .bind(entry.channel.as_str())
        .bind(&entry.recipient.0)
        .bind(&entry.content)
        .bind(entry.session_id.as_ref().map(|id| id.0.clone()))
        .bind(entry.status.as_str())
        .bind(entry.attempts as i64)
        .bind(&entry.last_error)
        .bind(entry.first_attempt_at.to_rfc3339())
        .bind(entry.last_attempt_at.to_rfc3339())
        .bind(entry.next_retry_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_queue
             WHERE status = 'queued' AND next_retry_at <= ?
             ORDER BY next_retry_at ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()
    }

    async fn delete(&self, id: &DeadLetterId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM dead_letter_queue WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
