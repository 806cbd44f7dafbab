use chrono::{DateTime, Utc};
use sqlx::Row;

use liaison_core::domain::approval::{
    ApprovalAuditEvent, ApprovalId, ApprovalRequest, ApprovalStatus,
};
use liaison_core::domain::session::{AgentId, OrgId, SessionId};

use super::{ApprovalRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
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

fn parse_status(value: &str) -> Result<ApprovalStatus, RepositoryError> {
    ApprovalStatus::parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status '{value}'")))
}

const APPROVAL_COLUMNS: &str = "id, org_id, agent_id, session_id, action_kind, payload_json,
        status, requested_at, expires_at, resolved_by, resolved_at, resolution_note, result_json";

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let org_id: String = decode(row.try_get("org_id"))?;
    let agent_id: String = decode(row.try_get("agent_id"))?;
    let session_id: String = decode(row.try_get("session_id"))?;
    let action_kind: String = decode(row.try_get("action_kind"))?;
    let payload_json: String = decode(row.try_get("payload_json"))?;
    let status_str: String = decode(row.try_get("status"))?;
    let requested_at_str: String = decode(row.try_get("requested_at"))?;
    let expires_at_str: String = decode(row.try_get("expires_at"))?;
    let resolved_by: Option<String> = decode(row.try_get("resolved_by"))?;
    let resolved_at_str: Option<String> = decode(row.try_get("resolved_at"))?;
    let resolution_note: Option<String> = decode(row.try_get("resolution_note"))?;
    let result_json: Option<String> = decode(row.try_get("result_json"))?;

    Ok(ApprovalRequest {
        id: ApprovalId(id),
        org_id: OrgId(org_id),
        agent_id: AgentId(agent_id),
        session_id: SessionId(session_id),
        action_kind,
        payload_json,
        status: parse_status(&status_str)?,
        requested_at: parse_timestamp(&requested_at_str)?,
        expires_at: parse_timestamp(&expires_at_str)?,
        resolved_by,
        resolved_at: resolved_at_str.as_deref().map(parse_timestamp).transpose()?,
        resolution_note,
        result_json,
    })
}

fn row_to_audit_event(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalAuditEvent, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let approval_id: String = decode(row.try_get("approval_id"))?;
    let from_status_str: Option<String> = decode(row.try_get("from_status"))?;
    let to_status_str: String = decode(row.try_get("to_status"))?;
    let actor: String = decode(row.try_get("actor"))?;
    let note: Option<String> = decode(row.try_get("note"))?;
    let payload_hash: String = decode(row.try_get("payload_hash"))?;
    let occurred_at_str: String = decode(row.try_get("occurred_at"))?;

    Ok(ApprovalAuditEvent {
        id,
        approval_id: ApprovalId(approval_id),
        from_status: from_status_str.as_deref().map(parse_status).transpose()?,
        to_status: parse_status(&to_status_str)?,
        actor,
        note,
        payload_hash,
        occurred_at: parse_timestamp(&occurred_at_str)?,
    })
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_request WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, approval: ApprovalRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_request (id, org_id, agent_id, session_id, action_kind,
                                           payload_json, status, requested_at, expires_at,
                                           resolved_by, resolved_at, resolution_note, result_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 expires_at = excluded.expires_at,
                 resolved_by = excluded.resolved_by,
                 resolved_at = excluded.resolved_at,
                 resolution_note = excluded.resolution_note,
                 result_json = excluded.result_json",
        )
        .bind(&approval.id.0)
        .bind(&approval.org_id.0)
        .bind(&approval.agent_id.0)
        .bind(&approval.session_id.0)
        .bind(&approval.action_kind)
        .bind(&approval.payload_json)
        .bind(approval.status.as_str())
        .bind(approval.requested_at.to_rfc3339())
        .bind(approval.expires_at.to_rfc3339())
        .bind(&approval.resolved_by)
        .bind(approval.resolved_at.map(|dt| dt.to_rfc3339()))
        .bind(&approval.resolution_note)
        .bind(&approval.result_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_pending_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_request
             WHERE session_id = ? AND status = 'pending'
             ORDER BY requested_at ASC"
        ))
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect::<Result<Vec<_>, _>>()
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_request
             WHERE status = 'pending' AND expires_at <= ?
             ORDER BY expires_at ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect::<Result<Vec<_>, _>>()
    }

    async fn append_audit(&self, event: ApprovalAuditEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_audit_log (id, approval_id, from_status, to_status, actor,
                                             note, payload_hash, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.approval_id.0)
        .bind(event.from_status.map(|status| status.as_str()))
        .bind(event.to_status.as_str())
        .bind(&event.actor)
        .bind(&event.note)
        .bind(&event.payload_hash)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn audit_trail(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalAuditEvent>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, approval_id, from_status, to_status, actor, note, payload_hash,
                    occurred_at
             FROM approval_audit_log
             WHERE approval_id = ?
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(&approval_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit_event).collect::<Result<Vec<_>, _>>()
    }
}
