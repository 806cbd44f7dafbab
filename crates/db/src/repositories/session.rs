use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use liaison_core::domain::escalation::EscalationState;
use liaison_core::domain::session::{
    AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionErrorState,
    SessionId, SessionMessage, SessionStatus, TeamState,
};

use super::{DailyUsage, RepositoryError, SessionRepository, UsageRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp '{value}': {e}")))
}

/// Costs are stored as integer micro-units so SQL can add them exactly.
fn cost_to_micros(cost: Decimal) -> Result<i64, RepositoryError> {
    use rust_decimal::prelude::ToPrimitive;

    (cost * Decimal::from(1_000_000i64))
        .round()
        .to_i64()
        .ok_or_else(|| RepositoryError::Decode(format!("cost out of range: {cost}")))
}

fn decode<T>(result: Result<T, sqlx::Error>) -> Result<T, RepositoryError> {
    result.map_err(|e| RepositoryError::Decode(e.to_string()))
}

const SESSION_COLUMNS: &str = "id, org_id, agent_id, channel, contact_id, status, error_state,
        escalation, team, uncertainty_count, previous_reply, state_version,
        created_at, updated_at";

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<AgentSession, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let org_id: String = decode(row.try_get("org_id"))?;
    let agent_id: String = decode(row.try_get("agent_id"))?;
    let channel_str: String = decode(row.try_get("channel"))?;
    let contact_id: String = decode(row.try_get("contact_id"))?;
    let status_str: String = decode(row.try_get("status"))?;
    let error_state_json: String = decode(row.try_get("error_state"))?;
    let escalation_json: Option<String> = decode(row.try_get("escalation"))?;
    let team_json: Option<String> = decode(row.try_get("team"))?;
    let uncertainty_count: i64 = decode(row.try_get("uncertainty_count"))?;
    let previous_reply: Option<String> = decode(row.try_get("previous_reply"))?;
    let state_version: i64 = decode(row.try_get("state_version"))?;
    let created_at_str: String = decode(row.try_get("created_at"))?;
    let updated_at_str: String = decode(row.try_get("updated_at"))?;

    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel '{channel_str}'")))?;
    let status = SessionStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown session status '{status_str}'")))?;
    let error_state: SessionErrorState = serde_json::from_str(&error_state_json)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let escalation: Option<EscalationState> = escalation_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let team: Option<TeamState> = team_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AgentSession {
        id: SessionId(id),
        org_id: OrgId(org_id),
        agent_id: AgentId(agent_id),
        channel,
        contact_id: ContactId(contact_id),
        status,
        error_state,
        escalation,
        team,
        uncertainty_count: uncertainty_count as u32,
        previous_reply,
        state_version: state_version as u32,
        created_at: parse_timestamp(&created_at_str)?,
        updated_at: parse_timestamp(&updated_at_str)?,
    })
}

struct SessionColumns {
    error_state: String,
    escalation: Option<String>,
    escalation_status: Option<&'static str>,
    team: Option<String>,
}

fn encode_session(session: &AgentSession) -> Result<SessionColumns, RepositoryError> {
    let error_state = serde_json::to_string(&session.error_state)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let escalation = session
        .escalation
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let escalation_status =
        session.escalation.as_ref().map(|episode| episode.status.as_str());
    let team = session
        .team
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(SessionColumns { error_state, escalation, escalation_status, team })
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<AgentSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_session WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_session(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_key(
        &self,
        agent_id: &AgentId,
        channel: ChannelKind,
        contact_id: &ContactId,
    ) -> Result<Option<AgentSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_session
             WHERE agent_id = ? AND channel = ? AND contact_id = ?
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(&agent_id.0)
        .bind(channel.as_str())
        .bind(&contact_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_session(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: AgentSession) -> Result<(), RepositoryError> {
        let columns = encode_session(&session)?;

        sqlx::query(
            "INSERT INTO agent_session (id, org_id, agent_id, channel, contact_id, status,
                                        error_state, escalation, escalation_status, team,
                                        uncertainty_count, previous_reply, state_version,
                                        created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 error_state = excluded.error_state,
                 escalation = excluded.escalation,
                 escalation_status = excluded.escalation_status,
                 team = excluded.team,
                 uncertainty_count = excluded.uncertainty_count,
                 previous_reply = excluded.previous_reply,
                 state_version = excluded.state_version,
                 updated_at = excluded.updated_at",
        )
        .bind(&session.id.0)
        .bind(&session.org_id.0)
        .bind(&session.agent_id.0)
        .bind(session.channel.as_str())
        .bind(&session.contact_id.0)
        .bind(session.status.as_str())
        .bind(&columns.error_state)
        .bind(&columns.escalation)
        .bind(columns.escalation_status)
        .bind(&columns.team)
        .bind(session.uncertainty_count as i64)
        .bind(&session.previous_reply)
        .bind(session.state_version as i64)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_if_version(
        &self,
        session: &AgentSession,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let columns = encode_session(session)?;

        let result = sqlx::query(
            "UPDATE agent_session SET
                 status = ?,
                 error_state = ?,
                 escalation = ?,
                 escalation_status = ?,
                 team = ?,
                 uncertainty_count = ?,
                 previous_reply = ?,
                 state_version = ?,
                 updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(session.status.as_str())
        .bind(&columns.error_state)
        .bind(&columns.escalation)
        .bind(columns.escalation_status)
        .bind(&columns.team)
        .bind(session.uncertainty_count as i64)
        .bind(&session.previous_reply)
        .bind((expected_version + 1) as i64)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.id.0)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_message(&self, message: SessionMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO session_message (session_id, role, text, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&message.session_id.0)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        role: Option<MessageRole>,
        limit: u32,
    ) -> Result<Vec<SessionMessage>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some(role) = role {
            sqlx::query(
                "SELECT session_id, role, text, created_at FROM session_message
                 WHERE session_id = ? AND role = ?
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(&session_id.0)
            .bind(role.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT session_id, role, text, created_at FROM session_message
                 WHERE session_id = ?
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(&session_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        let mut messages = rows
            .iter()
            .map(|row| {
                let session_id: String = decode(row.try_get("session_id"))?;
                let role_str: String = decode(row.try_get("role"))?;
                let text: String = decode(row.try_get("text"))?;
                let created_at_str: String = decode(row.try_get("created_at"))?;

                let role = MessageRole::parse(&role_str).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown message role '{role_str}'"))
                })?;

                Ok(SessionMessage {
                    session_id: SessionId(session_id),
                    role,
                    text,
                    created_at: parse_timestamp(&created_at_str)?,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        messages.reverse();
        Ok(messages)
    }

    async fn list_pending_escalations(
        &self,
        limit: u32,
    ) -> Result<Vec<AgentSession>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_session
             WHERE escalation_status = 'pending'
             ORDER BY updated_at ASC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect::<Result<Vec<_>, _>>()
    }
}

#[async_trait::async_trait]
impl UsageRepository for SqlSessionRepository {
    async fn add_usage(
        &self,
        org_id: &OrgId,
        agent_id: &AgentId,
        day: NaiveDate,
        messages: u32,
        cost: Decimal,
    ) -> Result<(), RepositoryError> {
        // Single relative upsert; concurrent writers both land.
        sqlx::query(
            "INSERT INTO agent_daily_usage (org_id, agent_id, day, message_count, cost_micros)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(agent_id, day) DO UPDATE SET
                 message_count = agent_daily_usage.message_count + excluded.message_count,
                 cost_micros = agent_daily_usage.cost_micros + excluded.cost_micros",
        )
        .bind(&org_id.0)
        .bind(&agent_id.0)
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(messages as i64)
        .bind(cost_to_micros(cost)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn usage_for_day(
        &self,
        agent_id: &AgentId,
        day: NaiveDate,
    ) -> Result<DailyUsage, RepositoryError> {
        let row = sqlx::query(
            "SELECT message_count, cost_micros FROM agent_daily_usage
             WHERE agent_id = ? AND day = ?",
        )
        .bind(&agent_id.0)
        .bind(day.format("%Y-%m-%d").to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(DailyUsage::default());
        };

        let message_count: i64 = decode(row.try_get("message_count"))?;
        let cost_micros: i64 = decode(row.try_get("cost_micros"))?;

        Ok(DailyUsage {
            message_count: message_count as u32,
            cost: Decimal::new(cost_micros, 6),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use liaison_core::domain::escalation::{EscalationState, TriggerType, Urgency};
    use liaison_core::domain::session::{
        AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionId,
        SessionMessage,
    };

    use super::SqlSessionRepository;
    use crate::repositories::{RepositoryError, SessionRepository, UsageRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_session(id: &str) -> AgentSession {
        AgentSession::new(
            SessionId(id.to_string()),
            OrgId("org-1".to_string()),
            AgentId("agent-1".to_string()),
            ChannelKind::Whatsapp,
            ContactId("+15550001".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_and_find_round_trips_embedded_state() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);

        let mut session = sample_session("s-1");
        session.escalation = Some(EscalationState::new(
            TriggerType::NegativeSentiment,
            Urgency::High,
            "two angry messages",
            Utc::now(),
        ));
        session.error_state.failure_counts.insert("crm_update".to_string(), 2);
        session.uncertainty_count = 1;
        session.previous_reply = Some("Let me check.".to_string());

        repo.save(session.clone()).await.expect("save");
        let found = repo
            .find_by_id(&SessionId("s-1".to_string()))
            .await
            .expect("find")
            .expect("should exist");

        assert_eq!(found.id, session.id);
        assert_eq!(found.escalation.as_ref().map(|e| e.trigger), Some(TriggerType::NegativeSentiment));
        assert_eq!(found.error_state.failure_counts.get("crm_update"), Some(&2));
        assert_eq!(found.uncertainty_count, 1);
        assert_eq!(found.previous_reply.as_deref(), Some("Let me check."));
    }

    #[tokio::test]
    async fn find_by_key_returns_the_latest_session() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);

        let mut first = sample_session("s-1");
        first.created_at = Utc::now() - chrono::Duration::hours(2);
        repo.save(first).await.expect("save first");
        repo.save(sample_session("s-2")).await.expect("save second");

        let found = repo
            .find_by_key(
                &AgentId("agent-1".to_string()),
                ChannelKind::Whatsapp,
                &ContactId("+15550001".to_string()),
            )
            .await
            .expect("find")
            .expect("should exist");

        assert_eq!(found.id.0, "s-2");
    }

    #[tokio::test]
    async fn conditional_save_refuses_a_stale_version() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);

        let session = sample_session("s-1");
        repo.save(session.clone()).await.expect("save");

        let mut first_writer = session.clone();
        first_writer.uncertainty_count = 5;
        assert!(repo.save_if_version(&first_writer, 1).await.expect("first write"));

        let mut second_writer = session;
        second_writer.uncertainty_count = 9;
        assert!(
            !repo.save_if_version(&second_writer, 1).await.expect("second write"),
            "stale writer must lose"
        );

        let found = repo
            .find_by_id(&SessionId("s-1".to_string()))
            .await
            .expect("find")
            .expect("should exist");
        assert_eq!(found.uncertainty_count, 5);
        assert_eq!(found.state_version, 2);
    }

    #[tokio::test]
    async fn recent_messages_filters_by_role_and_keeps_order() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);
        repo.save(sample_session("s-1")).await.expect("save");

        let turns = [
            (MessageRole::Customer, "hello"),
            (MessageRole::Agent, "hi, how can I help?"),
            (MessageRole::Customer, "my order is late"),
            (MessageRole::Customer, "this is frustrating"),
        ];
        for (role, text) in turns {
            repo.append_message(SessionMessage {
                session_id: SessionId("s-1".to_string()),
                role,
                text: text.to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("append");
        }

        let customer = repo
            .recent_messages(&SessionId("s-1".to_string()), Some(MessageRole::Customer), 2)
            .await
            .expect("recent");
        assert_eq!(customer.len(), 2);
        assert_eq!(customer[0].text, "my order is late");
        assert_eq!(customer[1].text, "this is frustrating");

        let all = repo
            .recent_messages(&SessionId("s-1".to_string()), None, 10)
            .await
            .expect("all");
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].text, "hello");
    }

    #[tokio::test]
    async fn pending_escalations_listing_skips_terminal_episodes() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);

        let mut pending = sample_session("s-pending");
        pending.escalation = Some(EscalationState::new(
            TriggerType::ExplicitRequest,
            Urgency::Normal,
            "asked for a human",
            Utc::now(),
        ));
        repo.save(pending).await.expect("save pending");

        let mut resolved = sample_session("s-resolved");
        let mut episode = EscalationState::new(
            TriggerType::Uncertainty,
            Urgency::Low,
            "unsure",
            Utc::now(),
        );
        episode.status = liaison_core::domain::escalation::EscalationStatus::Resolved;
        resolved.escalation = Some(episode);
        repo.save(resolved).await.expect("save resolved");

        repo.save(sample_session("s-none")).await.expect("save plain");

        let listed = repo.list_pending_escalations(10).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.0, "s-pending");
    }

    #[tokio::test]
    async fn daily_usage_accumulates_messages_and_cost() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);
        let agent = AgentId("agent-1".to_string());
        let org = OrgId("org-1".to_string());
        let day = Utc::now().date_naive();

        let empty = repo.usage_for_day(&agent, day).await.expect("empty");
        assert_eq!(empty.message_count, 0);
        assert_eq!(empty.cost, Decimal::ZERO);

        repo.add_usage(&org, &agent, day, 1, Decimal::new(25, 3)).await.expect("first");
        repo.add_usage(&org, &agent, day, 2, Decimal::new(50, 3)).await.expect("second");

        let usage = repo.usage_for_day(&agent, day).await.expect("usage");
        assert_eq!(usage.message_count, 3);
        assert_eq!(usage.cost, Decimal::new(75, 3));
    }

    #[tokio::test]
    async fn interleaved_usage_writes_both_land() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool);
        let agent = AgentId("agent-1".to_string());
        let org = OrgId("org-1".to_string());
        let day = Utc::now().date_naive();

        let (first, second) = tokio::join!(
            repo.add_usage(&org, &agent, day, 1, Decimal::new(25, 3)),
            repo.add_usage(&org, &agent, day, 1, Decimal::new(50, 3)),
        );
        first.expect("first");
        second.expect("second");

        let usage = repo.usage_for_day(&agent, day).await.expect("usage");
        assert_eq!(usage.message_count, 2);
        assert_eq!(usage.cost, Decimal::new(75, 3), "neither cost update may be lost");
    }

    #[tokio::test]
    async fn corrupt_timestamps_surface_as_decode_errors() {
        let pool = setup().await;
        let repo = SqlSessionRepository::new(pool.clone());
        repo.save(sample_session("s-1")).await.expect("save");

        sqlx::query("UPDATE agent_session SET updated_at = 'last tuesday' WHERE id = 's-1'")
            .execute(&pool)
            .await
            .expect("corrupt row");

        let error = repo
            .find_by_id(&SessionId("s-1".to_string()))
            .await
            .expect_err("corrupt row must not decode");
        assert!(matches!(error, RepositoryError::Decode(_)));
    }
}
