use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use liaison_core::domain::approval::{
    ApprovalAuditEvent, ApprovalId, ApprovalRequest, ApprovalStatus,
};
use liaison_core::domain::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStatus};
use liaison_core::domain::escalation::EscalationStatus;
use liaison_core::domain::session::{
    AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionId, SessionMessage,
};

use super::{
    ApprovalRepository, DailyUsage, DeadLetterRepository, RepositoryError, SessionRepository,
    UsageRepository,
};

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, AgentSession>>,
    messages: RwLock<Vec<SessionMessage>>,
    usage: RwLock<HashMap<(String, NaiveDate), DailyUsage>>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<AgentSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn find_by_key(
        &self,
        agent_id: &AgentId,
        channel: ChannelKind,
        contact_id: &ContactId,
    ) -> Result<Option<AgentSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| {
                session.agent_id == *agent_id
                    && session.channel == channel
                    && session.contact_id == *contact_id
            })
            .max_by_key(|session| session.created_at)
            .cloned())
    }

    async fn save(&self, session: AgentSession) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.0.clone(), session);
        Ok(())
    }

    async fn save_if_version(
        &self,
        session: &AgentSession,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id.0) {
            Some(stored) if stored.state_version == expected_version => {
                let mut updated = session.clone();
                updated.state_version = expected_version + 1;
                sessions.insert(updated.id.0.clone(), updated);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_message(&self, message: SessionMessage) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        messages.push(message);
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        role: Option<MessageRole>,
        limit: u32,
    ) -> Result<Vec<SessionMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut matching: Vec<SessionMessage> = messages
            .iter()
            .filter(|message| {
                message.session_id == *session_id
                    && role.map_or(true, |role| message.role == role)
            })
            .cloned()
            .collect();

        let keep = matching.len().saturating_sub(limit as usize);
        matching.drain(..keep);
        Ok(matching)
    }

    async fn list_pending_escalations(
        &self,
        limit: u32,
    ) -> Result<Vec<AgentSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        let mut pending: Vec<AgentSession> = sessions
            .values()
            .filter(|session| {
                session
                    .escalation
                    .as_ref()
                    .is_some_and(|episode| episode.status == EscalationStatus::Pending)
            })
            .cloned()
            .collect();

        pending.sort_by(|left, right| left.updated_at.cmp(&right.updated_at));
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[async_trait::async_trait]
impl UsageRepository for InMemorySessionRepository {
    async fn add_usage(
        &self,
        _org_id: &OrgId,
        agent_id: &AgentId,
        day: NaiveDate,
        messages: u32,
        cost: Decimal,
    ) -> Result<(), RepositoryError> {
        let mut usage = self.usage.write().await;
        let entry = usage.entry((agent_id.0.clone(), day)).or_default();
        entry.message_count += messages;
        entry.cost += cost;
        Ok(())
    }

    async fn usage_for_day(
        &self,
        agent_id: &AgentId,
        day: NaiveDate,
    ) -> Result<DailyUsage, RepositoryError> {
        let usage = self.usage.read().await;
        Ok(usage.get(&(agent_id.0.clone(), day)).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRepository {
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
    audit_log: RwLock<Vec<ApprovalAuditEvent>>,
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.get(&id.0).cloned())
    }

    async fn save(&self, approval: ApprovalRequest) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        approvals.insert(approval.id.0.clone(), approval);
        Ok(())
    }

    async fn list_pending_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let approvals = self.approvals.read().await;
        let mut pending: Vec<ApprovalRequest> = approvals
            .values()
            .filter(|approval| {
                approval.session_id == *session_id && approval.status == ApprovalStatus::Pending
            })
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.requested_at.cmp(&right.requested_at));
        Ok(pending)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let approvals = self.approvals.read().await;
        let mut expired: Vec<ApprovalRequest> = approvals
            .values()
            .filter(|approval| {
                approval.status == ApprovalStatus::Pending && approval.expires_at <= now
            })
            .cloned()
            .collect();
        expired.sort_by(|left, right| left.expires_at.cmp(&right.expires_at));
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn append_audit(&self, event: ApprovalAuditEvent) -> Result<(), RepositoryError> {
        let mut audit_log = self.audit_log.write().await;
        audit_log.push(event);
        Ok(())
    }

    async fn audit_trail(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalAuditEvent>, RepositoryError> {
        let audit_log = self.audit_log.read().await;
        Ok(audit_log
            .iter()
            .filter(|event| event.approval_id == *approval_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    entries: RwLock<HashMap<String, DeadLetterEntry>>,
}

#[async_trait::async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn find_by_id(
        &self,
        id: &DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&id.0).cloned())
    }

    async fn save(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.id.0.clone(), entry);
        Ok(())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut due: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|entry| {
                entry.status == DeadLetterStatus::Queued && entry.next_retry_at <= now
            })
            .cloned()
            .collect();
        due.sort_by(|left, right| left.next_retry_at.cmp(&right.next_retry_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete(&self, id: &DeadLetterId) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.remove(&id.0);
        Ok(())
    }
}
