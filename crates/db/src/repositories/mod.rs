use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use liaison_core::domain::approval::{ApprovalAuditEvent, ApprovalId, ApprovalRequest};
use liaison_core::domain::dead_letter::{DeadLetterEntry, DeadLetterId};
use liaison_core::domain::session::{
    AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionId, SessionMessage,
};

pub mod approval;
pub mod dead_letter;
pub mod memory;
pub mod session;

pub use approval::SqlApprovalRepository;
pub use dead_letter::SqlDeadLetterRepository;
pub use memory::{
    InMemoryApprovalRepository, InMemoryDeadLetterRepository, InMemorySessionRepository,
};
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<AgentSession>, RepositoryError>;

    /// Latest session for a (agent, channel, contact) triple.
    async fn find_by_key(
        &self,
        agent_id: &AgentId,
        channel: ChannelKind,
        contact_id: &ContactId,
    ) -> Result<Option<AgentSession>, RepositoryError>;

    async fn save(&self, session: AgentSession) -> Result<(), RepositoryError>;

    /// Conditional write for state that concurrent actors race on
    /// (escalation quick actions vs. sweeps). Persists the session with
    /// its version bumped to `expected_version + 1`, but only if the
    /// stored row still carries `expected_version`; returns false when
    /// another writer got there first.
    async fn save_if_version(
        &self,
        session: &AgentSession,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn append_message(&self, message: SessionMessage) -> Result<(), RepositoryError>;

    /// The most recent messages of a session in chronological order,
    /// optionally restricted to one role.
    async fn recent_messages(
        &self,
        session_id: &SessionId,
        role: Option<MessageRole>,
        limit: u32,
    ) -> Result<Vec<SessionMessage>, RepositoryError>;

    /// Sessions whose escalation episode is still pending, oldest first.
    /// Feeds the expiry sweep.
    async fn list_pending_escalations(
        &self,
        limit: u32,
    ) -> Result<Vec<AgentSession>, RepositoryError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DailyUsage {
    pub message_count: u32,
    pub cost: Decimal,
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn add_usage(
        &self,
        org_id: &OrgId,
        agent_id: &AgentId,
        day: NaiveDate,
        messages: u32,
        cost: Decimal,
    ) -> Result<(), RepositoryError>;

    async fn usage_for_day(
        &self,
        agent_id: &AgentId,
        day: NaiveDate,
    ) -> Result<DailyUsage, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalId)
        -> Result<Option<ApprovalRequest>, RepositoryError>;

    async fn save(&self, approval: ApprovalRequest) -> Result<(), RepositoryError>;

    async fn list_pending_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    /// Pending requests whose deadline has passed, oldest first. Feeds
    /// the expiry sweep.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    async fn append_audit(&self, event: ApprovalAuditEvent) -> Result<(), RepositoryError>;

    async fn audit_trail(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalAuditEvent>, RepositoryError>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, RepositoryError>;

    async fn save(&self, entry: DeadLetterEntry) -> Result<(), RepositoryError>;

    /// Queued entries due for redelivery, oldest first, bounded by the
    /// sweep batch size.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError>;

    /// Successful redelivery removes the entry entirely.
    async fn delete(&self, id: &DeadLetterId) -> Result<(), RepositoryError>;
}
