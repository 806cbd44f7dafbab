//! Collaborator seams the orchestrator works through.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use liaison_core::domain::escalation::Urgency;
use liaison_core::domain::session::{ChannelKind, ContactId, OrgId};
use liaison_db::repositories::{
    ApprovalRepository, DeadLetterRepository, SessionRepository, UsageRepository,
};

use crate::directory::AgentDirectory;
use crate::invoker::RetryFallbackInvoker;
use crate::llm::TokenUsage;
use crate::tools::ToolRegistry;

/// Outbound delivery on a customer channel. Returns the provider-side
/// message id on success.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn deliver(
        &self,
        channel: ChannelKind,
        recipient: &ContactId,
        text: &str,
    ) -> Result<String>;
}

/// One inline action an operator can trigger straight from a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoticeAction {
    pub label: String,
    /// Callback token the interface posts back, e.g. `esc:take_over:<id>`.
    pub callback: String,
}

/// Operator-facing alert fanned out over the configured channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorNotice {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
    pub actions: Vec<NoticeAction>,
}

/// Fan-out to the org's operators. Returns the provider message ids that
/// went out; partial failure is fine, the ids that made it are returned.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_operators(&self, org_id: &OrgId, notice: &OperatorNotice)
        -> Result<Vec<String>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetStatus {
    Available,
    Exhausted,
}

/// Billing seam. Deduction failures must never fail the turn; the
/// orchestrator logs and moves on.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn check_budget(&self, org_id: &OrgId) -> Result<BudgetStatus>;

    /// Charge for a completed model call, returning the cost applied.
    async fn deduct(&self, org_id: &OrgId, model: &str, usage: &TokenUsage) -> Result<Decimal>;

    /// Charge for an executed tool action, returning the cost applied.
    async fn deduct_action(&self, org_id: &OrgId, action: &str) -> Result<Decimal>;
}

/// Best-effort CRM linkage; a failure here never blocks the turn.
#[async_trait]
pub trait CrmConnector: Send + Sync {
    async fn link_contact(
        &self,
        org_id: &OrgId,
        channel: ChannelKind,
        contact_id: &ContactId,
    ) -> Result<()>;
}

/// Everything one turn needs, wired once at bootstrap and shared.
#[derive(Clone)]
pub struct TurnContext {
    pub sessions: Arc<dyn SessionRepository>,
    pub usage: Arc<dyn UsageRepository>,
    pub approvals: Arc<dyn ApprovalRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub directory: Arc<dyn AgentDirectory>,
    pub delivery: Arc<dyn DeliveryAdapter>,
    pub notifier: Arc<dyn Notifier>,
    pub credits: Arc<dyn CreditLedger>,
    pub crm: Arc<dyn CrmConnector>,
    pub registry: Arc<ToolRegistry>,
    pub invoker: Arc<RetryFallbackInvoker>,
}
