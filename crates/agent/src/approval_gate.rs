//! Operator sign-off for sensitive tool calls.
//!
//! Instead of executing, the orchestrator parks a gated call here as a
//! pending request. Operators approve or reject; a sweep expires requests
//! nobody answered. Every transition lands in an append-only audit trail
//! with a hash of the payload as it was at that moment.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use liaison_core::domain::agent_profile::{AgentProfile, AutonomyMode};
use liaison_core::domain::approval::{
    payload_hash, ApprovalAuditEvent, ApprovalId, ApprovalRequest, ApprovalStatus,
};
use liaison_core::domain::session::{AgentId, OrgId, SessionId};
use liaison_db::repositories::{ApprovalRepository, RepositoryError};

use crate::llm::ToolCall;

#[derive(Clone, Debug)]
pub struct ApprovalGateConfig {
    /// How long a pending request stays answerable.
    pub ttl_hours: i64,
}

impl Default for ApprovalGateConfig {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval request not found")]
    NotFound,
    #[error("approval request is already {status:?}")]
    AlreadyResolved { status: ApprovalStatus },
    #[error("approval request expired before it was answered")]
    DeadlinePassed,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalRepository>,
    config: ApprovalGateConfig,
}

impl ApprovalGate {
    pub fn new(approvals: Arc<dyn ApprovalRepository>, config: ApprovalGateConfig) -> Self {
        Self { approvals, config }
    }

    /// Whether this profile may run the tool directly or must go through
    /// the gate first.
    pub fn requires_sign_off(profile: &AgentProfile, tool_name: &str) -> bool {
        match profile.autonomy {
            AutonomyMode::Autonomous => false,
            AutonomyMode::Supervised => profile.tools_requiring_approval.contains(tool_name),
            AutonomyMode::Gated => true,
        }
    }

    /// Park a tool call as a pending request.
    pub async fn open(
        &self,
        org_id: &OrgId,
        agent_id: &AgentId,
        session_id: &SessionId,
        call: &ToolCall,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, GateError> {
        let request = ApprovalRequest {
            id: ApprovalId(Uuid::new_v4().to_string()),
            org_id: org_id.clone(),
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
            action_kind: call.name.clone(),
            payload_json: call.arguments.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: now,
            expires_at: now + Duration::hours(self.config.ttl_hours),
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            result_json: None,
        };

        self.approvals.save(request.clone()).await?;
        self.audit(&request, None, format!("agent:{}", agent_id.0), None, now).await?;

        info!(
            event_name = "approval_opened",
            approval_id = %request.id.0,
            action_kind = %request.action_kind,
            session_id = %session_id.0,
        );
        Ok(request)
    }

    /// Operator approves. The caller then executes the action and reports
    /// back through [`ApprovalGate::record_result`].
    pub async fn approve(
        &self,
        id: &ApprovalId,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, GateError> {
        let mut request = self.pending(id).await?;

        if request.expires_at <= now {
            self.transition(&mut request, ApprovalStatus::Expired, "system:expiry", None, now)
                .await?;
            return Err(GateError::DeadlinePassed);
        }

        request.resolved_by = Some(actor.to_string());
        request.resolved_at = Some(now);
        request.resolution_note = note.clone();
        self.transition(&mut request, ApprovalStatus::Approved, actor, note, now).await?;
        Ok(request)
    }

    pub async fn reject(
        &self,
        id: &ApprovalId,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, GateError> {
        let mut request = self.pending(id).await?;

        request.resolved_by = Some(actor.to_string());
        request.resolved_at = Some(now);
        request.resolution_note = note.clone();
        self.transition(&mut request, ApprovalStatus::Rejected, actor, note, now).await?;
        Ok(request)
    }

    /// Record the one execution of an approved action. Only an approved
    /// request accepts a result, and completed/failed are terminal, so an
    /// action can never run twice.
    pub async fn record_result(
        &self,
        id: &ApprovalId,
        result: Result<serde_json::Value, String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, GateError> {
        let mut request = self.approvals.find_by_id(id).await?.ok_or(GateError::NotFound)?;
        if request.status != ApprovalStatus::Approved {
            return Err(GateError::AlreadyResolved { status: request.status });
        }

        let (status, result_json, note) = match result {
            Ok(value) => (ApprovalStatus::Completed, value.to_string(), None),
            Err(error) => {
                (ApprovalStatus::Failed, serde_json::json!({ "error": error }).to_string(), None)
            }
        };
        request.result_json = Some(result_json);
        self.transition(&mut request, status, "system", note, now).await?;
        Ok(request)
    }

    /// Expire pending requests whose deadline has passed. Returns the
    /// requests transitioned this pass.
    pub async fn expire_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, GateError> {
        let due = self.approvals.list_expired(now, limit).await?;
        let mut expired = Vec::with_capacity(due.len());

        for mut request in due {
            self.transition(&mut request, ApprovalStatus::Expired, "system:expiry", None, now)
                .await?;
            expired.push(request);
        }

        Ok(expired)
    }

    pub async fn audit_trail(
        &self,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalAuditEvent>, GateError> {
        Ok(self.approvals.audit_trail(id).await?)
    }

    async fn pending(&self, id: &ApprovalId) -> Result<ApprovalRequest, GateError> {
        let request = self.approvals.find_by_id(id).await?.ok_or(GateError::NotFound)?;
        if request.status != ApprovalStatus::Pending {
            return Err(GateError::AlreadyResolved { status: request.status });
        }
        Ok(request)
    }

    async fn transition(
        &self,
        request: &mut ApprovalRequest,
        to: ApprovalStatus,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), GateError> {
        let from = request.status;
        request.status = to;
        self.approvals.save(request.clone()).await?;
        self.audit(request, Some(from), actor.to_string(), note, now).await?;

        info!(
            event_name = "approval_transition",
            approval_id = %request.id.0,
            from = from.as_str(),
            to = to.as_str(),
            actor,
        );
        Ok(())
    }

    async fn audit(
        &self,
        request: &ApprovalRequest,
        from: Option<ApprovalStatus>,
        actor: String,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), GateError> {
        self.approvals
            .append_audit(ApprovalAuditEvent {
                id: Uuid::new_v4().to_string(),
                approval_id: request.id.clone(),
                from_status: from,
                to_status: request.status,
                actor,
                note,
                payload_hash: payload_hash(&request.payload_json),
                occurred_at: now,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use liaison_core::domain::agent_profile::{AgentProfile, AutonomyMode};
    use liaison_core::domain::approval::ApprovalStatus;
    use liaison_core::domain::session::{AgentId, ChannelKind, OrgId, SessionId};
    use liaison_core::escalation::PolicyOverride;
    use liaison_db::repositories::InMemoryApprovalRepository;
    use rust_decimal::Decimal;

    use super::{ApprovalGate, ApprovalGateConfig, GateError};
    use crate::llm::ToolCall;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(
            Arc::new(InMemoryApprovalRepository::default()),
            ApprovalGateConfig::default(),
        )
    }

    fn refund_call() -> ToolCall {
        ToolCall {
            name: "issue_refund".to_string(),
            arguments: json!({"order_id": "ORD-7", "amount": "49.00"}),
        }
    }

    async fn open_request(gate: &ApprovalGate) -> liaison_core::domain::approval::ApprovalRequest {
        gate.open(
            &OrgId("org-1".to_string()),
            &AgentId("agent-1".to_string()),
            &SessionId("s-1".to_string()),
            &refund_call(),
            Utc::now(),
        )
        .await
        .expect("open")
    }

    fn profile(autonomy: AutonomyMode) -> AgentProfile {
        let mut tools_requiring_approval = std::collections::BTreeSet::new();
        tools_requiring_approval.insert("issue_refund".to_string());
        AgentProfile {
            id: AgentId("agent-1".to_string()),
            org_id: OrgId("org-1".to_string()),
            name: "Support".to_string(),
            channel: ChannelKind::WebChat,
            persona: "friendly".to_string(),
            language: "en".to_string(),
            faq: Vec::new(),
            blocked_topics: Vec::new(),
            autonomy,
            allowed_tools: Default::default(),
            denied_tools: Default::default(),
            tools_requiring_approval,
            escalation_overrides: PolicyOverride::default(),
            model_candidates: vec!["llama3.1".to_string()],
            daily_message_limit: 500,
            daily_cost_limit: Decimal::new(10, 0),
            is_template: false,
        }
    }

    #[test]
    fn sign_off_requirement_follows_the_autonomy_mode() {
        let autonomous = profile(AutonomyMode::Autonomous);
        assert!(!ApprovalGate::requires_sign_off(&autonomous, "issue_refund"));

        let supervised = profile(AutonomyMode::Supervised);
        assert!(ApprovalGate::requires_sign_off(&supervised, "issue_refund"));
        assert!(!ApprovalGate::requires_sign_off(&supervised, "crm_update"));

        let gated = profile(AutonomyMode::Gated);
        assert!(ApprovalGate::requires_sign_off(&gated, "crm_update"));
    }

    #[tokio::test]
    async fn approve_then_complete_leaves_a_full_audit_trail() {
        let gate = gate();
        let request = open_request(&gate).await;
        assert_eq!(request.status, ApprovalStatus::Pending);

        let approved =
            gate.approve(&request.id, "op-1", Some("looks right".to_string()), Utc::now())
                .await
                .expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.resolved_by.as_deref(), Some("op-1"));

        let completed = gate
            .record_result(&request.id, Ok(json!({"refund_id": "R-1"})), Utc::now())
            .await
            .expect("complete");
        assert_eq!(completed.status, ApprovalStatus::Completed);
        assert!(completed.result_json.expect("result").contains("R-1"));

        let trail = gate.audit_trail(&request.id).await.expect("trail");
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].from_status, None);
        assert_eq!(trail[2].to_status, ApprovalStatus::Completed);
        assert!(trail.iter().all(|event| event.payload_hash.len() == 64));
    }

    #[tokio::test]
    async fn an_approved_action_can_only_run_once() {
        let gate = gate();
        let request = open_request(&gate).await;
        gate.approve(&request.id, "op-1", None, Utc::now()).await.expect("approve");
        gate.record_result(&request.id, Ok(json!({})), Utc::now()).await.expect("first run");

        let error = gate
            .record_result(&request.id, Ok(json!({})), Utc::now())
            .await
            .expect_err("second run must fail");
        assert!(matches!(
            error,
            GateError::AlreadyResolved { status: ApprovalStatus::Completed }
        ));
    }

    #[tokio::test]
    async fn a_failed_execution_is_terminal_too() {
        let gate = gate();
        let request = open_request(&gate).await;
        gate.approve(&request.id, "op-1", None, Utc::now()).await.expect("approve");

        let failed = gate
            .record_result(&request.id, Err("gateway timeout".to_string()), Utc::now())
            .await
            .expect("record failure");
        assert_eq!(failed.status, ApprovalStatus::Failed);
        assert!(failed.result_json.expect("result").contains("gateway timeout"));

        let error = gate
            .approve(&request.id, "op-2", None, Utc::now())
            .await
            .expect_err("terminal request cannot be approved");
        assert!(matches!(error, GateError::AlreadyResolved { status: ApprovalStatus::Failed }));
    }

    #[tokio::test]
    async fn reject_records_the_note_and_blocks_execution() {
        let gate = gate();
        let request = open_request(&gate).await;

        let rejected = gate
            .reject(&request.id, "op-1", Some("wrong order".to_string()), Utc::now())
            .await
            .expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.resolution_note.as_deref(), Some("wrong order"));

        let error = gate
            .record_result(&request.id, Ok(json!({})), Utc::now())
            .await
            .expect_err("rejected action must not run");
        assert!(matches!(error, GateError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn approving_past_the_deadline_expires_instead() {
        let gate = gate();
        let request = open_request(&gate).await;

        let late = Utc::now() + Duration::hours(25);
        let error =
            gate.approve(&request.id, "op-1", None, late).await.expect_err("too late");
        assert!(matches!(error, GateError::DeadlinePassed));

        let trail = gate.audit_trail(&request.id).await.expect("trail");
        assert_eq!(trail.last().expect("event").to_status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn expiry_sweep_transitions_only_overdue_requests() {
        let gate = gate();
        let request = open_request(&gate).await;

        let untouched = gate.expire_due(Utc::now(), 50).await.expect("sweep");
        assert!(untouched.is_empty());

        let expired =
            gate.expire_due(Utc::now() + Duration::hours(25), 50).await.expect("sweep");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, request.id);
        assert_eq!(expired[0].status, ApprovalStatus::Expired);
    }
}
