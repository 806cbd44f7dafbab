//! Inbound HTTP surface: channel webhooks and operator callbacks.
//!
//! Channel providers post customer messages to `/webhooks/{channel}/{agent_id}`;
//! notification interfaces post quick-action tokens to `/callbacks`. Both
//! endpoints answer with plain JSON the provider can log.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use liaison_agent::approval_gate::{ApprovalGate, GateError};
use liaison_agent::context::TurnContext;
use liaison_agent::escalations::{EscalationService, EscalationServiceError};
use liaison_agent::orchestrator::{InboundMessage, TurnError, TurnOrchestrator, TurnOutcome};
use liaison_channels::quick_actions::QuickAction;
use liaison_core::domain::approval::ApprovalRequest;
use liaison_core::domain::session::{AgentId, ChannelKind, ContactId};
use liaison_core::escalation::Transition;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub escalations: Arc<EscalationService>,
    pub gate: Arc<ApprovalGate>,
    pub context: TurnContext,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/{channel}/{agent_id}", post(inbound))
        .route("/callbacks", post(callback))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct InboundPayload {
    pub contact_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackPayload {
    /// Quick-action token, e.g. `esc:take_over:<session_id>`.
    pub callback: String,
    pub actor: String,
    pub note: Option<String>,
}

pub async fn inbound(
    State(state): State<AppState>,
    Path((channel, agent_id)): Path<(String, String)>,
    Json(payload): Json<InboundPayload>,
) -> (StatusCode, Json<Value>) {
    let Some(channel) = ChannelKind::parse(&channel) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown channel '{channel}'") })),
        );
    };

    let outcome = state
        .orchestrator
        .handle(InboundMessage {
            agent_id: AgentId(agent_id),
            channel,
            contact_id: ContactId(payload.contact_id),
            text: payload.text,
        })
        .await;

    match outcome {
        Ok(outcome) => (StatusCode::OK, Json(outcome_body(outcome))),
        Err(error) => turn_error_response(error),
    }
}

pub async fn callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> (StatusCode, Json<Value>) {
    let Some(action) = QuickAction::parse(&payload.callback) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unrecognized callback token" })),
        );
    };
    let now = Utc::now();

    match action {
        QuickAction::TakeOver { session_id } => {
            transition_response(state.escalations.take_over(&session_id, &payload.actor, now).await)
        }
        QuickAction::Dismiss { session_id } => {
            transition_response(state.escalations.dismiss(&session_id, &payload.actor, now).await)
        }
        QuickAction::Resolve { session_id } => {
            transition_response(state.escalations.resolve(&session_id, &payload.actor, now).await)
        }
        QuickAction::Approve { approval_id } => {
            let approved =
                match state.gate.approve(&approval_id, &payload.actor, payload.note, now).await {
                    Ok(request) => request,
                    Err(error) => return gate_error_response(error),
                };

            // The approved action runs exactly once, here, and the result
            // lands on the request whichever way it goes.
            let result = match state.context.registry.get(&approved.action_kind) {
                Some(tool) => {
                    let arguments: Value =
                        serde_json::from_str(&approved.payload_json).unwrap_or(Value::Null);
                    tool.execute(&arguments).await.map_err(|error| error.to_string())
                }
                None => {
                    warn!(
                        event_name = "approved_tool_missing",
                        approval_id = %approved.id.0,
                        action_kind = %approved.action_kind,
                    );
                    Err(format!("tool '{}' is not registered", approved.action_kind))
                }
            };

            match state.gate.record_result(&approved.id, result, Utc::now()).await {
                Ok(request) => (StatusCode::OK, Json(approval_body(&request))),
                Err(error) => gate_error_response(error),
            }
        }
        QuickAction::Reject { approval_id } => {
            match state.gate.reject(&approval_id, &payload.actor, payload.note, now).await {
                Ok(request) => (StatusCode::OK, Json(approval_body(&request))),
                Err(error) => gate_error_response(error),
            }
        }
    }
}

fn outcome_body(outcome: TurnOutcome) -> Value {
    match outcome {
        TurnOutcome::Replied { reply, tool_outcomes } => json!({
            "outcome": "replied",
            "reply": reply,
            "tools_invoked": tool_outcomes.len(),
        }),
        TurnOutcome::AwaitingApproval { approval_id, reply } => json!({
            "outcome": "awaiting_approval",
            "approval_id": approval_id.0,
            "reply": reply,
        }),
        TurnOutcome::Escalated { trigger } => {
            json!({ "outcome": "escalated", "trigger": trigger.as_str() })
        }
        TurnOutcome::EscalationPending => json!({ "outcome": "escalation_pending" }),
        TurnOutcome::HandedOff => json!({ "outcome": "handed_off" }),
        TurnOutcome::RateLimited => json!({ "outcome": "rate_limited" }),
        TurnOutcome::BudgetExhausted => json!({ "outcome": "budget_exhausted" }),
        TurnOutcome::ModelUnavailable => json!({ "outcome": "model_unavailable" }),
    }
}

fn approval_body(request: &ApprovalRequest) -> Value {
    json!({
        "approval_id": request.id.0,
        "status": request.status.as_str(),
        "action_kind": request.action_kind,
    })
}

fn transition_response(
    result: Result<Transition, EscalationServiceError>,
) -> (StatusCode, Json<Value>) {
    match result {
        Ok(transition) => {
            let status = transition
                .session
                .escalation
                .as_ref()
                .map(|episode| episode.status.as_str());
            (
                StatusCode::OK,
                Json(json!({
                    "session_id": transition.session.id.0,
                    "changed": transition.changed,
                    "escalation_status": status,
                })),
            )
        }
        Err(error) => {
            let status = match &error {
                EscalationServiceError::SessionNotFound => StatusCode::NOT_FOUND,
                EscalationServiceError::Domain(_) | EscalationServiceError::Conflict => {
                    StatusCode::CONFLICT
                }
                EscalationServiceError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "error": error.to_string() })))
        }
    }
}

fn gate_error_response(error: GateError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        GateError::NotFound => StatusCode::NOT_FOUND,
        GateError::AlreadyResolved { .. } => StatusCode::CONFLICT,
        GateError::DeadlinePassed => StatusCode::GONE,
        GateError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() })))
}

fn turn_error_response(error: TurnError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        TurnError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use uuid::Uuid;

    use liaison_agent::approval_gate::{ApprovalGate, ApprovalGateConfig};
    use liaison_agent::context::{
        BudgetStatus, CreditLedger, CrmConnector, DeliveryAdapter, Notifier, OperatorNotice,
        TurnContext,
    };
    use liaison_agent::directory::StaticAgentDirectory;
    use liaison_agent::escalations::EscalationService;
    use liaison_agent::invoker::{InvokerConfig, RetryFallbackInvoker};
    use liaison_agent::llm::{
        ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage, ToolCall, ToolSpec,
    };
    use liaison_agent::orchestrator::TurnOrchestrator;
    use liaison_agent::tools::{ToolExecutor, ToolRegistry};
    use liaison_core::domain::agent_profile::{AgentProfile, AutonomyMode};
    use liaison_core::domain::approval::ApprovalStatus;
    use liaison_core::domain::escalation::{EscalationStatus, TriggerType, Urgency};
    use liaison_core::domain::session::{
        AgentId, AgentSession, ChannelKind, ContactId, OrgId, SessionId,
    };
    use liaison_core::escalation::{EscalationEngine, PolicyOverride};
    use liaison_db::repositories::{
        InMemoryApprovalRepository, InMemoryDeadLetterRepository, InMemorySessionRepository,
        SessionRepository,
    };

    use super::{callback, inbound, AppState, CallbackPayload, InboundPayload};

    struct FixedModel;

    #[async_trait]
    impl ModelClient for FixedModel {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse {
                text: "Happy to help.".to_string(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct NullDelivery;

    #[async_trait]
    impl DeliveryAdapter for NullDelivery {
        async fn deliver(
            &self,
            _channel: ChannelKind,
            _recipient: &ContactId,
            _text: &str,
        ) -> Result<String> {
            Ok(format!("msg-{}", Uuid::new_v4()))
        }
    }

    struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn notify_operators(
            &self,
            _org_id: &OrgId,
            _notice: &OperatorNotice,
        ) -> Result<Vec<String>> {
            Ok(vec!["chat-1".to_string()])
        }
    }

    struct OpenLedger;

    #[async_trait]
    impl CreditLedger for OpenLedger {
        async fn check_budget(&self, _org_id: &OrgId) -> Result<BudgetStatus> {
            Ok(BudgetStatus::Available)
        }

        async fn deduct(
            &self,
            _org_id: &OrgId,
            _model: &str,
            _usage: &TokenUsage,
        ) -> Result<Decimal> {
            Ok(Decimal::ZERO)
        }

        async fn deduct_action(&self, _org_id: &OrgId, _action: &str) -> Result<Decimal> {
            Ok(Decimal::ZERO)
        }
    }

    struct NullCrm;

    #[async_trait]
    impl CrmConnector for NullCrm {
        async fn link_contact(
            &self,
            _org_id: &OrgId,
            _channel: ChannelKind,
            _contact_id: &ContactId,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct RefundTool;

    #[async_trait]
    impl ToolExecutor for RefundTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "issue_refund".to_string(),
                description: "Refund an order".to_string(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: &Value) -> Result<Value> {
            Ok(json!({"refund_id": "R-1"}))
        }
    }

    struct Fixture {
        state: AppState,
        sessions: Arc<InMemorySessionRepository>,
    }

    async fn fixture() -> Fixture {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let approvals = Arc::new(InMemoryApprovalRepository::default());
        let directory = Arc::new(StaticAgentDirectory::new());
        directory
            .insert(AgentProfile {
                id: AgentId("agent-1".to_string()),
                org_id: OrgId("org-1".to_string()),
                name: "Support".to_string(),
                channel: ChannelKind::WebChat,
                persona: "friendly".to_string(),
                language: "en".to_string(),
                faq: Vec::new(),
                blocked_topics: Vec::new(),
                autonomy: AutonomyMode::Autonomous,
                allowed_tools: Default::default(),
                denied_tools: Default::default(),
                tools_requiring_approval: Default::default(),
                escalation_overrides: PolicyOverride::default(),
                model_candidates: vec!["llama3.1".to_string()],
                daily_message_limit: 500,
                daily_cost_limit: Decimal::new(10, 0),
                is_template: false,
            })
            .await;

        let mut registry = ToolRegistry::new();
        registry.register(RefundTool);

        let context = TurnContext {
            sessions: sessions.clone(),
            usage: sessions.clone(),
            approvals: approvals.clone(),
            dead_letters: Arc::new(InMemoryDeadLetterRepository::default()),
            directory,
            delivery: Arc::new(NullDelivery),
            notifier: Arc::new(NullNotifier),
            credits: Arc::new(OpenLedger),
            crm: Arc::new(NullCrm),
            registry: Arc::new(registry),
            invoker: Arc::new(RetryFallbackInvoker::new(
                Arc::new(FixedModel),
                InvokerConfig {
                    candidates: vec!["llama3.1".to_string()],
                    max_attempts_per_candidate: 1,
                    backoff_base_ms: 0,
                },
            )),
        };

        let escalations = Arc::new(EscalationService::new(
            EscalationEngine::new(),
            sessions.clone(),
            Arc::new(NullNotifier),
        ));
        let gate = Arc::new(ApprovalGate::new(approvals, ApprovalGateConfig::default()));
        let orchestrator =
            Arc::new(TurnOrchestrator::new(context.clone(), escalations.clone(), gate.clone()));

        Fixture {
            state: AppState { orchestrator, escalations, gate, context },
            sessions,
        }
    }

    fn callback_payload(callback: &str) -> CallbackPayload {
        CallbackPayload {
            callback: callback.to_string(),
            actor: "op-1".to_string(),
            note: None,
        }
    }

    #[tokio::test]
    async fn inbound_turn_replies_over_the_webhook() {
        let fixture = fixture().await;

        let (status, Json(body)) = inbound(
            State(fixture.state),
            Path(("web_chat".to_string(), "agent-1".to_string())),
            Json(InboundPayload {
                contact_id: "visitor-1".to_string(),
                text: "hi there".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "replied");
        assert_eq!(body["reply"], "Happy to help.");
    }

    #[tokio::test]
    async fn unknown_channel_and_unknown_agent_are_client_errors() {
        let fixture = fixture().await;

        let (status, _) = inbound(
            State(fixture.state.clone()),
            Path(("carrier_pigeon".to_string(), "agent-1".to_string())),
            Json(InboundPayload { contact_id: "v".to_string(), text: "hi".to_string() }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = inbound(
            State(fixture.state),
            Path(("web_chat".to_string(), "nobody".to_string())),
            Json(InboundPayload { contact_id: "v".to_string(), text: "hi".to_string() }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_callback_tokens_are_rejected() {
        let fixture = fixture().await;

        let (status, _) =
            callback(State(fixture.state), Json(callback_payload("esc:explode:s-1"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn take_over_callback_moves_the_pending_episode() {
        let fixture = fixture().await;

        let mut session = AgentSession::new(
            SessionId("s-1".to_string()),
            OrgId("org-1".to_string()),
            AgentId("agent-1".to_string()),
            ChannelKind::WebChat,
            ContactId("visitor-1".to_string()),
            Utc::now(),
        );
        session = EscalationEngine::new()
            .create(session, TriggerType::ExplicitRequest, Urgency::Normal, "asked", Utc::now())
            .expect("create episode");
        fixture.sessions.save(session).await.expect("seed");

        let (status, Json(body)) = callback(
            State(fixture.state),
            Json(callback_payload("esc:take_over:s-1")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert_eq!(body["escalation_status"], EscalationStatus::TakenOver.as_str());
    }

    #[tokio::test]
    async fn callbacks_for_missing_sessions_are_not_found() {
        let fixture = fixture().await;

        let (status, _) =
            callback(State(fixture.state), Json(callback_payload("esc:dismiss:ghost"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approve_callback_runs_the_tool_once_and_completes() {
        let fixture = fixture().await;

        let request = fixture
            .state
            .gate
            .open(
                &OrgId("org-1".to_string()),
                &AgentId("agent-1".to_string()),
                &SessionId("s-1".to_string()),
                &ToolCall {
                    name: "issue_refund".to_string(),
                    arguments: json!({"order_id": "ORD-7"}),
                },
                Utc::now(),
            )
            .await
            .expect("open approval");

        let token = format!("appr:approve:{}", request.id.0);
        let (status, Json(body)) =
            callback(State(fixture.state.clone()), Json(callback_payload(&token))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], ApprovalStatus::Completed.as_str());

        // A second click finds the request already terminal.
        let (status, _) =
            callback(State(fixture.state), Json(callback_payload(&token))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn approving_an_unregistered_tool_records_the_failure() {
        let fixture = fixture().await;

        let request = fixture
            .state
            .gate
            .open(
                &OrgId("org-1".to_string()),
                &AgentId("agent-1".to_string()),
                &SessionId("s-1".to_string()),
                &ToolCall { name: "wire_transfer".to_string(), arguments: json!({}) },
                Utc::now(),
            )
            .await
            .expect("open approval");

        let token = format!("appr:approve:{}", request.id.0);
        let (status, Json(body)) =
            callback(State(fixture.state), Json(callback_payload(&token))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], ApprovalStatus::Failed.as_str());
    }

    #[tokio::test]
    async fn reject_callback_keeps_the_action_from_running() {
        let fixture = fixture().await;

        let request = fixture
            .state
            .gate
            .open(
                &OrgId("org-1".to_string()),
                &AgentId("agent-1".to_string()),
                &SessionId("s-1".to_string()),
                &ToolCall { name: "issue_refund".to_string(), arguments: json!({}) },
                Utc::now(),
            )
            .await
            .expect("open approval");

        let token = format!("appr:reject:{}", request.id.0);
        let (status, Json(body)) =
            callback(State(fixture.state), Json(callback_payload(&token))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], ApprovalStatus::Rejected.as_str());
    }
}
