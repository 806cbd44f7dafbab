//! The inbound turn pipeline.
//!
//! One customer message in, one decision out: reply, escalate, park a
//! gated action, or refuse politely because a budget ran out. Every
//! session write is a conditional save keyed on `state_version`; when a
//! quick action or sweep wins the race mid-turn, the turn-end write
//! re-reads and re-applies its deltas on top of the winner.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use liaison_core::domain::agent_profile::EffectiveAgent;
use liaison_core::domain::approval::ApprovalId;
use liaison_core::domain::escalation::{EscalationStatus, TriggerType, Urgency};
use liaison_core::domain::session::{
    AgentId, AgentSession, ChannelKind, ContactId, MessageRole, SessionId, SessionMessage,
    SessionStatus,
};
use liaison_core::escalation::{
    post_call_check, pre_call_check, resolve, tool_failure_check, ReplyCounters,
};
use liaison_core::tool_failure::ToolFailureTracker;
use liaison_core::DeadLetterEngine;
use liaison_db::repositories::RepositoryError;

use crate::approval_gate::{ApprovalGate, GateError};
use crate::context::{BudgetStatus, NoticeAction, OperatorNotice, TurnContext};
use crate::escalations::{EscalationService, EscalationServiceError};
use crate::llm::{ChatTurn, ToolCall};
use crate::prompt::system_prompt;
use crate::tools::{in_scope, scoped_specs, ToolOutcome};

const HISTORY_WINDOW: u32 = 20;
const TURN_SAVE_RETRIES: u32 = 3;
const PENDING_WAIT_REPLY: &str =
    "Thanks for your patience. A teammate has been notified and will be with you shortly.";
const MODEL_DOWN_REPLY: &str =
    "Sorry, I'm having trouble responding right now. A teammate will follow up shortly.";
const RATE_LIMITED_REPLY: &str =
    "We've received a lot of messages today. Someone will get back to you soon.";
const BUDGET_REPLY: &str =
    "Our assistant is briefly unavailable. A teammate will follow up as soon as possible.";

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub agent_id: AgentId,
    pub channel: ChannelKind,
    pub contact_id: ContactId,
    pub text: String,
}

/// What the turn concluded. Any reply mentioned here was already
/// delivered (or dead-lettered) before the outcome was returned.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Replied { reply: String, tool_outcomes: Vec<ToolOutcome> },
    /// Reply delivered, but a sensitive action is parked behind the gate.
    AwaitingApproval { approval_id: ApprovalId, reply: String },
    /// An episode was opened this turn.
    Escalated { trigger: TriggerType },
    /// An episode is already waiting for an operator; message stored only.
    EscalationPending,
    /// An operator owns the conversation; the model stays out of it.
    HandedOff,
    RateLimited,
    BudgetExhausted,
    ModelUnavailable,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("agent directory lookup failed: {0}")]
    Directory(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Escalation(#[from] EscalationServiceError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("session '{0}' kept changing underneath the turn")]
    Conflict(String),
}

pub struct TurnOrchestrator {
    context: TurnContext,
    escalations: Arc<EscalationService>,
    gate: Arc<ApprovalGate>,
    tracker: ToolFailureTracker,
    dead_letters: DeadLetterEngine,
}

impl TurnOrchestrator {
    pub fn new(
        context: TurnContext,
        escalations: Arc<EscalationService>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            context,
            escalations,
            gate,
            tracker: ToolFailureTracker::new(),
            dead_letters: DeadLetterEngine::new(),
        }
    }

    pub async fn handle(&self, inbound: InboundMessage) -> Result<TurnOutcome, TurnError> {
        let now = Utc::now();

        // Which configuration answers here.
        let entry_profile = self
            .context
            .directory
            .find_agent(&inbound.agent_id)
            .await
            .map_err(|e| TurnError::Directory(e.to_string()))?
            .ok_or_else(|| TurnError::UnknownAgent(inbound.agent_id.0.clone()))?;

        // Resolve or open the session, then record the inbound message
        // before anything can fail.
        let mut session = match self
            .context
            .sessions
            .find_by_key(&inbound.agent_id, inbound.channel, &inbound.contact_id)
            .await?
        {
            Some(session) => session,
            None => {
                let session = AgentSession::new(
                    SessionId(Uuid::new_v4().to_string()),
                    entry_profile.org_id.clone(),
                    inbound.agent_id.clone(),
                    inbound.channel,
                    inbound.contact_id.clone(),
                    now,
                );
                self.context.sessions.save(session.clone()).await?;
                session
            }
        };
        self.context
            .sessions
            .append_message(SessionMessage {
                session_id: session.id.clone(),
                role: MessageRole::Customer,
                text: inbound.text.clone(),
                created_at: now,
            })
            .await?;

        // Team hand-off: a tagged-in responder answers with its own
        // configuration, snapshotted for this turn.
        let effective = match &session.team {
            Some(team) if team.responder_agent_id != entry_profile.id => {
                match self
                    .context
                    .directory
                    .find_agent(&team.responder_agent_id)
                    .await
                    .map_err(|e| TurnError::Directory(e.to_string()))?
                {
                    Some(responder) => {
                        EffectiveAgent::handed_off(responder, entry_profile.id.clone())
                    }
                    None => {
                        warn!(
                            event_name = "team_responder_missing",
                            session_id = %session.id.0,
                            responder = %team.responder_agent_id.0,
                        );
                        EffectiveAgent::direct(entry_profile)
                    }
                }
            }
            _ => EffectiveAgent::direct(entry_profile),
        };
        let profile = &effective.profile;

        // A live episode keeps the model out of the conversation. A
        // parked customer still hears that someone is coming.
        match session.escalation.as_ref().map(|episode| episode.status) {
            Some(EscalationStatus::Pending) => {
                if let Err(error) = self.reply(&mut session, PENDING_WAIT_REPLY).await {
                    warn!(event_name = "wait_message_failed", session_id = %session.id.0, error = %error);
                }
                info!(event_name = "turn_parked_pending_escalation", session_id = %session.id.0);
                return Ok(TurnOutcome::EscalationPending);
            }
            Some(EscalationStatus::TakenOver) => {
                return Ok(TurnOutcome::HandedOff);
            }
            _ => {}
        }

        // Daily budgets come before any model spend.
        let today = now.date_naive();
        let usage = self.context.usage.usage_for_day(&profile.id, today).await?;
        if usage.message_count >= profile.daily_message_limit {
            self.deliver_or_dead_letter(&session, RATE_LIMITED_REPLY).await?;
            info!(event_name = "turn_rate_limited", session_id = %session.id.0);
            return Ok(TurnOutcome::RateLimited);
        }
        if usage.cost >= profile.daily_cost_limit
            || matches!(
                self.context.credits.check_budget(&session.org_id).await,
                Ok(BudgetStatus::Exhausted)
            )
        {
            self.notify_budget_exhausted(&session).await;
            self.deliver_or_dead_letter(&session, BUDGET_REPLY).await?;
            return Ok(TurnOutcome::BudgetExhausted);
        }

        // CRM linkage never blocks a turn.
        if let Err(error) = self
            .context
            .crm
            .link_contact(&session.org_id, session.channel, &session.contact_id)
            .await
        {
            warn!(event_name = "crm_link_failed", session_id = %session.id.0, error = %error);
        }

        // Deterministic checks on the inbound side.
        let policy = resolve(&profile.escalation_overrides);
        let window = self
            .context
            .sessions
            .recent_messages(
                &session.id,
                Some(MessageRole::Customer),
                policy.negative_sentiment.window as u32,
            )
            .await?
            .into_iter()
            .map(|message| message.text)
            .collect::<Vec<_>>();

        if let Some(signal) = pre_call_check(&policy, &window, &profile.blocked_topics) {
            let trigger = signal.trigger;
            session = self
                .escalations
                .open(session, signal.trigger, signal.urgency, signal.reason, now)
                .await?;

            // The customer gets the hold message even if delivery is
            // shaky; a failure here must not cancel the escalation.
            if let Err(error) = self.reply(&mut session, &policy.hold_message).await {
                warn!(event_name = "hold_message_failed", session_id = %session.id.0, error = %error);
            }
            self.persist(session).await?;
            return Ok(TurnOutcome::Escalated { trigger });
        }

        // Model call with retry and fallback, on the agent's own chain.
        let turns = self.build_turns(&effective, &session).await?;
        let tools = scoped_specs(&self.context.registry, profile, &session.error_state);
        let outcome = match self
            .context
            .invoker
            .invoke_with_candidates(&profile.model_candidates, turns, tools)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(event_name = "model_unavailable", session_id = %session.id.0, error = %error);
                self.notify_model_unavailable(&session, profile.id.0.as_str()).await;
                if let Err(error) = self.reply(&mut session, MODEL_DOWN_REPLY).await {
                    warn!(event_name = "fallback_reply_failed", session_id = %session.id.0, error = %error);
                }
                self.persist(session).await?;
                return Ok(TurnOutcome::ModelUnavailable);
            }
        };

        // Tool calls run under scoping, the gate, and the breaker.
        let was_degraded = session.error_state.degraded;
        let mut tool_outcomes = Vec::new();
        let mut pending_approval: Option<ApprovalId> = None;
        for call in &outcome.response.tool_calls {
            let tool_outcome =
                self.run_tool(&mut session, &effective, call, &mut pending_approval).await?;
            tool_outcomes.push(tool_outcome);
        }

        // Reply-side checks; the reply is delivered either way.
        let (post_signal, counters) = post_call_check(
            &policy,
            &outcome.response.text,
            ReplyCounters {
                uncertainty_count: session.uncertainty_count,
                previous_reply: session.previous_reply.clone(),
            },
        );
        session.uncertainty_count = counters.uncertainty_count;
        session.previous_reply = counters.previous_reply;

        let mut escalated_trigger = None;
        if let Some(signal) = post_signal {
            if !session.has_active_escalation() {
                escalated_trigger = Some(signal.trigger);
                session = self
                    .escalations
                    .open(session, signal.trigger, signal.urgency, signal.reason, now)
                    .await?;
            }
        } else if session.error_state.degraded
            && !was_degraded
            && !session.has_active_escalation()
        {
            if let Some(signal) =
                tool_failure_check(&policy, session.error_state.disabled_tools.len())
            {
                escalated_trigger = Some(signal.trigger);
                session = self
                    .escalations
                    .open(session, signal.trigger, signal.urgency, signal.reason, now)
                    .await?;
            }
        }

        let reply = outcome.response.text.clone();
        self.reply(&mut session, &reply).await?;

        // Billing is soft-fail: a ledger outage never loses the turn.
        let mut cost = match self
            .context
            .credits
            .deduct(&session.org_id, &outcome.model, &outcome.response.usage)
            .await
        {
            Ok(cost) => cost,
            Err(error) => {
                warn!(event_name = "credit_deduct_failed", session_id = %session.id.0, error = %error);
                Decimal::ZERO
            }
        };
        for tool_outcome in &tool_outcomes {
            let ToolOutcome::Executed { name, .. } = tool_outcome else { continue };
            match self.context.credits.deduct_action(&session.org_id, name).await {
                Ok(action_cost) => cost += action_cost,
                Err(error) => {
                    warn!(
                        event_name = "action_deduct_failed",
                        session_id = %session.id.0,
                        tool = %name,
                        error = %error,
                    );
                }
            }
        }
        self.context
            .usage
            .add_usage(&session.org_id, &profile.id, today, 1, cost)
            .await?;

        let session_id = session.id.0.clone();
        self.persist(session).await?;

        info!(
            event_name = "turn_completed",
            session_id = %session_id,
            model = %outcome.model,
            model_attempts = outcome.attempts.len(),
            tool_calls = tool_outcomes.len(),
            escalated = escalated_trigger.is_some(),
        );

        if let Some(approval_id) = pending_approval {
            return Ok(TurnOutcome::AwaitingApproval { approval_id, reply });
        }
        if let Some(trigger) = escalated_trigger {
            return Ok(TurnOutcome::Escalated { trigger });
        }
        Ok(TurnOutcome::Replied { reply, tool_outcomes })
    }

    async fn run_tool(
        &self,
        session: &mut AgentSession,
        effective: &EffectiveAgent,
        call: &ToolCall,
        pending_approval: &mut Option<ApprovalId>,
    ) -> Result<ToolOutcome, TurnError> {
        let profile = &effective.profile;

        if session.error_state.disabled_tools.contains(&call.name) {
            return Ok(ToolOutcome::Disabled { name: call.name.clone() });
        }
        if !in_scope(&self.context.registry, profile, &session.error_state, &call.name) {
            warn!(event_name = "tool_out_of_scope", session_id = %session.id.0, tool = %call.name);
            return Ok(ToolOutcome::OutOfScope { name: call.name.clone() });
        }

        if ApprovalGate::requires_sign_off(profile, &call.name) {
            let request = self
                .gate
                .open(&session.org_id, &profile.id, &session.id, call, Utc::now())
                .await?;

            let notice = OperatorNotice {
                title: format!("Sign-off needed: {}", call.name),
                body: format!("Agent {} wants to run {}.", profile.name, call.name),
                urgency: Urgency::Normal,
                actions: vec![
                    NoticeAction {
                        label: "Approve".to_string(),
                        callback: format!("appr:approve:{}", request.id.0),
                    },
                    NoticeAction {
                        label: "Reject".to_string(),
                        callback: format!("appr:reject:{}", request.id.0),
                    },
                ],
            };
            if let Err(error) =
                self.context.notifier.notify_operators(&session.org_id, &notice).await
            {
                warn!(event_name = "approval_notify_failed", approval_id = %request.id.0, error = %error);
            }

            pending_approval.get_or_insert(request.id.clone());
            return Ok(ToolOutcome::PendingApproval {
                name: call.name.clone(),
                approval_id: request.id,
            });
        }

        let Some(tool) = self.context.registry.get(&call.name) else {
            return Ok(ToolOutcome::OutOfScope { name: call.name.clone() });
        };
        match tool.execute(&call.arguments).await {
            Ok(result) => {
                self.tracker.record_success(&mut session.error_state, &call.name);
                Ok(ToolOutcome::Executed { name: call.name.clone(), result })
            }
            Err(error) => {
                let record = self.tracker.record_failure(&mut session.error_state, &call.name);
                warn!(
                    event_name = "tool_failed",
                    session_id = %session.id.0,
                    tool = %call.name,
                    consecutive = record.consecutive_failures,
                    disabled = record.newly_disabled,
                    degraded = record.newly_degraded,
                );
                if record.newly_disabled {
                    let notice = OperatorNotice {
                        title: format!("Tool disabled: {}", call.name),
                        body: format!(
                            "{} failed {} times in a row and is off for the rest of this \
                             conversation.",
                            call.name, record.consecutive_failures
                        ),
                        urgency: Urgency::Normal,
                        actions: Vec::new(),
                    };
                    if let Err(error) =
                        self.context.notifier.notify_operators(&session.org_id, &notice).await
                    {
                        warn!(event_name = "tool_disabled_notify_failed", session_id = %session.id.0, error = %error);
                    }
                }
                Ok(ToolOutcome::Failed { name: call.name.clone(), error: error.to_string() })
            }
        }
    }

    async fn build_turns(
        &self,
        effective: &EffectiveAgent,
        session: &AgentSession,
    ) -> Result<Vec<ChatTurn>, TurnError> {
        let mut turns = vec![ChatTurn::system(system_prompt(effective, session))];

        let history = self
            .context
            .sessions
            .recent_messages(&session.id, None, HISTORY_WINDOW)
            .await?;
        for message in history {
            match message.role {
                MessageRole::Customer => turns.push(ChatTurn::user(message.text)),
                // Operators speak with the business's voice.
                MessageRole::Agent | MessageRole::Operator => {
                    turns.push(ChatTurn::assistant(message.text));
                }
                MessageRole::System => {}
            }
        }

        Ok(turns)
    }

    /// Record and deliver an outbound reply. Delivery failures divert to
    /// the dead letter queue instead of failing the turn.
    async fn reply(&self, session: &mut AgentSession, text: &str) -> Result<(), TurnError> {
        self.context
            .sessions
            .append_message(SessionMessage {
                session_id: session.id.clone(),
                role: MessageRole::Agent,
                text: text.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        self.deliver_or_dead_letter(session, text).await
    }

    async fn deliver_or_dead_letter(
        &self,
        session: &AgentSession,
        text: &str,
    ) -> Result<(), TurnError> {
        if !session.channel.delivers() {
            return Ok(());
        }

        if let Err(error) = self
            .context
            .delivery
            .deliver(session.channel, &session.contact_id, text)
            .await
        {
            warn!(event_name = "delivery_failed", session_id = %session.id.0, error = %error);
            let entry = self.dead_letters.enqueue(
                session.org_id.clone(),
                session.channel,
                session.contact_id.clone(),
                text,
                error.to_string(),
                Some(session.id.clone()),
                Utc::now(),
            );
            // Losing the dead letter too is log-only; the turn already
            // did its real work.
            if let Err(error) = self.context.dead_letters.save(entry).await {
                warn!(event_name = "dead_letter_enqueue_failed", session_id = %session.id.0, error = %error);
            }
        }
        Ok(())
    }

    /// Turn-end write. Conditional on the version this turn read; when a
    /// quick action or sweep wrote in between, the latest session is
    /// re-read and the turn's deltas are re-applied on top of it, so a
    /// concurrent take-over or hand-off is never clobbered.
    async fn persist(&self, turn: AgentSession) -> Result<(), TurnError> {
        let mut candidate = turn.clone();
        for _ in 0..TURN_SAVE_RETRIES {
            let expected = candidate.state_version;
            candidate.updated_at = Utc::now();
            if self.context.sessions.save_if_version(&candidate, expected).await? {
                return Ok(());
            }

            let fresh = self
                .context
                .sessions
                .find_by_id(&turn.id)
                .await?
                .ok_or_else(|| TurnError::Conflict(turn.id.0.clone()))?;
            warn!(
                event_name = "turn_write_lost_race",
                session_id = %turn.id.0,
                fresh_version = fresh.state_version,
            );
            candidate = merge_turn(fresh, &turn);
        }
        Err(TurnError::Conflict(turn.id.0.clone()))
    }

    async fn notify_model_unavailable(&self, session: &AgentSession, agent_id: &str) {
        let notice = OperatorNotice {
            title: "Model unavailable".to_string(),
            body: format!(
                "Every model candidate failed for agent {} on {}; customers are getting \
                 a fallback reply.",
                agent_id,
                session.channel.as_str()
            ),
            urgency: Urgency::High,
            actions: Vec::new(),
        };
        if let Err(error) = self.context.notifier.notify_operators(&session.org_id, &notice).await
        {
            warn!(event_name = "model_down_notify_failed", session_id = %session.id.0, error = %error);
        }
    }

    async fn notify_budget_exhausted(&self, session: &AgentSession) {
        let notice = OperatorNotice {
            title: "Message budget exhausted".to_string(),
            body: format!(
                "Agent {} on {} stopped answering: daily budget used up.",
                session.agent_id.0,
                session.channel.as_str()
            ),
            urgency: Urgency::Normal,
            actions: Vec::new(),
        };
        if let Err(error) = self.context.notifier.notify_operators(&session.org_id, &notice).await
        {
            warn!(event_name = "budget_notify_failed", session_id = %session.id.0, error = %error);
        }
    }
}

/// Re-apply one turn's deltas on top of a concurrent writer's session.
/// The turn owns the reply counters and the breaker state; the episode
/// and hand-off status belong to whoever wrote last, so an escalation
/// this turn opened only lands when nothing else is in flight.
fn merge_turn(mut fresh: AgentSession, turn: &AgentSession) -> AgentSession {
    fresh.error_state = turn.error_state.clone();
    fresh.uncertainty_count = turn.uncertainty_count;
    fresh.previous_reply = turn.previous_reply.clone();

    if let Some(episode) = &turn.escalation {
        let blocked =
            fresh.has_active_escalation() || fresh.status == SessionStatus::HandedOff;
        if episode.is_active() && !blocked {
            fresh.escalation = Some(episode.clone());
        }
    }
    fresh
}
