//! Turn orchestration - the runtime that answers customer messages.
//!
//! This crate is the "brain" between the channel adapters and the model:
//! - Resolves which agent configuration answers a turn (`directory`)
//! - Runs the inbound pipeline end to end (`orchestrator`)
//! - Calls the model with retry and candidate fallback (`invoker`)
//! - Gates sensitive tool calls behind operator sign-off (`approval_gate`)
//! - Manages human-intervention episodes (`escalations`)
//!
//! # Safety principle
//!
//! The model drafts replies and proposes tool calls. It never bypasses the
//! deterministic checks: escalation detection, tool scoping, the approval
//! gate, and the per-tool circuit breaker all run outside the model.

pub mod approval_gate;
pub mod context;
pub mod directory;
pub mod escalations;
pub mod invoker;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod tools;

pub use approval_gate::{ApprovalGate, ApprovalGateConfig, GateError};
pub use context::{
    BudgetStatus, CreditLedger, CrmConnector, DeliveryAdapter, NoticeAction, Notifier,
    OperatorNotice, TurnContext,
};
pub use directory::{AgentDirectory, StaticAgentDirectory};
pub use escalations::{EscalationService, EscalationServiceError};
pub use invoker::{InvokerConfig, InvokerError, InvokerOutcome, RetryFallbackInvoker};
pub use llm::{ChatTurn, ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage, ToolCall, ToolSpec};
pub use orchestrator::{InboundMessage, TurnError, TurnOrchestrator, TurnOutcome};
pub use tools::{in_scope, scoped_specs, ToolExecutor, ToolOutcome, ToolRegistry};
