pub mod config;
pub mod dead_letter;
pub mod domain;
pub mod escalation;
pub mod tool_failure;

pub use dead_letter::{DeadLetterConfig, DeadLetterEngine, RetryDisposition};
pub use domain::agent_profile::{AgentProfile, AutonomyMode, EffectiveAgent, FaqEntry};
pub use domain::approval::{ApprovalAuditEvent, ApprovalId, ApprovalRequest, ApprovalStatus};
pub use domain::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStatus};
pub use domain::escalation::{EscalationState, EscalationStatus, TriggerType, Urgency};
pub use domain::session::{
    AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionErrorState,
    SessionId, SessionMessage, SessionStatus, TeamState,
};
pub use escalation::{
    resolve, EscalationEngine, EscalationEngineConfig, EscalationError, EscalationPolicy,
    EscalationSignal, PolicyOverride, ReplyCounters, Transition,
};
pub use tool_failure::{FailureRecord, ToolFailureConfig, ToolFailureTracker};
