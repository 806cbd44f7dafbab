pub mod detector;
pub mod policy;
pub mod state_machine;

pub use detector::{
    jaccard_similarity, post_call_check, pre_call_check, tool_failure_check, EscalationSignal,
    ReplyCounters,
};
pub use policy::{resolve, CategoryOverride, EscalationPolicy, PolicyOverride};
pub use state_machine::{EscalationEngine, EscalationEngineConfig, EscalationError, Transition};
