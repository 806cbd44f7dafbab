use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::session::{AgentId, ChannelKind, OrgId};
use crate::escalation::policy::PolicyOverride;

/// How much latitude the agent has before a human must sign off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Every tool executes directly.
    Autonomous,
    /// Tools listed in `tools_requiring_approval` go through the gate.
    Supervised,
    /// Every tool call goes through the gate.
    Gated,
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Supervised => "supervised",
            Self::Gated => "gated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "autonomous" => Some(Self::Autonomous),
            "supervised" => Some(Self::Supervised),
            "gated" => Some(Self::Gated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

/// Per-agent configuration the orchestrator works from. Sparse fields fall
/// back to organization defaults at resolution time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub org_id: OrgId,
    pub name: String,
    pub channel: ChannelKind,
    pub persona: String,
    pub language: String,
    pub faq: Vec<FaqEntry>,
    pub blocked_topics: Vec<String>,
    pub autonomy: AutonomyMode,
    /// Empty means "everything the org allows".
    pub allowed_tools: BTreeSet<String>,
    pub denied_tools: BTreeSet<String>,
    pub tools_requiring_approval: BTreeSet<String>,
    pub escalation_overrides: PolicyOverride,
    pub model_candidates: Vec<String>,
    pub daily_message_limit: u32,
    pub daily_cost_limit: Decimal,
    /// Template agents are cloned into ephemeral workers when a channel
    /// has no dedicated agent.
    pub is_template: bool,
}

/// Immutable snapshot of the configuration actually answering this turn.
///
/// Built fresh at team hand-off instead of patching the entry-point
/// profile in place.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveAgent {
    pub profile: AgentProfile,
    /// Set when a team hand-off swapped the responder.
    pub handed_off_from: Option<AgentId>,
}

impl EffectiveAgent {
    pub fn direct(profile: AgentProfile) -> Self {
        Self { profile, handed_off_from: None }
    }

    pub fn handed_off(profile: AgentProfile, entry_point: AgentId) -> Self {
        Self { profile, handed_off_from: Some(entry_point) }
    }
}
