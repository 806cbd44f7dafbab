use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    TakenOver,
    Resolved,
    Dismissed,
    TimedOut,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::TakenOver => "taken_over",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "taken_over" => Some(Self::TakenOver),
            "resolved" => Some(Self::Resolved),
            "dismissed" => Some(Self::Dismissed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed | Self::TimedOut)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ExplicitRequest,
    BlockedTopic,
    NegativeSentiment,
    Uncertainty,
    ResponseLoop,
    ToolFailures,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRequest => "explicit_request",
            Self::BlockedTopic => "blocked_topic",
            Self::NegativeSentiment => "negative_sentiment",
            Self::Uncertainty => "uncertainty",
            Self::ResponseLoop => "response_loop",
            Self::ToolFailures => "tool_failures",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit_request" => Some(Self::ExplicitRequest),
            "blocked_topic" => Some(Self::BlockedTopic),
            "negative_sentiment" => Some(Self::NegativeSentiment),
            "uncertainty" => Some(Self::Uncertainty),
            "response_loop" => Some(Self::ResponseLoop),
            "tool_failures" => Some(Self::ToolFailures),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One human-intervention episode, embedded in the session. At most one
/// may be active (pending or taken over) at a time; terminal episodes
/// permit a fresh one to be created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub status: EscalationStatus,
    pub trigger: TriggerType,
    pub urgency: Urgency,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
    pub responder_id: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    /// Provider-side message ids of the fan-out notifications, kept so
    /// quick-action callbacks can be correlated back to this episode.
    pub notification_refs: Vec<String>,
    /// Set once the one high-urgency reminder has gone out.
    pub reminder_sent_at: Option<DateTime<Utc>>,
}

impl EscalationState {
    pub fn new(
        trigger: TriggerType,
        urgency: Urgency,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: EscalationStatus::Pending,
            trigger,
            urgency,
            reason: reason.into(),
            escalated_at: now,
            responder_id: None,
            responded_at: None,
            notification_refs: Vec::new(),
            reminder_sent_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}
