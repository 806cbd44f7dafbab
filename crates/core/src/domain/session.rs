use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::escalation::EscalationState;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Channel-scoped identity of the customer (phone number, email address,
/// widget visitor id — whatever the channel uses).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Whatsapp,
    Email,
    WebChat,
    Sms,
    /// Non-delivering channel used by integration tests and previews.
    Test,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Email => "email",
            Self::WebChat => "web_chat",
            Self::Sms => "sms",
            Self::Test => "test",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Self::Whatsapp),
            "email" => Some(Self::Email),
            "web_chat" => Some(Self::WebChat),
            "sms" => Some(Self::Sms),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    /// Test channels accept messages but never deliver outbound.
    pub fn delivers(&self) -> bool {
        !matches!(self, Self::Test)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    HandedOff,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::HandedOff => "handed_off",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "handed_off" => Some(Self::HandedOff),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Customer,
    Agent,
    Operator,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Self::Customer),
            "agent" => Some(Self::Agent),
            "operator" => Some(Self::Operator),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One entry in the append-only conversation history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub role: MessageRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Per-tool failure bookkeeping embedded in the session.
///
/// Counts are consecutive failures within this session; a tool joins the
/// disabled set at the disable threshold and stays there until an operator
/// reset or a new session. Degraded mode is derived from the disabled set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorState {
    pub failure_counts: BTreeMap<String, u32>,
    pub disabled_tools: BTreeSet<String>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

impl SessionErrorState {
    pub fn is_empty(&self) -> bool {
        self.failure_counts.is_empty() && self.disabled_tools.is_empty() && !self.degraded
    }
}

/// Multi-agent team metadata: when a session belongs to a team thread,
/// the tagged-in responder answers instead of the entry-point agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamState {
    pub team_id: String,
    pub responder_agent_id: AgentId,
    pub tagged_in_at: DateTime<Utc>,
}

/// One conversation thread between a customer identity and an agent on a
/// channel. Never deleted; only `status` transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: SessionId,
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub channel: ChannelKind,
    pub contact_id: ContactId,
    pub status: SessionStatus,
    pub error_state: SessionErrorState,
    pub escalation: Option<EscalationState>,
    pub team: Option<TeamState>,
    /// Running count of uncertainty phrases across agent replies.
    pub uncertainty_count: u32,
    /// Last agent reply, kept for the two-reply loop-detection window.
    pub previous_reply: Option<String>,
    /// Optimistic concurrency token; bumped on every conditional save.
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        id: SessionId,
        org_id: OrgId,
        agent_id: AgentId,
        channel: ChannelKind,
        contact_id: ContactId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            org_id,
            agent_id,
            channel,
            contact_id,
            status: SessionStatus::Active,
            error_state: SessionErrorState::default(),
            escalation: None,
            team: None,
            uncertainty_count: 0,
            previous_reply: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// A session has an active escalation iff one exists in a live status.
    pub fn has_active_escalation(&self) -> bool {
        self.escalation.as_ref().is_some_and(EscalationState::is_active)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        AgentId, AgentSession, ChannelKind, ContactId, MessageRole, OrgId, SessionId,
        SessionStatus,
    };

    #[test]
    fn channel_kind_round_trips_from_storage_encoding() {
        let cases = [
            ChannelKind::Whatsapp,
            ChannelKind::Email,
            ChannelKind::WebChat,
            ChannelKind::Sms,
            ChannelKind::Test,
        ];

        for channel in cases {
            assert_eq!(ChannelKind::parse(channel.as_str()), Some(channel));
        }
    }

    #[test]
    fn only_test_channel_skips_delivery() {
        assert!(!ChannelKind::Test.delivers());
        assert!(ChannelKind::Whatsapp.delivers());
        assert!(ChannelKind::Email.delivers());
    }

    #[test]
    fn status_and_role_round_trip() {
        assert_eq!(SessionStatus::parse("handed_off"), Some(SessionStatus::HandedOff));
        assert_eq!(MessageRole::parse("operator"), Some(MessageRole::Operator));
        assert_eq!(MessageRole::parse("robot"), None);
    }

    #[test]
    fn new_session_starts_active_without_escalation() {
        let session = AgentSession::new(
            SessionId("s-1".to_string()),
            OrgId("org-1".to_string()),
            AgentId("agent-1".to_string()),
            ChannelKind::WebChat,
            ContactId("visitor-9".to_string()),
            Utc::now(),
        );

        assert_eq!(session.status, SessionStatus::Active);
        assert!(!session.has_active_escalation());
        assert!(session.error_state.is_empty());
        assert_eq!(session.state_version, 1);
    }
}
