use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::session::{AgentId, OrgId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Completed,
    Failed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are never executed or transitioned again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Completed | Self::Failed)
    }
}

/// One pending, sensitive tool invocation awaiting operator sign-off.
/// Created by the orchestrator in place of direct execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    /// Tool name the model asked for.
    pub action_kind: String,
    /// Tool arguments exactly as the model produced them.
    pub payload_json: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    /// Tool output (or error text) once execution ran.
    pub result_json: Option<String>,
}

/// Append-only audit row; prior states are preserved here rather than
/// being mutated away on the request itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalAuditEvent {
    pub id: String,
    pub approval_id: ApprovalId,
    pub from_status: Option<ApprovalStatus>,
    pub to_status: ApprovalStatus,
    pub actor: String,
    pub note: Option<String>,
    /// SHA-256 of the action payload at transition time.
    pub payload_hash: String,
    pub occurred_at: DateTime<Utc>,
}

/// Hex SHA-256 of an action payload, recorded on every audit row so a
/// payload edited after the fact no longer matches its trail.
pub fn payload_hash(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
