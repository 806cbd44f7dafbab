use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{ChannelKind, ContactId, OrgId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Queued,
    /// Attempt cap reached; retained for audit, never retried again.
    Abandoned,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// One outbound message that exhausted channel-level delivery. Deleted on
/// successful redelivery; marked abandoned after the attempt cap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub org_id: OrgId,
    pub channel: ChannelKind,
    pub recipient: ContactId,
    pub content: String,
    pub session_id: Option<SessionId>,
    pub status: DeadLetterStatus,
    pub attempts: u32,
    pub last_error: String,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::DeadLetterStatus;

    #[test]
    fn status_round_trips_from_storage_encoding() {
        for status in [DeadLetterStatus::Queued, DeadLetterStatus::Abandoned] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()), Some(status));
        }
    }
}
