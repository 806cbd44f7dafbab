//! Callback tokens operators post back from notification buttons.
//!
//! The token format is `<domain>:<verb>:<id>`. Tokens travel through
//! third-party chat providers, so parsing is strict: anything that does
//! not match a known verb is rejected.

use liaison_core::domain::approval::ApprovalId;
use liaison_core::domain::session::SessionId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuickAction {
    TakeOver { session_id: SessionId },
    Dismiss { session_id: SessionId },
    Resolve { session_id: SessionId },
    Approve { approval_id: ApprovalId },
    Reject { approval_id: ApprovalId },
}

impl QuickAction {
    pub fn parse(callback: &str) -> Option<Self> {
        let mut parts = callback.splitn(3, ':');
        let domain = parts.next()?;
        let verb = parts.next()?;
        let id = parts.next()?;
        if id.is_empty() {
            return None;
        }

        match (domain, verb) {
            ("esc", "take_over") => {
                Some(Self::TakeOver { session_id: SessionId(id.to_string()) })
            }
            ("esc", "dismiss") => Some(Self::Dismiss { session_id: SessionId(id.to_string()) }),
            ("esc", "resolve") => Some(Self::Resolve { session_id: SessionId(id.to_string()) }),
            ("appr", "approve") => {
                Some(Self::Approve { approval_id: ApprovalId(id.to_string()) })
            }
            ("appr", "reject") => Some(Self::Reject { approval_id: ApprovalId(id.to_string()) }),
            _ => None,
        }
    }

    pub fn callback(&self) -> String {
        match self {
            Self::TakeOver { session_id } => format!("esc:take_over:{}", session_id.0),
            Self::Dismiss { session_id } => format!("esc:dismiss:{}", session_id.0),
            Self::Resolve { session_id } => format!("esc:resolve:{}", session_id.0),
            Self::Approve { approval_id } => format!("appr:approve:{}", approval_id.0),
            Self::Reject { approval_id } => format!("appr:reject:{}", approval_id.0),
        }
    }
}
