//! Dead letter retry engine.
//!
//! Pure scheduling logic for outbound messages that exhausted channel
//! delivery: capped exponential backoff, terminal abandonment at the
//! attempt cap. Persistence and redelivery live with the callers.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStatus};
use crate::domain::session::{ChannelKind, ContactId, OrgId, SessionId};

#[derive(Clone, Debug)]
pub struct DeadLetterConfig {
    pub base_delay_seconds: i64,
    /// Entries become abandoned once attempts reach this cap.
    pub max_attempts: u32,
    /// Backoff doubles per attempt up to 2^cap_exponent.
    pub backoff_cap_exponent: u32,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_attempts: 10,
            backoff_cap_exponent: 5,
            sweep_interval_seconds: 300,
            sweep_batch_size: 50,
        }
    }
}

/// What the sweep should do with an entry after a failed redelivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Entry rescheduled; try again at `next_retry_at`.
    Rescheduled,
    /// Attempt cap reached; entry kept for audit, owner notified.
    Abandoned,
}

#[derive(Clone, Debug, Default)]
pub struct DeadLetterEngine {
    config: DeadLetterConfig,
}

impl DeadLetterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DeadLetterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Capture a failed delivery. The original attempt counts as the first.
    pub fn enqueue(
        &self,
        org_id: OrgId,
        channel: ChannelKind,
        recipient: ContactId,
        content: impl Into<String>,
        error: impl Into<String>,
        session_id: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> DeadLetterEntry {
        DeadLetterEntry {
            id: DeadLetterId(Uuid::new_v4().to_string()),
            org_id,
            channel,
            recipient,
            content: content.into(),
            session_id,
            status: DeadLetterStatus::Queued,
            attempts: 1,
            last_error: error.into(),
            first_attempt_at: now,
            last_attempt_at: now,
            next_retry_at: now + Duration::seconds(self.config.base_delay_seconds),
        }
    }

    /// Delay before the next retry given the attempt count so far:
    /// `base * 2^min(attempts - 1, cap)`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(self.config.backoff_cap_exponent);
        Duration::seconds(self.config.base_delay_seconds * (1_i64 << exponent))
    }

    /// Record another failed redelivery: bump attempts, reschedule with
    /// backoff, or abandon at the cap.
    pub fn record_failure(
        &self,
        mut entry: DeadLetterEntry,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> (DeadLetterEntry, RetryDisposition) {
        entry.attempts += 1;
        entry.last_error = error.into();
        entry.last_attempt_at = now;

        if entry.attempts >= self.config.max_attempts {
            entry.status = DeadLetterStatus::Abandoned;
            return (entry, RetryDisposition::Abandoned);
        }

        entry.next_retry_at = now + self.backoff_delay(entry.attempts);
        (entry, RetryDisposition::Rescheduled)
    }

    /// Select entries the sweep should attempt now, oldest first, bounded
    /// by the batch size. Abandoned entries are never selected.
    pub fn due_entries(
        &self,
        entries: Vec<DeadLetterEntry>,
        now: DateTime<Utc>,
    ) -> Vec<DeadLetterEntry> {
        let mut due: Vec<DeadLetterEntry> = entries
            .into_iter()
            .filter(|entry| {
                entry.status == DeadLetterStatus::Queued && entry.next_retry_at <= now
            })
            .collect();
        due.sort_by(|left, right| left.next_retry_at.cmp(&right.next_retry_at));
        due.truncate(self.config.sweep_batch_size as usize);
        due
    }
}
