//! Escalation lifecycle engine.
//!
//! Pure state machine over the escalation episode embedded in a session:
//! `pending -> {taken_over, dismissed, timed_out}`, `taken_over -> resolved`.
//! Quick-action transitions are idempotent; repeating one that already
//! happened is a no-op instead of an error.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::domain::escalation::{EscalationState, EscalationStatus, TriggerType, Urgency};
use crate::domain::session::{AgentSession, SessionStatus};

#[derive(Clone, Debug)]
pub struct EscalationEngineConfig {
    /// Pending episodes older than this are timed out by the sweep.
    pub pending_timeout_minutes: i64,
    /// Delay before the one reminder a high-urgency episode schedules.
    pub reminder_delay_minutes: i64,
}

impl Default for EscalationEngineConfig {
    fn default() -> Self {
        Self { pending_timeout_minutes: 30, reminder_delay_minutes: 5 }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EscalationError {
    #[error("session already has an active escalation ({status:?})")]
    AlreadyActive { status: EscalationStatus },
    #[error("session has no escalation episode")]
    NoEpisode,
    #[error("cannot {action} an escalation in status {status:?}")]
    InvalidTransition { action: &'static str, status: EscalationStatus },
}

/// Result of applying a transition: the updated session plus whether the
/// call actually changed anything (false for idempotent repeats).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub session: AgentSession,
    pub changed: bool,
}

impl Transition {
    fn applied(session: AgentSession) -> Self {
        Self { session, changed: true }
    }

    fn noop(session: AgentSession) -> Self {
        Self { session, changed: false }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EscalationEngine {
    config: EscalationEngineConfig,
}

impl EscalationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EscalationEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationEngineConfig {
        &self.config
    }

    /// Open a fresh episode. Rejected while another one is active; a
    /// terminal prior episode is replaced.
    pub fn create(
        &self,
        mut session: AgentSession,
        trigger: TriggerType,
        urgency: Urgency,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentSession, EscalationError> {
        if let Some(existing) = &session.escalation {
            if existing.is_active() {
                return Err(EscalationError::AlreadyActive { status: existing.status });
            }
        }

        session.escalation = Some(EscalationState::new(trigger, urgency, reason, now));
        session.updated_at = now;
        Ok(session)
    }

    /// Operator (or quick action) claims the conversation. Marks the
    /// session handed off; the model is bypassed until resolution.
    pub fn take_over(
        &self,
        mut session: AgentSession,
        responder_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationError> {
        let episode = session.escalation.as_mut().ok_or(EscalationError::NoEpisode)?;

        match episode.status {
            EscalationStatus::Pending => {
                episode.status = EscalationStatus::TakenOver;
                episode.responder_id = Some(responder_id.into());
                episode.responded_at = Some(now);
                session.status = SessionStatus::HandedOff;
                session.updated_at = now;
                Ok(Transition::applied(session))
            }
            EscalationStatus::TakenOver => Ok(Transition::noop(session)),
            status => Err(EscalationError::InvalidTransition { action: "take over", status }),
        }
    }

    /// False positive: drop a pending episode, session stays automated.
    pub fn dismiss(
        &self,
        mut session: AgentSession,
        actor_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationError> {
        let episode = session.escalation.as_mut().ok_or(EscalationError::NoEpisode)?;

        match episode.status {
            EscalationStatus::Pending => {
                episode.status = EscalationStatus::Dismissed;
                episode.responder_id = Some(actor_id.into());
                episode.responded_at = Some(now);
                session.updated_at = now;
                Ok(Transition::applied(session))
            }
            EscalationStatus::Dismissed => Ok(Transition::noop(session)),
            status => Err(EscalationError::InvalidTransition { action: "dismiss", status }),
        }
    }

    /// Hand-off ends; the session returns to automated operation.
    pub fn resolve(
        &self,
        mut session: AgentSession,
        actor_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationError> {
        let episode = session.escalation.as_mut().ok_or(EscalationError::NoEpisode)?;

        match episode.status {
            EscalationStatus::TakenOver => {
                episode.status = EscalationStatus::Resolved;
                episode.responder_id = Some(actor_id.into());
                episode.responded_at = Some(now);
                session.status = SessionStatus::Active;
                session.updated_at = now;
                Ok(Transition::applied(session))
            }
            EscalationStatus::Resolved => Ok(Transition::noop(session)),
            status => Err(EscalationError::InvalidTransition { action: "resolve", status }),
        }
    }

    /// Sweep transition: pending episodes older than the timeout go to
    /// timed_out so the customer is not stranded. No-op otherwise.
    pub fn expire_if_stale(&self, mut session: AgentSession, now: DateTime<Utc>) -> Transition {
        let Some(episode) = session.escalation.as_mut() else {
            return Transition::noop(session);
        };
        if episode.status != EscalationStatus::Pending {
            return Transition::noop(session);
        }

        let deadline =
            episode.escalated_at + Duration::minutes(self.config.pending_timeout_minutes);
        if now < deadline {
            return Transition::noop(session);
        }

        episode.status = EscalationStatus::TimedOut;
        session.status = SessionStatus::Active;
        session.updated_at = now;
        Transition::applied(session)
    }

    /// High-urgency episodes get exactly one reminder once the delay has
    /// elapsed and nobody has responded. Anything else is a no-op.
    pub fn reminder_due(&self, session: &AgentSession, now: DateTime<Utc>) -> bool {
        session.escalation.as_ref().is_some_and(|episode| {
            episode.status == EscalationStatus::Pending
                && episode.urgency == Urgency::High
                && episode.reminder_sent_at.is_none()
                && now
                    >= episode.escalated_at
                        + Duration::minutes(self.config.reminder_delay_minutes)
        })
    }

    pub fn mark_reminder_sent(&self, mut session: AgentSession, now: DateTime<Utc>) -> Transition {
        match session.escalation.as_mut() {
            Some(episode)
                if episode.status == EscalationStatus::Pending
                    && episode.reminder_sent_at.is_none() =>
            {
                episode.reminder_sent_at = Some(now);
                session.updated_at = now;
                Transition::applied(session)
            }
            _ => Transition::noop(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{EscalationEngine, EscalationEngineConfig, EscalationError};
    use crate::domain::escalation::{EscalationStatus, TriggerType, Urgency};
    use crate::domain::session::{
        AgentId, AgentSession, ChannelKind, ContactId, OrgId, SessionId, SessionStatus,
    };

    fn session() -> AgentSession {
        AgentSession::new(
            SessionId("s-1".to_string()),
            OrgId("org-1".to_string()),
            AgentId("agent-1".to_string()),
            ChannelKind::Whatsapp,
            ContactId("+15550001".to_string()),
            Utc::now(),
        )
    }

    fn escalated_session() -> AgentSession {
        EscalationEngine::new()
            .create(
                session(),
                TriggerType::ExplicitRequest,
                Urgency::Normal,
                "customer asked",
                Utc::now(),
            )
            .expect("create")
    }

    #[test]
    fn create_rejects_while_an_episode_is_active() {
        let engine = EscalationEngine::new();
        let escalated = escalated_session();

        let error = engine
            .create(
                escalated.clone(),
                TriggerType::NegativeSentiment,
                Urgency::High,
                "angry",
                Utc::now(),
            )
            .expect_err("second create must fail");
        assert_eq!(error, EscalationError::AlreadyActive { status: EscalationStatus::Pending });

        let taken = engine.take_over(escalated, "op-1", Utc::now()).expect("take over").session;
        let error = engine
            .create(taken, TriggerType::NegativeSentiment, Urgency::High, "angry", Utc::now())
            .expect_err("create during hand-off must fail");
        assert_eq!(error, EscalationError::AlreadyActive { status: EscalationStatus::TakenOver });
    }

    #[test]
    fn terminal_episode_permits_a_fresh_one() {
        let engine = EscalationEngine::new();
        let dismissed =
            engine.dismiss(escalated_session(), "op-1", Utc::now()).expect("dismiss").session;

        let recreated = engine
            .create(dismissed, TriggerType::Uncertainty, Urgency::Low, "unsure", Utc::now())
            .expect("terminal episode should allow a new one");
        assert_eq!(
            recreated.escalation.expect("episode").trigger,
            TriggerType::Uncertainty
        );
    }

    #[test]
    fn take_over_hands_the_session_off_and_is_idempotent() {
        let engine = EscalationEngine::new();
        let taken =
            engine.take_over(escalated_session(), "op-1", Utc::now()).expect("take over");
        assert!(taken.changed);
        assert_eq!(taken.session.status, SessionStatus::HandedOff);

        let repeat = engine.take_over(taken.session, "op-2", Utc::now()).expect("repeat");
        assert!(!repeat.changed, "second take-over is a quick-action no-op");
        assert_eq!(
            repeat.session.escalation.expect("episode").responder_id.as_deref(),
            Some("op-1"),
            "no-op must not steal the episode"
        );
    }

    #[test]
    fn resolve_only_applies_after_take_over() {
        let engine = EscalationEngine::new();

        let error = engine
            .resolve(escalated_session(), "op-1", Utc::now())
            .expect_err("resolving a pending episode is invalid");
        assert!(matches!(error, EscalationError::InvalidTransition { action: "resolve", .. }));

        let taken = engine.take_over(escalated_session(), "op-1", Utc::now()).expect("take over");
        let resolved = engine.resolve(taken.session, "op-1", Utc::now()).expect("resolve");
        assert!(resolved.changed);
        assert_eq!(resolved.session.status, SessionStatus::Active);

        let repeat = engine.resolve(resolved.session, "op-1", Utc::now()).expect("repeat");
        assert!(!repeat.changed, "resolving twice is a no-op");
    }

    #[test]
    fn dismiss_is_only_valid_from_pending() {
        let engine = EscalationEngine::new();
        let taken = engine.take_over(escalated_session(), "op-1", Utc::now()).expect("take over");

        let error = engine
            .dismiss(taken.session, "op-1", Utc::now())
            .expect_err("dismissing a taken-over episode is invalid");
        assert!(matches!(error, EscalationError::InvalidTransition { action: "dismiss", .. }));
    }

    #[test]
    fn expire_times_out_only_stale_pending_episodes() {
        let engine = EscalationEngine::with_config(EscalationEngineConfig {
            pending_timeout_minutes: 30,
            reminder_delay_minutes: 5,
        });

        let mut stale = escalated_session();
        stale.escalation.as_mut().expect("episode").escalated_at =
            Utc::now() - Duration::minutes(31);
        let expired = engine.expire_if_stale(stale, Utc::now());
        assert!(expired.changed);
        let episode = expired.session.escalation.expect("episode");
        assert_eq!(episode.status, EscalationStatus::TimedOut);
        assert_eq!(expired.session.status, SessionStatus::Active);

        let fresh = engine.expire_if_stale(escalated_session(), Utc::now());
        assert!(!fresh.changed, "a fresh pending episode must not expire");
    }

    #[test]
    fn reminder_fires_once_for_stale_pending_high_urgency_episodes() {
        let engine = EscalationEngine::new();
        let now = Utc::now();

        let mut urgent = EscalationEngine::new()
            .create(session(), TriggerType::NegativeSentiment, Urgency::High, "angry", now)
            .expect("create");
        assert!(!engine.reminder_due(&urgent, now), "delay has not elapsed yet");

        urgent.escalation.as_mut().expect("episode").escalated_at = now - Duration::minutes(6);
        assert!(engine.reminder_due(&urgent, now));

        let reminded = engine.mark_reminder_sent(urgent, now);
        assert!(reminded.changed);
        assert!(!engine.reminder_due(&reminded.session, now), "only one reminder goes out");

        let mut normal = escalated_session();
        normal.escalation.as_mut().expect("episode").escalated_at = now - Duration::minutes(6);
        assert!(!engine.reminder_due(&normal, now), "normal urgency never reminds");

        let taken = engine.take_over(escalated_session(), "op-1", now).expect("take over");
        assert!(!engine.reminder_due(&taken.session, now));
    }
}
