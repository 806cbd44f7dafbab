//! Human-intervention episodes: opening, quick actions, and sweeps.
//!
//! The pure lifecycle lives in the state-machine engine; this service adds
//! persistence with optimistic concurrency and the operator fan-out. Quick
//! actions and sweeps race each other, so every write is conditional on
//! the session version read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use liaison_core::domain::escalation::{TriggerType, Urgency};
use liaison_core::domain::session::{AgentSession, SessionId};
use liaison_core::escalation::{EscalationEngine, EscalationError, Transition};
use liaison_db::repositories::{RepositoryError, SessionRepository};

use crate::context::{NoticeAction, Notifier, OperatorNotice};

const QUICK_ACTION_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum EscalationServiceError {
    #[error("session not found")]
    SessionNotFound,
    #[error(transparent)]
    Domain(#[from] EscalationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("session was modified concurrently, retries exhausted")]
    Conflict,
}

pub struct EscalationService {
    engine: EscalationEngine,
    sessions: Arc<dyn SessionRepository>,
    notifier: Arc<dyn Notifier>,
}

impl EscalationService {
    pub fn new(
        engine: EscalationEngine,
        sessions: Arc<dyn SessionRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { engine, sessions, notifier }
    }

    /// Open an episode on a session the caller owns and will persist.
    /// Operator fan-out happens here; the notification ids land on the
    /// episode so callbacks can be correlated.
    pub async fn open(
        &self,
        session: AgentSession,
        trigger: TriggerType,
        urgency: Urgency,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentSession, EscalationServiceError> {
        let reason = reason.into();
        let mut session = self.engine.create(session, trigger, urgency, reason.clone(), now)?;

        let notice = OperatorNotice {
            title: format!("Human needed on {}", session.channel.as_str()),
            body: format!("Customer {}: {}", session.contact_id.0, reason),
            urgency,
            actions: vec![
                NoticeAction {
                    label: "Take over".to_string(),
                    callback: format!("esc:take_over:{}", session.id.0),
                },
                NoticeAction {
                    label: "Dismiss".to_string(),
                    callback: format!("esc:dismiss:{}", session.id.0),
                },
            ],
        };

        match self.notifier.notify_operators(&session.org_id, &notice).await {
            Ok(refs) => {
                if let Some(episode) = session.escalation.as_mut() {
                    episode.notification_refs = refs;
                }
            }
            // The episode stands even if nobody was paged; the sweep and
            // the inbox views still surface it.
            Err(error) => {
                warn!(event_name = "escalation_notify_failed", session_id = %session.id.0, error = %error);
            }
        }

        info!(
            event_name = "escalation_opened",
            session_id = %session.id.0,
            trigger = trigger.as_str(),
            urgency = urgency.as_str(),
        );
        Ok(session)
    }

    pub async fn take_over(
        &self,
        session_id: &SessionId,
        responder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationServiceError> {
        self.apply(session_id, now, |engine, session| {
            engine.take_over(session, responder_id, now)
        })
        .await
    }

    pub async fn dismiss(
        &self,
        session_id: &SessionId,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationServiceError> {
        self.apply(session_id, now, |engine, session| engine.dismiss(session, actor_id, now))
            .await
    }

    pub async fn resolve(
        &self,
        session_id: &SessionId,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscalationServiceError> {
        self.apply(session_id, now, |engine, session| engine.resolve(session, actor_id, now))
            .await
    }

    /// Time out pending episodes nobody answered. Sessions that lose the
    /// conditional write are left for the next pass.
    pub async fn expire_sweep(
        &self,
        now: DateTime<Utc>,
        batch: u32,
    ) -> Result<u32, EscalationServiceError> {
        let pending = self.sessions.list_pending_escalations(batch).await?;
        let mut expired = 0;

        for session in pending {
            let version = session.state_version;
            let transition = self.engine.expire_if_stale(session, now);
            if !transition.changed {
                continue;
            }
            if self.sessions.save_if_version(&transition.session, version).await? {
                expired += 1;
                info!(
                    event_name = "escalation_timed_out",
                    session_id = %transition.session.id.0,
                );
            }
        }

        Ok(expired)
    }

    /// One reminder per unanswered high-urgency episode once the delay
    /// has elapsed.
    pub async fn reminder_sweep(
        &self,
        now: DateTime<Utc>,
        batch: u32,
    ) -> Result<u32, EscalationServiceError> {
        let pending = self.sessions.list_pending_escalations(batch).await?;
        let mut reminded = 0;

        for session in pending {
            if !self.engine.reminder_due(&session, now) {
                continue;
            }

            let version = session.state_version;
            let notice = OperatorNotice {
                title: "Reminder: escalation still waiting".to_string(),
                body: format!(
                    "Customer {} has been waiting since {}.",
                    session.contact_id.0,
                    session
                        .escalation
                        .as_ref()
                        .map(|episode| episode.escalated_at.to_rfc3339())
                        .unwrap_or_default()
                ),
                urgency: Urgency::High,
                actions: vec![NoticeAction {
                    label: "Take over".to_string(),
                    callback: format!("esc:take_over:{}", session.id.0),
                }],
            };

            if let Err(error) = self.notifier.notify_operators(&session.org_id, &notice).await {
                warn!(event_name = "escalation_reminder_failed", session_id = %session.id.0, error = %error);
                continue;
            }

            let transition = self.engine.mark_reminder_sent(session, now);
            if transition.changed
                && self.sessions.save_if_version(&transition.session, version).await?
            {
                reminded += 1;
            }
        }

        Ok(reminded)
    }

    async fn apply<F>(
        &self,
        session_id: &SessionId,
        _now: DateTime<Utc>,
        operation: F,
    ) -> Result<Transition, EscalationServiceError>
    where
        F: Fn(&EscalationEngine, AgentSession) -> Result<Transition, EscalationError>,
    {
        for _ in 0..QUICK_ACTION_RETRIES {
            let session = self
                .sessions
                .find_by_id(session_id)
                .await?
                .ok_or(EscalationServiceError::SessionNotFound)?;
            let version = session.state_version;

            let transition = operation(&self.engine, session)?;
            if !transition.changed {
                return Ok(transition);
            }
            if self.sessions.save_if_version(&transition.session, version).await? {
                return Ok(transition);
            }
        }

        Err(EscalationServiceError::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use tokio::sync::Mutex;

    use liaison_core::domain::escalation::{EscalationStatus, TriggerType, Urgency};
    use liaison_core::domain::session::{
        AgentId, AgentSession, ChannelKind, ContactId, OrgId, SessionId, SessionStatus,
    };
    use liaison_core::escalation::EscalationEngine;
    use liaison_db::repositories::{InMemorySessionRepository, SessionRepository};

    use super::{EscalationService, EscalationServiceError};
    use crate::context::{Notifier, OperatorNotice};

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<OperatorNotice>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_operators(
            &self,
            _org_id: &OrgId,
            notice: &OperatorNotice,
        ) -> Result<Vec<String>> {
            let mut notices = self.notices.lock().await;
            notices.push(notice.clone());
            Ok(vec![format!("msg-{}", notices.len())])
        }
    }

    fn sample_session(id: &str) -> AgentSession {
        AgentSession::new(
            SessionId(id.to_string()),
            OrgId("org-1".to_string()),
            AgentId("agent-1".to_string()),
            ChannelKind::Whatsapp,
            ContactId("+15550001".to_string()),
            Utc::now(),
        )
    }

    fn service() -> (EscalationService, Arc<InMemorySessionRepository>, Arc<RecordingNotifier>) {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = EscalationService::new(
            EscalationEngine::new(),
            sessions.clone(),
            notifier.clone(),
        );
        (service, sessions, notifier)
    }

    #[tokio::test]
    async fn open_fans_out_and_records_notification_refs() {
        let (service, _, notifier) = service();

        let session = service
            .open(
                sample_session("s-1"),
                TriggerType::ExplicitRequest,
                Urgency::Normal,
                "customer asked for a human",
                Utc::now(),
            )
            .await
            .expect("open");

        let episode = session.escalation.expect("episode");
        assert_eq!(episode.status, EscalationStatus::Pending);
        assert_eq!(episode.notification_refs, vec!["msg-1".to_string()]);

        let notices = notifier.notices.lock().await;
        assert_eq!(notices.len(), 1);
        assert!(notices[0].actions.iter().any(|a| a.callback == "esc:take_over:s-1"));
        assert!(notices[0].actions.iter().any(|a| a.callback == "esc:dismiss:s-1"));
    }

    #[tokio::test]
    async fn take_over_persists_and_repeats_as_a_noop() {
        let (service, sessions, _) = service();
        let escalated = service
            .open(
                sample_session("s-1"),
                TriggerType::NegativeSentiment,
                Urgency::High,
                "angry",
                Utc::now(),
            )
            .await
            .expect("open");
        sessions.save(escalated).await.expect("save");

        let first = service
            .take_over(&SessionId("s-1".to_string()), "op-1", Utc::now())
            .await
            .expect("take over");
        assert!(first.changed);
        assert_eq!(first.session.status, SessionStatus::HandedOff);

        let second = service
            .take_over(&SessionId("s-1".to_string()), "op-2", Utc::now())
            .await
            .expect("repeat");
        assert!(!second.changed, "double-tap on the quick action is a no-op");

        let stored = sessions
            .find_by_id(&SessionId("s-1".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(
            stored.escalation.expect("episode").responder_id.as_deref(),
            Some("op-1")
        );
    }

    #[tokio::test]
    async fn quick_action_on_a_missing_session_is_an_error() {
        let (service, _, _) = service();
        let error = service
            .take_over(&SessionId("nope".to_string()), "op-1", Utc::now())
            .await
            .expect_err("missing session");
        assert!(matches!(error, EscalationServiceError::SessionNotFound));
    }

    #[tokio::test]
    async fn expire_sweep_times_out_only_stale_episodes() {
        let (service, sessions, _) = service();

        let mut stale = service
            .open(
                sample_session("s-stale"),
                TriggerType::Uncertainty,
                Urgency::Low,
                "unsure",
                Utc::now(),
            )
            .await
            .expect("open");
        stale.escalation.as_mut().expect("episode").escalated_at =
            Utc::now() - Duration::minutes(31);
        sessions.save(stale).await.expect("save stale");

        let fresh = service
            .open(
                sample_session("s-fresh"),
                TriggerType::Uncertainty,
                Urgency::Low,
                "unsure",
                Utc::now(),
            )
            .await
            .expect("open");
        sessions.save(fresh).await.expect("save fresh");

        let expired = service.expire_sweep(Utc::now(), 50).await.expect("sweep");
        assert_eq!(expired, 1);

        let stored = sessions
            .find_by_id(&SessionId("s-stale".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(
            stored.escalation.expect("episode").status,
            EscalationStatus::TimedOut
        );
        assert_eq!(stored.status, SessionStatus::Active, "the agent resumes");
    }

    #[tokio::test]
    async fn reminder_sweep_pages_once_per_high_urgency_episode() {
        let (service, sessions, notifier) = service();

        let mut urgent = service
            .open(
                sample_session("s-1"),
                TriggerType::NegativeSentiment,
                Urgency::High,
                "angry",
                Utc::now(),
            )
            .await
            .expect("open");
        urgent.escalation.as_mut().expect("episode").escalated_at =
            Utc::now() - Duration::minutes(6);
        sessions.save(urgent).await.expect("save");

        let first = service.reminder_sweep(Utc::now(), 50).await.expect("first sweep");
        assert_eq!(first, 1);

        let second = service.reminder_sweep(Utc::now(), 50).await.expect("second sweep");
        assert_eq!(second, 0, "the reminder goes out once");

        // Open fan-out plus one reminder.
        assert_eq!(notifier.notices.lock().await.len(), 2);
    }
}
