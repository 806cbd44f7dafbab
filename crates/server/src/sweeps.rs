//! Background sweeps: dead-letter redelivery, escalation expiry and
//! reminders, approval expiry.
//!
//! Each sweep is a plain async function over the shared wiring so tests
//! can drive a single pass; `spawn` puts them on their intervals. A sweep
//! pass that errors is logged and retried on the next tick, never fatal.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use liaison_agent::approval_gate::ApprovalGate;
use liaison_agent::context::{NoticeAction, OperatorNotice, TurnContext};
use liaison_agent::escalations::EscalationService;
use liaison_core::config::SweepConfig;
use liaison_core::dead_letter::{DeadLetterEngine, RetryDisposition};
use liaison_core::domain::escalation::Urgency;

/// Counts from one dead-letter pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeadLetterSweepReport {
    pub redelivered: u32,
    pub rescheduled: u32,
    pub abandoned: u32,
}

pub async fn run_dead_letter_sweep(
    context: &TurnContext,
    engine: &DeadLetterEngine,
) -> anyhow::Result<DeadLetterSweepReport> {
    let now = Utc::now();
    let batch = engine.config().sweep_batch_size;
    let due = context.dead_letters.find_due(now, batch).await?;

    let mut report = DeadLetterSweepReport::default();
    for entry in due {
        match context.delivery.deliver(entry.channel, &entry.recipient, &entry.content).await {
            Ok(message_id) => {
                context.dead_letters.delete(&entry.id).await?;
                report.redelivered += 1;
                info!(
                    event_name = "dead_letter_redelivered",
                    entry_id = %entry.id.0,
                    message_id = %message_id,
                    attempts = entry.attempts,
                );
            }
            Err(error) => {
                let (updated, disposition) =
                    engine.record_failure(entry, error.to_string(), Utc::now());
                context.dead_letters.save(updated.clone()).await?;

                match disposition {
                    RetryDisposition::Rescheduled => report.rescheduled += 1,
                    RetryDisposition::Abandoned => {
                        report.abandoned += 1;
                        warn!(
                            event_name = "dead_letter_abandoned",
                            entry_id = %updated.id.0,
                            attempts = updated.attempts,
                            last_error = %updated.last_error,
                        );

                        let notice = OperatorNotice {
                            title: format!("Message to {} undeliverable", updated.recipient.0),
                            body: format!(
                                "Gave up after {} attempts on {}: {}",
                                updated.attempts,
                                updated.channel.as_str(),
                                updated.last_error,
                            ),
                            urgency: Urgency::Normal,
                            actions: updated
                                .session_id
                                .as_ref()
                                .map(|session_id| NoticeAction {
                                    label: "Take over".to_string(),
                                    callback: format!("esc:take_over:{}", session_id.0),
                                })
                                .into_iter()
                                .collect(),
                        };
                        if let Err(error) =
                            context.notifier.notify_operators(&updated.org_id, &notice).await
                        {
                            warn!(
                                event_name = "dead_letter_notify_failed",
                                entry_id = %updated.id.0,
                                error = %error,
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(report)
}

pub async fn run_escalation_sweep(
    escalations: &EscalationService,
    batch: u32,
) -> anyhow::Result<(u32, u32)> {
    let now = Utc::now();
    let expired = escalations.expire_sweep(now, batch).await?;
    let reminded = escalations.reminder_sweep(now, batch).await?;
    Ok((expired, reminded))
}

pub async fn run_approval_sweep(gate: &ApprovalGate, batch: u32) -> anyhow::Result<u32> {
    let expired = gate.expire_due(Utc::now(), batch).await?;
    Ok(expired.len() as u32)
}

const ESCALATION_SWEEP_BATCH: u32 = 50;
const APPROVAL_SWEEP_BATCH: u32 = 50;

/// Put the three sweeps on their configured intervals.
pub fn spawn(
    config: &SweepConfig,
    context: TurnContext,
    escalations: Arc<EscalationService>,
    gate: Arc<ApprovalGate>,
) -> Vec<JoinHandle<()>> {
    let dead_letter_interval = config.dead_letter_interval_secs;
    let escalation_interval = config.escalation_expiry_interval_secs;
    let approval_interval = config.approval_expiry_interval_secs;

    let dead_letter_task = tokio::spawn(async move {
        let engine = DeadLetterEngine::new();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(dead_letter_interval.max(1)));
        loop {
            ticker.tick().await;
            match run_dead_letter_sweep(&context, &engine).await {
                Ok(report) if report != DeadLetterSweepReport::default() => {
                    info!(
                        event_name = "dead_letter_sweep",
                        redelivered = report.redelivered,
                        rescheduled = report.rescheduled,
                        abandoned = report.abandoned,
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(event_name = "dead_letter_sweep_failed", error = %error);
                }
            }
        }
    });

    let escalation_task = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(escalation_interval.max(1)));
        loop {
            ticker.tick().await;
            match run_escalation_sweep(&escalations, ESCALATION_SWEEP_BATCH).await {
                Ok((expired, reminded)) if expired > 0 || reminded > 0 => {
                    info!(event_name = "escalation_sweep", expired, reminded);
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(event_name = "escalation_sweep_failed", error = %error);
                }
            }
        }
    });

    let approval_task = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(approval_interval.max(1)));
        loop {
            ticker.tick().await;
            match run_approval_sweep(&gate, APPROVAL_SWEEP_BATCH).await {
                Ok(expired) if expired > 0 => {
                    info!(event_name = "approval_sweep", expired);
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(event_name = "approval_sweep_failed", error = %error);
                }
            }
        }
    });

    vec![dead_letter_task, escalation_task, approval_task]
}
