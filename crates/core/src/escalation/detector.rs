use std::collections::BTreeSet;

use crate::domain::escalation::{TriggerType, Urgency};
use crate::escalation::policy::EscalationPolicy;

/// Outcome of a detector check: why and how urgently a human is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationSignal {
    pub trigger: TriggerType,
    pub urgency: Urgency,
    pub reason: String,
}

/// Session-scoped counters the post-call detector reads and returns.
/// No hidden state: the orchestrator persists these on the session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyCounters {
    pub uncertainty_count: u32,
    pub previous_reply: Option<String>,
}

/// Pre-call checks, evaluated in fixed priority order against the inbound
/// text and a sliding window of recent customer messages (inbound last).
/// The first match wins and short-circuits the rest.
pub fn pre_call_check(
    policy: &EscalationPolicy,
    window_messages: &[String],
    blocked_topics: &[String],
) -> Option<EscalationSignal> {
    let inbound = window_messages.last().map(String::as_str).unwrap_or_default();
    let inbound_normalized = normalize(inbound);

    if policy.explicit_request.enabled {
        if let Some(phrase) = policy
            .explicit_request
            .phrases
            .iter()
            .find(|phrase| inbound_normalized.contains(&normalize(phrase)))
        {
            return Some(EscalationSignal {
                trigger: TriggerType::ExplicitRequest,
                urgency: policy.explicit_request.urgency,
                reason: format!("customer asked for a human (\"{phrase}\")"),
            });
        }
    }

    if policy.blocked_topic.enabled {
        if let Some(topic) =
            blocked_topics.iter().find(|topic| inbound_normalized.contains(&normalize(topic)))
        {
            return Some(EscalationSignal {
                trigger: TriggerType::BlockedTopic,
                urgency: policy.blocked_topic.urgency,
                reason: format!("message touches blocked topic \"{topic}\""),
            });
        }
    }

    if policy.negative_sentiment.enabled {
        let window = policy.negative_sentiment.window.max(1);
        let start = window_messages.len().saturating_sub(window);
        let hits: u32 = window_messages[start..]
            .iter()
            .map(|message| {
                let normalized = normalize(message);
                policy
                    .negative_sentiment
                    .keywords
                    .iter()
                    .filter(|keyword| normalized.contains(&normalize(keyword)))
                    .count() as u32
            })
            .sum();

        if hits >= policy.negative_sentiment.threshold {
            return Some(EscalationSignal {
                trigger: TriggerType::NegativeSentiment,
                urgency: policy.negative_sentiment.urgency,
                reason: format!(
                    "{hits} negative-sentiment keyword hits in the last {window} messages"
                ),
            });
        }
    }

    None
}

/// Post-call checks against the generated reply. Uncertainty is checked
/// before loop detection; the updated counters are always returned so the
/// caller persists them even when nothing fires.
pub fn post_call_check(
    policy: &EscalationPolicy,
    reply: &str,
    counters: ReplyCounters,
) -> (Option<EscalationSignal>, ReplyCounters) {
    let reply_normalized = normalize(reply);

    let mut uncertainty_count = counters.uncertainty_count;
    if policy
        .uncertainty
        .phrases
        .iter()
        .any(|phrase| reply_normalized.contains(&normalize(phrase)))
    {
        uncertainty_count += 1;
    }

    let loop_similarity = counters
        .previous_reply
        .as_deref()
        .map(|previous| jaccard_similarity(previous, reply))
        .unwrap_or(0.0);

    let updated = ReplyCounters { uncertainty_count, previous_reply: Some(reply.to_string()) };

    if policy.uncertainty.enabled && uncertainty_count >= policy.uncertainty.threshold {
        return (
            Some(EscalationSignal {
                trigger: TriggerType::Uncertainty,
                urgency: policy.uncertainty.urgency,
                reason: format!("agent expressed uncertainty {uncertainty_count} times"),
            }),
            updated,
        );
    }

    if policy.response_loop.enabled && loop_similarity > policy.response_loop.similarity_threshold
    {
        return (
            Some(EscalationSignal {
                trigger: TriggerType::ResponseLoop,
                urgency: policy.response_loop.urgency,
                reason: format!(
                    "last two replies are {:.0}% similar, agent appears stuck",
                    loop_similarity * 100.0
                ),
            }),
            updated,
        );
    }

    (None, updated)
}

/// Separate check run when the session's disabled-tool set grows.
pub fn tool_failure_check(
    policy: &EscalationPolicy,
    disabled_tool_count: usize,
) -> Option<EscalationSignal> {
    if !policy.tool_failures.enabled {
        return None;
    }
    if disabled_tool_count < policy.tool_failures.disabled_tool_threshold {
        return None;
    }

    Some(EscalationSignal {
        trigger: TriggerType::ToolFailures,
        urgency: policy.tool_failures.urgency,
        reason: format!("{disabled_tool_count} tools disabled after repeated failures"),
    })
}

/// Token-set Jaccard similarity between two texts.
pub fn jaccard_similarity(left: &str, right: &str) -> f64 {
    let left_tokens = token_set(left);
    let right_tokens = token_set(right);

    if left_tokens.is_empty() && right_tokens.is_empty() {
        return 1.0;
    }

    let intersection = left_tokens.intersection(&right_tokens).count();
    let union = left_tokens.union(&right_tokens).count();
    intersection as f64 / union as f64
}

fn token_set(text: &str) -> BTreeSet<String> {
    normalize(text)
        .split(|character: char| !character.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

fn normalize(text: &str) -> String {
    text.to_ascii_lowercase()
}
