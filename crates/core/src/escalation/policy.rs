use serde::{Deserialize, Serialize};

use crate::domain::escalation::Urgency;

/// Explicit "get me a human" phrase matching. Cheapest check, runs first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExplicitRequestRule {
    pub enabled: bool,
    pub urgency: Urgency,
    pub phrases: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedTopicRule {
    pub enabled: bool,
    pub urgency: Urgency,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegativeSentimentRule {
    pub enabled: bool,
    pub urgency: Urgency,
    /// Sliding window of recent customer messages, inbound included.
    pub window: usize,
    /// Keyword hits across the window required to trigger.
    pub threshold: u32,
    pub keywords: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyRule {
    pub enabled: bool,
    pub urgency: Urgency,
    /// Occurrences across the session's agent replies required to trigger.
    pub threshold: u32,
    pub phrases: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseLoopRule {
    pub enabled: bool,
    pub urgency: Urgency,
    /// Token-set Jaccard similarity between the last two replies.
    pub similarity_threshold: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFailureRule {
    pub enabled: bool,
    pub urgency: Urgency,
    /// Distinct disabled tools in the session required to trigger.
    pub disabled_tool_threshold: usize,
}

/// Fully resolved escalation policy: defaults deep-merged with a per-agent
/// override. Resolution is pure so the detectors stay unit-testable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub explicit_request: ExplicitRequestRule,
    pub blocked_topic: BlockedTopicRule,
    pub negative_sentiment: NegativeSentimentRule,
    pub uncertainty: UncertaintyRule,
    pub response_loop: ResponseLoopRule,
    pub tool_failures: ToolFailureRule,
    /// Sent to the customer when a turn is diverted to a human.
    pub hold_message: String,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            explicit_request: ExplicitRequestRule {
                enabled: true,
                urgency: Urgency::Normal,
                phrases: default_phrases(EXPLICIT_REQUEST_PHRASES),
            },
            blocked_topic: BlockedTopicRule { enabled: true, urgency: Urgency::Normal },
            negative_sentiment: NegativeSentimentRule {
                enabled: true,
                urgency: Urgency::High,
                window: 3,
                threshold: 2,
                keywords: default_phrases(NEGATIVE_SENTIMENT_KEYWORDS),
            },
            uncertainty: UncertaintyRule {
                enabled: true,
                urgency: Urgency::Normal,
                threshold: 3,
                phrases: default_phrases(UNCERTAINTY_PHRASES),
            },
            response_loop: ResponseLoopRule {
                enabled: true,
                urgency: Urgency::Normal,
                similarity_threshold: 0.8,
            },
            tool_failures: ToolFailureRule {
                enabled: true,
                urgency: Urgency::High,
                disabled_tool_threshold: 3,
            },
            hold_message: "Thanks for your patience — I'm connecting you with a member of our \
                           team who will take it from here."
                .to_string(),
        }
    }
}

const EXPLICIT_REQUEST_PHRASES: &[&str] = &[
    "speak to a human",
    "talk to a human",
    "speak with a human",
    "speak to a person",
    "talk to a person",
    "real person",
    "human agent",
    "live agent",
    "speak to someone",
    "talk to someone",
    "customer service representative",
    "stop the bot",
];

const NEGATIVE_SENTIMENT_KEYWORDS: &[&str] = &[
    "angry",
    "furious",
    "frustrated",
    "frustrating",
    "terrible",
    "awful",
    "horrible",
    "ridiculous",
    "useless",
    "worst",
    "unacceptable",
    "scam",
    "disappointed",
    "complaint",
];

const UNCERTAINTY_PHRASES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "i can't help with",
    "i cannot help with",
    "i'm unable to",
    "i am unable to",
    "i don't have that information",
];

fn default_phrases(phrases: &[&str]) -> Vec<String> {
    phrases.iter().map(|phrase| (*phrase).to_string()).collect()
}

/// Sparse per-category override: only the fields an agent sets replace the
/// defaults; everything else composes from `EscalationPolicy::default()`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryOverride {
    pub enabled: Option<bool>,
    pub urgency: Option<Urgency>,
    pub threshold: Option<u32>,
    pub window: Option<usize>,
    pub phrases: Option<Vec<String>>,
    pub similarity_threshold: Option<f64>,
    pub disabled_tool_threshold: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub explicit_request: Option<CategoryOverride>,
    pub blocked_topic: Option<CategoryOverride>,
    pub negative_sentiment: Option<CategoryOverride>,
    pub uncertainty: Option<CategoryOverride>,
    pub response_loop: Option<CategoryOverride>,
    pub tool_failures: Option<CategoryOverride>,
    pub hold_message: Option<String>,
}

/// Pure, deterministic merge of defaults with a sparse agent override.
pub fn resolve(overrides: &PolicyOverride) -> EscalationPolicy {
    let mut policy = EscalationPolicy::default();

    if let Some(over) = &overrides.explicit_request {
        apply(&mut policy.explicit_request.enabled, over.enabled);
        apply(&mut policy.explicit_request.urgency, over.urgency);
        apply_cloned(&mut policy.explicit_request.phrases, over.phrases.as_ref());
    }
    if let Some(over) = &overrides.blocked_topic {
        apply(&mut policy.blocked_topic.enabled, over.enabled);
        apply(&mut policy.blocked_topic.urgency, over.urgency);
    }
    if let Some(over) = &overrides.negative_sentiment {
        apply(&mut policy.negative_sentiment.enabled, over.enabled);
        apply(&mut policy.negative_sentiment.urgency, over.urgency);
        apply(&mut policy.negative_sentiment.threshold, over.threshold);
        apply(&mut policy.negative_sentiment.window, over.window);
        apply_cloned(&mut policy.negative_sentiment.keywords, over.phrases.as_ref());
    }
    if let Some(over) = &overrides.uncertainty {
        apply(&mut policy.uncertainty.enabled, over.enabled);
        apply(&mut policy.uncertainty.urgency, over.urgency);
        apply(&mut policy.uncertainty.threshold, over.threshold);
        apply_cloned(&mut policy.uncertainty.phrases, over.phrases.as_ref());
    }
    if let Some(over) = &overrides.response_loop {
        apply(&mut policy.response_loop.enabled, over.enabled);
        apply(&mut policy.response_loop.urgency, over.urgency);
        apply(&mut policy.response_loop.similarity_threshold, over.similarity_threshold);
    }
    if let Some(over) = &overrides.tool_failures {
        apply(&mut policy.tool_failures.enabled, over.enabled);
        apply(&mut policy.tool_failures.urgency, over.urgency);
        apply(&mut policy.tool_failures.disabled_tool_threshold, over.disabled_tool_threshold);
    }
    if let Some(hold_message) = &overrides.hold_message {
        policy.hold_message = hold_message.clone();
    }

    policy
}

fn apply<T: Copy>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn apply_cloned<T: Clone>(target: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}
