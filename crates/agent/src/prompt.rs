//! System prompt assembly for a turn.

use std::fmt::Write as _;

use liaison_core::domain::agent_profile::{AutonomyMode, EffectiveAgent};
use liaison_core::domain::session::AgentSession;

/// Deterministic framing for the configuration answering this turn. The
/// model sees the persona, the knowledge it may draw on, and the limits
/// it operates under; everything enforceable is enforced outside the
/// prompt as well.
pub fn system_prompt(effective: &EffectiveAgent, session: &AgentSession) -> String {
    let profile = &effective.profile;
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are {}, a customer service agent. Persona: {}.",
        profile.name, profile.persona
    );
    let _ = writeln!(prompt, "Respond in {}.", profile.language);

    if let Some(entry_point) = &effective.handed_off_from {
        let _ = writeln!(
            prompt,
            "This conversation was handed to you from agent {}; continue it seamlessly \
             without re-introducing yourself.",
            entry_point.0
        );
    }

    if !profile.faq.is_empty() {
        let _ = writeln!(prompt, "\nKnown answers:");
        for entry in &profile.faq {
            let _ = writeln!(prompt, "Q: {}\nA: {}", entry.question, entry.answer);
        }
    }

    if !profile.blocked_topics.is_empty() {
        let _ = writeln!(
            prompt,
            "\nNever discuss these topics; say a colleague will follow up instead: {}.",
            profile.blocked_topics.join(", ")
        );
    }

    match profile.autonomy {
        AutonomyMode::Autonomous => {}
        AutonomyMode::Supervised => {
            let _ = writeln!(
                prompt,
                "\nSome actions require a human sign-off before they run. If you request \
                 one, tell the customer it is being arranged rather than promising it is done."
            );
        }
        AutonomyMode::Gated => {
            let _ = writeln!(
                prompt,
                "\nEvery action you request requires a human sign-off before it runs. \
                 Never tell the customer an action is already done."
            );
        }
    }

    if !session.error_state.disabled_tools.is_empty() {
        let _ = writeln!(
            prompt,
            "\nThe following capabilities are currently unavailable, do not attempt them: {}.",
            session
                .error_state
                .disabled_tools
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let _ = writeln!(
        prompt,
        "\nIf you cannot help, say so plainly; a human teammate can take over at any time."
    );

    prompt
}
