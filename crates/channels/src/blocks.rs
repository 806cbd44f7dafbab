//! Rich operator messages: typed blocks a chat provider can render, with
//! inline action buttons wired to quick-action callbacks.

use serde::Serialize;

use liaison_agent::context::OperatorNotice;
use liaison_core::domain::escalation::Urgency;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    Plain { text: String },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Danger,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ButtonElement {
    /// Posted back verbatim when the operator clicks; a quick-action
    /// callback token like `esc:take_over:<session>`.
    pub action_id: String,
    pub text: TextObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<ButtonStyle>,
}

impl ButtonElement {
    pub fn new(action_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self { action_id: action_id.into(), text: TextObject::plain(label), style: None }
    }

    pub fn style(mut self, style: ButtonStyle) -> Self {
        self.style = Some(style);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { block_id: String, text: TextObject },
    Actions { block_id: String, elements: Vec<ButtonElement> },
    Context { block_id: String, elements: Vec<TextObject> },
}

/// Provider-neutral message: rich blocks plus a plain-text fallback for
/// surfaces that cannot render them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub fallback_text: String,
    pub blocks: Vec<Block>,
}

pub struct MessageBuilder {
    fallback_text: String,
    blocks: Vec<Block>,
}

impl MessageBuilder {
    pub fn new(fallback_text: impl Into<String>) -> Self {
        Self { fallback_text: fallback_text.into(), blocks: Vec::new() }
    }

    pub fn section(mut self, block_id: impl Into<String>, text: TextObject) -> Self {
        self.blocks.push(Block::Section { block_id: block_id.into(), text });
        self
    }

    pub fn actions(mut self, block_id: impl Into<String>, elements: Vec<ButtonElement>) -> Self {
        if !elements.is_empty() {
            self.blocks.push(Block::Actions { block_id: block_id.into(), elements });
        }
        self
    }

    pub fn context(mut self, block_id: impl Into<String>, elements: Vec<TextObject>) -> Self {
        self.blocks.push(Block::Context { block_id: block_id.into(), elements });
        self
    }

    pub fn build(self) -> MessageTemplate {
        MessageTemplate { fallback_text: self.fallback_text, blocks: self.blocks }
    }
}

fn button_style(callback: &str) -> Option<ButtonStyle> {
    if callback.starts_with("esc:take_over:") || callback.starts_with("appr:approve:") {
        Some(ButtonStyle::Primary)
    } else if callback.starts_with("esc:dismiss:") || callback.starts_with("appr:reject:") {
        Some(ButtonStyle::Danger)
    } else {
        None
    }
}

/// Render an operator notice as a card: title, body, one button per
/// inline action, and an urgency footer.
pub fn notice_message(notice: &OperatorNotice) -> MessageTemplate {
    let buttons = notice
        .actions
        .iter()
        .map(|action| {
            let mut button = ButtonElement::new(action.callback.clone(), action.label.clone());
            if let Some(style) = button_style(&action.callback) {
                button = button.style(style);
            }
            button
        })
        .collect::<Vec<_>>();

    let urgency_label = match notice.urgency {
        Urgency::Low => "low",
        Urgency::Normal => "normal",
        Urgency::High => ":rotating_light: high",
    };

    MessageBuilder::new(format!("{}: {}", notice.title, notice.body))
        .section("notice.title.v1", TextObject::mrkdwn(format!("*{}*", notice.title)))
        .section("notice.body.v1", TextObject::plain(notice.body.clone()))
        .actions("notice.actions.v1", buttons)
        .context(
            "notice.context.v1",
            vec![TextObject::plain(format!("Urgency: {urgency_label}"))],
        )
        .build()
}
