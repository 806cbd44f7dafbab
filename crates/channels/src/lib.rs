//! Channel adapters - the wire between conversations and the outside.
//!
//! This crate owns everything provider-shaped:
//! - **Outbound routing** (`router`) - delivers agent replies to the
//!   customer channel's provider endpoint
//! - **Operator fan-out** (`notify`) - pushes escalation and approval
//!   alerts to the org's chat, push, and email targets
//! - **Message cards** (`blocks`) - rich operator messages with inline
//!   action buttons
//! - **Quick actions** (`quick_actions`) - parses the callback tokens
//!   those buttons post back
//!
//! The orchestration crate only sees the `DeliveryAdapter` and `Notifier`
//! traits; everything provider-specific stays behind this boundary.

pub mod blocks;
pub mod notify;
pub mod quick_actions;
pub mod router;

pub use blocks::{notice_message, Block, ButtonElement, MessageBuilder, MessageTemplate, TextObject};
pub use notify::FanoutNotifier;
pub use quick_actions::QuickAction;
pub use router::ChannelRouter;
