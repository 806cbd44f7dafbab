pub mod agent_profile;
pub mod approval;
pub mod dead_letter;
pub mod escalation;
pub mod session;
