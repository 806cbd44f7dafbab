//! Lookup of the agent configurations the control plane provisioned.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use liaison_core::domain::agent_profile::AgentProfile;
use liaison_core::domain::session::AgentId;

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find_agent(&self, id: &AgentId) -> Result<Option<AgentProfile>>;
}

/// Directory backed by the profiles loaded at bootstrap.
///
/// Template profiles are blueprints, not addressable agents: a lookup
/// that misses every provisioned profile reuses the template as an
/// ephemeral worker under the requested id.
#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: RwLock<HashMap<String, AgentProfile>>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: AgentProfile) {
        let mut agents = self.agents.write().await;
        agents.insert(profile.id.0.clone(), profile);
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn find_agent(&self, id: &AgentId) -> Result<Option<AgentProfile>> {
        let agents = self.agents.read().await;
        if let Some(profile) = agents.get(&id.0).filter(|profile| !profile.is_template) {
            return Ok(Some(profile.clone()));
        }

        Ok(agents.values().find(|profile| profile.is_template).map(|template| {
            let mut worker = template.clone();
            worker.id = id.clone();
            worker.is_template = false;
            worker
        }))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use liaison_core::domain::agent_profile::{AgentProfile, AutonomyMode};
    use liaison_core::domain::session::{AgentId, ChannelKind, OrgId};
    use liaison_core::escalation::PolicyOverride;

    use super::{AgentDirectory, StaticAgentDirectory};

    fn profile(id: &str, is_template: bool) -> AgentProfile {
        AgentProfile {
            id: AgentId(id.to_string()),
            org_id: OrgId("org-1".to_string()),
            name: "Mia".to_string(),
            channel: ChannelKind::Whatsapp,
            persona: "warm and concise".to_string(),
            language: "English".to_string(),
            faq: Vec::new(),
            blocked_topics: Vec::new(),
            autonomy: AutonomyMode::Autonomous,
            allowed_tools: Default::default(),
            denied_tools: Default::default(),
            tools_requiring_approval: Default::default(),
            escalation_overrides: PolicyOverride::default(),
            model_candidates: vec!["llama3.1".to_string()],
            daily_message_limit: 500,
            daily_cost_limit: Decimal::new(10, 0),
            is_template,
        }
    }

    #[tokio::test]
    async fn provisioned_profiles_answer_under_their_own_id() {
        let directory = StaticAgentDirectory::new();
        directory.insert(profile("agent-1", false)).await;

        let found = directory
            .find_agent(&AgentId("agent-1".to_string()))
            .await
            .expect("lookup")
            .expect("should exist");
        assert_eq!(found.id.0, "agent-1");
        assert!(!found.is_template);
    }

    #[tokio::test]
    async fn unknown_ids_get_a_worker_cloned_from_the_template() {
        let directory = StaticAgentDirectory::new();
        directory.insert(profile("blueprint", true)).await;

        let worker = directory
            .find_agent(&AgentId("agent-9".to_string()))
            .await
            .expect("lookup")
            .expect("template should back the miss");
        assert_eq!(worker.id.0, "agent-9");
        assert!(!worker.is_template);
        assert_eq!(worker.name, "Mia", "worker inherits the template configuration");
    }

    #[tokio::test]
    async fn without_a_template_unknown_ids_stay_unknown() {
        let directory = StaticAgentDirectory::new();
        directory.insert(profile("agent-1", false)).await;

        let missing = directory
            .find_agent(&AgentId("agent-9".to_string()))
            .await
            .expect("lookup");
        assert!(missing.is_none());
    }
}
