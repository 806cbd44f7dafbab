use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use liaison_core::domain::agent_profile::AgentProfile;
use liaison_core::domain::approval::ApprovalId;
use liaison_core::domain::session::SessionErrorState;

use crate::llm::ToolSpec;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: &Value) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: ToolExecutor + 'static,
    {
        let name = tool.spec().name;
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The tools a turn may actually see. Scoping only ever narrows: the
/// platform registry bounds the profile's allow list, the deny list
/// removes, and the session's tripped breakers remove further.
pub fn in_scope(
    registry: &ToolRegistry,
    profile: &AgentProfile,
    error_state: &SessionErrorState,
    name: &str,
) -> bool {
    if registry.get(name).is_none() {
        return false;
    }
    if !profile.allowed_tools.is_empty() && !profile.allowed_tools.contains(name) {
        return false;
    }
    if profile.denied_tools.contains(name) {
        return false;
    }
    !error_state.disabled_tools.contains(name)
}

/// Specs for every in-scope tool, in registry-name order.
pub fn scoped_specs(
    registry: &ToolRegistry,
    profile: &AgentProfile,
    error_state: &SessionErrorState,
) -> Vec<ToolSpec> {
    registry
        .names()
        .into_iter()
        .filter(|name| in_scope(registry, profile, error_state, name))
        .filter_map(|name| registry.get(&name).map(|tool| tool.spec()))
        .collect()
}

/// What happened to one tool call the model asked for.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Executed { name: String, result: Value },
    Failed { name: String, error: String },
    /// Circuit breaker tripped earlier in the session; call skipped.
    Disabled { name: String },
    /// Not registered, or outside the profile's scope; call skipped.
    OutOfScope { name: String },
    /// Parked behind the approval gate; resumes on operator sign-off.
    PendingApproval { name: String, approval_id: ApprovalId },
}

impl ToolOutcome {
    pub fn name(&self) -> &str {
        match self {
            Self::Executed { name, .. }
            | Self::Failed { name, .. }
            | Self::Disabled { name }
            | Self::OutOfScope { name }
            | Self::PendingApproval { name, .. } => name,
        }
    }
}
