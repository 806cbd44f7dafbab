use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use liaison_agent::approval_gate::{ApprovalGate, ApprovalGateConfig};
use liaison_agent::context::{BudgetStatus, CreditLedger, CrmConnector, TurnContext};
use liaison_agent::directory::StaticAgentDirectory;
use liaison_agent::escalations::EscalationService;
use liaison_agent::invoker::{InvokerConfig, RetryFallbackInvoker};
use liaison_agent::llm::TokenUsage;
use liaison_agent::orchestrator::TurnOrchestrator;
use liaison_agent::tools::ToolRegistry;
use liaison_channels::notify::FanoutNotifier;
use liaison_channels::router::ChannelRouter;
use liaison_core::config::{AppConfig, ConfigError, LoadOptions};
use liaison_core::domain::session::{ChannelKind, ContactId, OrgId};
use liaison_core::escalation::EscalationEngine;
use liaison_db::repositories::{
    SqlApprovalRepository, SqlDeadLetterRepository, SqlSessionRepository,
};
use liaison_db::{connect_with_settings, migrations, DbPool};

use crate::model_client::HttpModelClient;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub directory: Arc<StaticAgentDirectory>,
    pub context: TurnContext,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub escalations: Arc<EscalationService>,
    pub gate: Arc<ApprovalGate>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

/// Billing backend stand-in until an org ledger is wired up: every org
/// has budget and calls cost nothing.
struct UnmeteredLedger;

#[async_trait]
impl CreditLedger for UnmeteredLedger {
    async fn check_budget(&self, _org_id: &OrgId) -> Result<BudgetStatus> {
        Ok(BudgetStatus::Available)
    }

    async fn deduct(&self, _org_id: &OrgId, _model: &str, _usage: &TokenUsage) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn deduct_action(&self, _org_id: &OrgId, _action: &str) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}

/// CRM linkage stand-in: records the intent in the logs only.
struct LoggingCrm;

#[async_trait]
impl CrmConnector for LoggingCrm {
    async fn link_contact(
        &self,
        org_id: &OrgId,
        channel: ChannelKind,
        contact_id: &ContactId,
    ) -> Result<()> {
        debug!(
            event_name = "crm_link_recorded",
            org_id = %org_id.0,
            channel = channel.as_str(),
            contact_id = %contact_id.0,
        );
        Ok(())
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "bootstrap_start");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "database_connected");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "migrations_applied");

    let sessions = Arc::new(SqlSessionRepository::new(db_pool.clone()));
    let approvals = Arc::new(SqlApprovalRepository::new(db_pool.clone()));
    let dead_letters = Arc::new(SqlDeadLetterRepository::new(db_pool.clone()));

    // Profiles are provisioned out of band and registered at runtime.
    let directory = Arc::new(StaticAgentDirectory::new());
    let notifier = Arc::new(FanoutNotifier::from_config(&config.notifications));

    let model_client = Arc::new(HttpModelClient::from_config(&config.model));
    let invoker = Arc::new(RetryFallbackInvoker::new(
        model_client,
        InvokerConfig {
            candidates: config.model.candidates.clone(),
            max_attempts_per_candidate: config.model.max_attempts_per_candidate,
            backoff_base_ms: config.model.backoff_base_ms,
        },
    ));

    let context = TurnContext {
        sessions: sessions.clone(),
        usage: sessions.clone(),
        approvals: approvals.clone(),
        dead_letters,
        directory: directory.clone(),
        delivery: Arc::new(ChannelRouter::from_config(&config.channels)),
        notifier: notifier.clone(),
        credits: Arc::new(UnmeteredLedger),
        crm: Arc::new(LoggingCrm),
        registry: Arc::new(ToolRegistry::new()),
        invoker,
    };

    let escalations = Arc::new(EscalationService::new(
        EscalationEngine::new(),
        sessions,
        notifier,
    ));
    let gate = Arc::new(ApprovalGate::new(
        approvals,
        ApprovalGateConfig { ttl_hours: config.sweeps.approval_ttl_hours },
    ));
    let orchestrator = Arc::new(TurnOrchestrator::new(
        context.clone(),
        escalations.clone(),
        gate.clone(),
    ));

    info!(event_name = "bootstrap_complete");
    Ok(Application { config, db_pool, directory, context, orchestrator, escalations, gate })
}

#[cfg(test)]
mod tests {
    use liaison_agent::orchestrator::{InboundMessage, TurnError};
    use liaison_core::config::{ConfigOverrides, LoadOptions};
    use liaison_core::domain::session::{AgentId, ChannelKind, ContactId};

    use super::bootstrap;

    fn memory_options() -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_exposes_baseline_tables() {
        let app = bootstrap(memory_options()).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('agent_session', 'session_message', 'approval_request', 'dead_letter_queue')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 4);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn turns_for_unprovisioned_agents_are_rejected() {
        let app = bootstrap(memory_options()).await.expect("bootstrap");

        let error = app
            .orchestrator
            .handle(InboundMessage {
                agent_id: AgentId("nobody".to_string()),
                channel: ChannelKind::Test,
                contact_id: ContactId("visitor-1".to_string()),
                text: "hello".to_string(),
            })
            .await
            .expect_err("unknown agent");
        assert!(matches!(error, TurnError::UnknownAgent(id) if id == "nobody"));

        app.db_pool.close().await;
    }
}
