pub mod recover;
pub mod run;
pub mod sessions;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use duet_agents::claude_cli::ClaudeCliAgent;
use duet_agents::dispatcher;
use duet_agents::planner::LlmPlanningAgent;
use duet_agents::Orchestrator;
use duet_core::config::Config;
use duet_core::session_store::SessionStore;
use duet_core::types::SessionId;
use duet_intelligence::{AnthropicProvider, BudgetLimits, RateTable, UsageGovernor};

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

pub fn open_store(config: &Config) -> Arc<SessionStore> {
    Arc::new(SessionStore::new(
        config.data_dir().join("sessions"),
        &config.session,
    ))
}

pub fn open_governor(config: &Config) -> anyhow::Result<Arc<UsageGovernor>> {
    let dir = config.data_dir().join("usage");
    let governor = UsageGovernor::new(
        BudgetLimits::from_config(&config.budget),
        RateTable::with_overrides(&config.pricing),
    )
    .with_persistence(&dir)
    .with_context(|| format!("loading usage ledger from {}", dir.display()))?;
    Ok(Arc::new(governor))
}

/// Wire the full pipeline. The planning agent needs an API key only when a
/// request is actually planned, so callers that never plan may pass
/// `require_key = false`.
pub fn build_orchestrator(config: &Config, require_key: bool) -> anyhow::Result<Orchestrator> {
    let api_key = match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => key,
        _ if require_key => anyhow::bail!(
            "{API_KEY_ENV} is not set.\n  \
             (hint: export it before running requests; keys are never read from config)"
        ),
        _ => String::new(),
    };

    let provider = Arc::new(AnthropicProvider::new(
        api_key,
        Duration::from_secs(config.orchestrator.call_timeout_secs),
    )?);
    let planning = Arc::new(LlmPlanningAgent::from_config(provider, &config.planner));
    let execution = Arc::new(ClaudeCliAgent::from_config(
        &config.executor,
        &config.orchestrator.workspace_root,
    ));
    let dispatcher: Arc<dyn dispatcher::WorkflowDispatcher> =
        Arc::from(dispatcher::from_config(&config.dispatcher));

    Ok(Orchestrator::from_config(
        config,
        open_store(config),
        open_governor(config)?,
        planning,
        execution,
        dispatcher,
    ))
}

pub fn parse_session(raw: &str) -> anyhow::Result<SessionId> {
    SessionId::parse(raw).map_err(|e| anyhow::anyhow!("{e}"))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
