use duet_agents::ShutdownSignal;
use duet_core::config::Config;
use duet_core::types::SessionId;
use tracing::info;

use super::{build_orchestrator, parse_session, print_json};

/// Handle one request. Ctrl-C abandons the call and releases its
/// reservation; nothing is recorded for an abandoned call.
pub async fn run(config: &Config, session: Option<&str>, request: &str) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, true)?;
    let session = match session {
        Some(raw) => parse_session(raw)?,
        None => {
            let id = SessionId::generate();
            info!(session_id = %id, "starting new session");
            id
        }
    };

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_ctrl_c();

    let result = orchestrator
        .handle_with_shutdown(&session, request, &shutdown)
        .await?;

    print_json(&serde_json::json!({
        "session_id": session,
        "result": result,
    }))?;

    if !result.success {
        anyhow::bail!(
            "task failed: {}",
            result
                .failure
                .as_ref()
                .map(|f| f.reason.as_str())
                .unwrap_or("unknown failure")
        );
    }
    Ok(())
}
