use duet_core::config::Config;

use super::build_orchestrator;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, false)?;
    let report = orchestrator.recover_notifications().await?;
    println!(
        "recovery: {} delivered, {} failed",
        report.delivered, report.failed
    );
    Ok(())
}
