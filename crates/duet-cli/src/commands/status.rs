use duet_core::config::Config;

use super::{build_orchestrator, parse_session, print_json};

pub fn run(config: &Config, session: &str) -> anyhow::Result<()> {
    let id = parse_session(session)?;
    let orchestrator = build_orchestrator(config, false)?;
    match orchestrator.status(&id)? {
        Some(status) => print_json(&status),
        None => anyhow::bail!("no such session: {id}"),
    }
}
