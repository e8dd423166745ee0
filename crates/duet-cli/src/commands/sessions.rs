use duet_core::config::Config;
use duet_core::types::SessionId;

use super::{open_store, parse_session, print_json};

pub fn create(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config);
    let id = SessionId::generate();
    store.resolve(&id)?;
    println!("{id}");
    Ok(())
}

pub fn list(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config);
    let rows: Vec<serde_json::Value> = store
        .list_sessions()?
        .iter()
        .map(|s| {
            serde_json::json!({
                "session_id": s.id,
                "tasks": s.task_count(),
                "created_at": s.created_at,
                "last_used_at": s.last_used_at,
            })
        })
        .collect();
    print_json(&rows)
}

pub fn delete(config: &Config, session: &str) -> anyhow::Result<()> {
    let id = parse_session(session)?;
    if !open_store(config).delete_session(&id)? {
        anyhow::bail!("no such session: {id}");
    }
    println!("deleted {id}");
    Ok(())
}
