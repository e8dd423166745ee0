mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use duet_core::config::Config;
use duet_telemetry::LogFormat;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// duet -- plan a request, execute it with a coding agent, keep the session.
#[derive(Parser)]
#[command(name = "duet", version, about)]
struct Cli {
    /// Config file (default: ~/.duet/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one request in a session and print the Result as JSON.
    Run {
        /// Session to continue; a new one is created when omitted.
        #[arg(short, long)]
        session: Option<String>,
        /// The natural-language request.
        request: String,
    },

    /// Create an empty session and print its id.
    New,

    /// Show history size and usage for a session.
    Status {
        session: String,
    },

    /// List known sessions.
    Sessions,

    /// Delete a session's history.
    Delete {
        session: String,
    },

    /// Re-notify results whose delivery never completed.
    Recover,

    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(p) => Config::load_from(p)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let format = config
        .general
        .log_format
        .parse::<LogFormat>()
        .unwrap_or_default();
    duet_telemetry::init("duet", &config.general.log_level, format);

    match cli.command {
        Commands::Run { session, request } => {
            commands::run::run(&config, session.as_deref(), &request).await?;
        }
        Commands::New => commands::sessions::create(&config)?,
        Commands::Status { session } => commands::status::run(&config, &session)?,
        Commands::Sessions => commands::sessions::list(&config)?,
        Commands::Delete { session } => commands::sessions::delete(&config, &session)?,
        Commands::Recover => commands::recover::run(&config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_takes_optional_session() {
        let cli = Cli::try_parse_from(["duet", "run", "-s", "abc", "fix the build"]).unwrap();
        match cli.command {
            Commands::Run { session, request } => {
                assert_eq!(session.as_deref(), Some("abc"));
                assert_eq!(request, "fix the build");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["duet", "sessions", "--config", "/tmp/duet.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/duet.toml")));
        assert!(matches!(cli.command, Commands::Sessions));
    }

    #[test]
    fn status_requires_session() {
        assert!(Cli::try_parse_from(["duet", "status"]).is_err());
    }
}
