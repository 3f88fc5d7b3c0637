//! auth-sync - drive the auth sync subsystem from a terminal.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use extension_config_and_utils::{init_logging, Config, Paths};
use std::path::PathBuf;
use tracing::debug;

/// Sign in, sign out and inspect the extension session against a real backend.
#[derive(Parser)]
#[command(name = "auth-sync")]
#[command(about = "Auth sync CLI for signing in and inspecting the session")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: output::OutputFormat,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, cookies and storage. Defaults to ~/.auth-sync
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the backend whether the stored session is valid
    Status,

    /// Sign in with tokens obtained elsewhere
    SignIn {
        #[arg(long, env = "AUTH_SYNC_ACCESS_TOKEN")]
        access_token: String,

        #[arg(long, env = "AUTH_SYNC_REFRESH_TOKEN")]
        refresh_token: Option<String>,
    },

    /// Clear every token and end the backend session
    SignOut,

    /// Run the coordinator and print session changes until Ctrl-C
    Watch {
        /// Route to mount on
        #[arg(long)]
        route: Option<String>,

        /// JSON file standing in for an open auth-site tab's local storage
        #[arg(long)]
        page_storage: Option<PathBuf>,
    },

    /// Send an authenticated GET, refreshing the token once on 401
    Fetch {
        /// Absolute URL or a path on the backend
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));
    debug!(base_dir = %paths.base_dir().display(), "configuration loaded");

    let result = match cli.command {
        Commands::Status => commands::status(&config, &paths, &cli.format).await,
        Commands::SignIn {
            access_token,
            refresh_token,
        } => commands::sign_in(&config, &paths, access_token, refresh_token, &cli.format).await,
        Commands::SignOut => commands::sign_out(&config, &paths, &cli.format).await,
        Commands::Watch {
            route,
            page_storage,
        } => commands::watch(&config, &paths, route, page_storage, &cli.format).await,
        Commands::Fetch { url } => commands::fetch(&config, &paths, &url, &cli.format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{e:#}"), &cli.format);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sign_in_takes_optional_refresh_token() {
        let cli = Cli::try_parse_from(["auth-sync", "sign-in", "--access-token", "tok1"]).unwrap();
        match cli.command {
            Commands::SignIn {
                access_token,
                refresh_token,
            } => {
                assert_eq!(access_token, "tok1");
                assert_eq!(refresh_token, None);
            }
            _ => panic!("expected sign-in"),
        }
    }
}
