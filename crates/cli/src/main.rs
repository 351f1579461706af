//! TaskSync command-line management tool.
//!
//! Connects users to the remote provider, runs sync passes on demand,
//! lists and resolves conflicts, shows the audit log and generates or
//! validates configuration files.

mod conflicts;
mod style;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use rand::RngCore;
use tracing_subscriber::EnvFilter;

use tasksync_core::config::AppConfig;
use tasksync_core::db::Database;
use tasksync_core::errors::ActionError;
use tasksync_core::vault::RotationOutcome;
use tasksync_core::SyncService;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// TaskSync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "tasksync",
    version,
    about = "Manage and inspect TaskSync task synchronization"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/tasksync/config.toml"
    )]
    config: PathBuf,

    /// User the command acts for.
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./tasksync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Print a fresh random 256-bit encryption key as hex.
    Keygen,

    /// Store a provider token for the user.
    Connect {
        /// Environment variable holding the token. Read from stdin if unset.
        #[arg(long, default_value = "TASKSYNC_PROVIDER_TOKEN")]
        token_env: String,
    },

    /// Delete the user's stored token.
    Disconnect,

    /// Re-encrypt stored tokens under the current key.
    Rotate {
        /// Rotate every stored credential instead of only the user's.
        #[arg(long)]
        all: bool,
    },

    /// Run a sync pass now.
    Sync,

    /// Show the user's connection and sync status.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Resolve a conflict in favour of one side.
    Resolve {
        /// Conflict ID.
        id: String,

        /// Winning side: local or remote.
        #[arg(long)]
        accept: String,
    },

    /// Show the user's recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// List unresolved conflicts.
    List,
    /// Show details of one conflict.
    Show {
        /// Conflict ID.
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { ref output } => return cmd_init(output),
        Commands::Validate => return cmd_validate(&cli.config),
        Commands::Keygen => {
            println!("{}", generate_key());
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("failed to load configuration {}", cli.config.display()))?;
    let service = open_service(&config)?;

    if let Commands::Rotate { all: true } = cli.command {
        return cmd_rotate_all(&service);
    }

    let user = cli
        .user
        .as_deref()
        .context("this command needs --user <USER_ID>")?;

    match cli.command {
        Commands::Connect { token_env } => cmd_connect(&service, user, &token_env).await,
        Commands::Disconnect => {
            action(service.disconnect(user).await)?;
            println!("{}", style::success(&format!("Disconnected {}", user)));
            Ok(())
        }
        Commands::Rotate { .. } => cmd_rotate(&service, user).await,
        Commands::Sync => cmd_sync(&service, user).await,
        Commands::Status { json } => cmd_status(&service, user, json),
        Commands::Conflicts { action: sub } => match sub {
            ConflictsAction::List => {
                conflicts::print_list(&action(service.get_conflicts(user))?);
                Ok(())
            }
            ConflictsAction::Show { id } => {
                conflicts::print_detail(&action(service.get_conflict(user, &id))?);
                Ok(())
            }
        },
        Commands::Resolve { id, accept } => {
            action(service.resolve_conflict(user, &id, &accept).await)?;
            println!(
                "{}",
                style::success(&format!("Conflict {} resolved (kept {})", id, style::side(&accept)))
            );
            Ok(())
        }
        Commands::Audit { limit } => cmd_audit(&service, user, limit),
        Commands::Init { .. } | Commands::Validate | Commands::Keygen => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_service(config: &AppConfig) -> Result<SyncService> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    let db = Database::new(config.daemon.db_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    SyncService::from_config(config, Arc::new(db)).context("failed to initialize sync service")
}

/// Attach the stable error kind so scripts can match on it.
fn action<T>(result: Result<T, ActionError>) -> Result<T> {
    result.map_err(|e| {
        let kind = e.kind();
        let hint = match &e {
            ActionError::RemoteApi {
                requires_reconnect: true,
                ..
            }
            | ActionError::Decryption(_) => "\nRun `tasksync connect` again to store a fresh token.",
            _ => "",
        };
        anyhow::anyhow!("[{}] {}{}", kind, e, hint)
    })
}

fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

fn read_token(token_env: &str) -> Result<String> {
    if let Ok(token) = std::env::var(token_env) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    eprintln!("{}", style::dim(&format!("{} not set; reading token from stdin", token_env)));
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read token from stdin")?;
    Ok(line.trim().to_string())
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# TaskSync Configuration

[daemon]
poll_interval_secs = 300
log_level = "info"
data_dir = "/var/lib/tasksync"

[vault]
# 64 hex chars; generate one with `tasksync keygen`.
primary_key_env = "TASKSYNC_PRIMARY_KEY"
# For rotation, list several keys as "id:hex" pairs and pick the current one:
# rotation_keys_env = "TASKSYNC_ROTATION_KEYS"
# current_key_id = "k2"
rotate_on_start = false

[provider]
name = "remote"
api_url = "https://tasks.example.com/api/v1"
request_timeout_secs = 30
verify_on_connect = true

[sync]
max_retries = 4
retry_base_delay_ms = 500
retry_max_delay_ms = 30000
# Seconds before a lock or sync pass left by a crashed process is taken over
lease_ttl_secs = 600

[notifications]
# slack_webhook_url_env = "TASKSYNC_SLACK_WEBHOOK_URL"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Generate a key:   tasksync keygen");
    println!("  2. Export it:        export TASKSYNC_PRIMARY_KEY=<key>");
    println!("  3. Set provider.api_url in the config");
    println!("  4. Validate:         tasksync validate --config {}", output.display());
    println!("  5. Start the daemon: tasksync-daemon --config {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    let keys = config.key_ring().context("failed to build key ring")?;

    println!();
    println!("Configuration summary:");
    println!("  Provider      : {}", config.provider.name);
    println!("  API URL       : {}", config.provider.api_url);
    println!("  Verify tokens : {}", config.provider.verify_on_connect);
    println!("  Current key   : {}", keys.current_id());
    println!("  Known keys    : {}", keys.key_ids().join(", "));
    println!("  Rotate start  : {}", config.vault.rotate_on_start);
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!(
        "  Slack webhook : {}",
        if config.notifications.slack_webhook_url.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!();
    println!("{}", style::success("Configuration is valid."));
    Ok(())
}

async fn cmd_connect(service: &SyncService, user: &str, token_env: &str) -> Result<()> {
    let token = read_token(token_env)?;
    action(service.connect(user, &token).await)?;
    println!("{}", style::success(&format!("Connected {}", user)));
    Ok(())
}

async fn cmd_rotate(service: &SyncService, user: &str) -> Result<()> {
    match action(service.rotate_tokens(user).await)? {
        RotationOutcome::Rotated { from } => println!(
            "{}",
            style::success(&format!("Token re-encrypted (was sealed with '{}')", from))
        ),
        RotationOutcome::Refreshed => println!(
            "{}",
            style::success("Token already used the current key; re-sealed with a fresh nonce")
        ),
    }
    Ok(())
}

fn cmd_rotate_all(service: &SyncService) -> Result<()> {
    let reports = action(service.rotate_all())?;
    if reports.is_empty() {
        println!("No stored credentials.");
        return Ok(());
    }

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(RotationOutcome::Rotated { from }) => println!(
                "{}",
                style::success(&format!("{}: rotated from '{}'", report.user_id, from))
            ),
            Ok(RotationOutcome::Refreshed) => println!(
                "{}",
                style::success(&format!("{}: refreshed", report.user_id))
            ),
            Err(e) => {
                failed += 1;
                println!("{}", style::warn(&format!("{}: {}", report.user_id, e)));
            }
        }
    }

    println!();
    println!("{} credential(s) processed, {} failed", reports.len(), failed);
    if failed > 0 {
        anyhow::bail!("{} credential(s) could not be rotated", failed);
    }
    Ok(())
}

async fn cmd_sync(service: &SyncService, user: &str) -> Result<()> {
    println!("Syncing {}...", user);
    let summary = action(service.sync_now(user).await)?;

    println!();
    println!("{}", style::success("Sync pass completed"));
    println!(
        "  Pulled     : {} (+{} ~{} -{})",
        summary.pulled(),
        summary.pulled_created,
        summary.pulled_updated,
        summary.pulled_deleted
    );
    println!(
        "  Pushed     : {} (+{} ~{} -{})",
        summary.pushed(),
        summary.pushed_created,
        summary.pushed_updated,
        summary.pushed_deleted
    );
    println!("  Converged  : {}", summary.converged);
    println!("  Conflicts  : {}", summary.conflicts);
    println!("  Frozen     : {}", summary.frozen);
    if summary.failed > 0 {
        println!(
            "  {}",
            style::warn(&format!("Failed pushes: {} (retried next pass)", summary.failed))
        );
    }
    if summary.conflicts + summary.frozen > 0 {
        println!();
        println!("{}", style::dim("List conflicts with: tasksync conflicts list"));
    }
    Ok(())
}

fn cmd_status(service: &SyncService, user: &str, json: bool) -> Result<()> {
    let report = action(service.get_status(user))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize status")?
        );
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("TaskSync status for {}", user)));
    println!("{}", "═".repeat(40));
    println!();
    println!("  Connection : {}", style::connected(report.connected));
    println!("  Sync state : {}", report.status);
    println!(
        "  Last sync  : {}",
        report
            .last_sync_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(ref err) = report.last_error {
        println!("  Last error : {}", style::warn(err));
    }
    println!("  Conflicts  : {}", report.unresolved_conflicts);
    println!();
    Ok(())
}

fn cmd_audit(service: &SyncService, user: &str, limit: u32) -> Result<()> {
    let entries = action(service.audit_log(user, limit))?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Timestamp", "Action", "OK", "Details"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(&entry.created_at),
            Cell::new(&entry.action),
            Cell::new(if entry.success { "yes" } else { "no" }),
            Cell::new(truncate(entry.details.as_deref().unwrap_or(""), 60)),
        ]);
    }

    println!("{}", table);
    println!("{} entries shown", entries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_is_64_hex_chars() {
        let key = generate_key();
        assert_eq!(key.len(), 64);
        assert!(hex::decode(&key).is_ok());
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(truncate("ééééééééé", 5), "éé...");
    }

    #[test]
    fn test_action_error_carries_kind() {
        let err = action::<()>(Err(ActionError::NotConnected)).unwrap_err();
        assert!(err.to_string().starts_with("[NotConnected]"));

        let err = action::<()>(Err(ActionError::Decryption("k0".into()))).unwrap_err();
        assert!(err.to_string().contains("tasksync connect"));
    }

    #[test]
    fn test_cli_parses_resolve() {
        let cli = Cli::try_parse_from([
            "tasksync", "--user", "alice", "resolve", "c1", "--accept", "remote",
        ])
        .unwrap();
        assert_eq!(cli.user.as_deref(), Some("alice"));
        match cli.command {
            Commands::Resolve { id, accept } => {
                assert_eq!(id, "c1");
                assert_eq!(accept, "remote");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
