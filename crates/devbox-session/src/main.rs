use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libdevbox::backup::{Archiver, TarArchiver};
use libdevbox::{
    FileConfig, MonitorExit, Overrides, PersistProfile, SessionConfig, SessionSupervisor, persist,
};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "devbox-session",
    about = "Supervise a remote dev session: persistent dotfiles, key injection, idle shutdown, backup"
)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session and supervise it until it goes idle or is stopped
    Run,

    /// Archive the backup source now
    Backup,

    /// Link persistent items into the home directory and exit
    Link,

    /// Print the resolved configuration as JSON
    PrintConfig,
}

#[derive(Args, Default)]
struct OverrideArgs {
    /// Home directory to manage
    #[arg(long, global = true)]
    home_root: Option<PathBuf>,

    /// Durable directory that persistent items link into
    #[arg(long, global = true)]
    persist_root: Option<PathBuf>,

    /// Persistence preset: ssh, rdp, gemini, llm or unsloth
    #[arg(long, global = true)]
    profile: Option<PersistProfile>,

    /// Seconds without a connection before shutdown
    #[arg(long, global = true)]
    idle_threshold: Option<u64>,

    /// Seconds between connection checks
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Host the operator connects to
    #[arg(long, global = true)]
    endpoint_host: Option<String>,

    /// Forwarded port the operator connects to
    #[arg(long, global = true)]
    endpoint_port: Option<u16>,

    /// Skip restoring the previous backup at start
    #[arg(long, global = true)]
    no_restore: bool,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            home_root: args.home_root,
            persist_root: args.persist_root,
            profile: args.profile,
            idle_threshold_secs: args.idle_threshold,
            poll_interval_secs: args.poll_interval,
            endpoint_host: args.endpoint_host,
            endpoint_port: args.endpoint_port,
            no_restore: args.no_restore,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devbox_session=info,libdevbox=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_session_config(cli.config, cli.overrides.into())?;

    match cli.command {
        Commands::Run => run_session(cfg).await,
        Commands::Backup => backup_now(cfg).await,
        Commands::Link => link_now(&cfg),
        Commands::PrintConfig => print_config(&cfg),
    }
}

fn load_session_config(path: Option<PathBuf>, overrides: Overrides) -> Result<SessionConfig> {
    let file_cfg = match &path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    SessionConfig::resolve(file_cfg, overrides).context("invalid session configuration")
}

async fn run_session(cfg: SessionConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    let supervisor = SessionSupervisor::with_system_collaborators(cfg)
        .context("failed to set up session collaborators")?;
    let report = supervisor
        .run(shutdown_rx, |session| match session.endpoint() {
            Some(endpoint) => {
                info!("devbox is ready, connect with: {endpoint}");
                println!("{endpoint}");
            }
            None => info!("devbox is ready"),
        })
        .await
        .context("session failed to start")?;

    match report.exit {
        Some(MonitorExit::Expired { idle_secs }) => {
            info!(idle_secs, "shut down idle session")
        }
        Some(MonitorExit::Cancelled) | None => info!("shut down on request"),
    }
    if !report.backup_succeeded() {
        warn!("session ended without a fresh backup");
    }
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        shutdown_tx.send_replace(true);
    });
    Ok(())
}

async fn backup_now(cfg: SessionConfig) -> Result<()> {
    let archiver = TarArchiver::new(&cfg.backup.tar_bin, cfg.backup.timeout());
    let plan = cfg.backup.plan.clone();
    let path = tokio::task::spawn_blocking(move || archiver.archive(&plan))
        .await
        .context("backup task failed")??;
    println!("{}", path.display());
    Ok(())
}

fn link_now(cfg: &SessionConfig) -> Result<()> {
    let report = persist::link(&cfg.persist_items, &cfg.home_root, &cfg.persist_root)
        .context("failed to link persistent items")?;
    for (item, err) in &report.skipped {
        warn!(item = %item, "not linked: {err}");
    }
    if !report.is_complete() {
        anyhow::bail!("{} persist item(s) could not be linked", report.skipped.len());
    }
    Ok(())
}

fn print_config(cfg: &SessionConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(cfg).context("failed to encode configuration")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn global_overrides_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "devbox-session",
            "run",
            "--home-root",
            "/home/dev",
            "--profile",
            "rdp",
            "--idle-threshold",
            "600",
            "--no-restore",
        ])
        .expect("parse");

        assert!(matches!(cli.command, Commands::Run));
        let overrides: Overrides = cli.overrides.into();
        assert_eq!(overrides.home_root, Some(PathBuf::from("/home/dev")));
        assert_eq!(overrides.profile, Some(PersistProfile::Rdp));
        assert_eq!(overrides.idle_threshold_secs, Some(600));
        assert!(overrides.no_restore);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let err = Cli::try_parse_from(["devbox-session", "link", "--profile", "windows"])
            .err()
            .expect("bad profile should fail");
        assert!(err.to_string().contains("windows"));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_session_config(
            Some(dir.path().join("missing.toml")),
            Overrides::default(),
        )
        .expect_err("missing file should fail");
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn config_file_and_flags_combine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devbox.toml");
        std::fs::write(&path, "idle_threshold_seconds = 900\npoll_interval_seconds = 30\n")
            .expect("write config");

        let cfg = load_session_config(
            Some(path),
            Overrides {
                poll_interval_secs: Some(10),
                ..Overrides::default()
            },
        )
        .expect("load");

        assert_eq!(cfg.idle_threshold_secs, 900);
        assert_eq!(cfg.poll_interval_secs, 10);
    }
}
