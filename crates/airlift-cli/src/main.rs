use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use airlift::catalog::CatalogClient;
use airlift::config::AgentConfig;
use airlift::manifest::{artifact_path, Manifest};
use airlift::orchestrator::{Host, Orchestrator};
use airlift::state::load_state;
use airlift::types::{LogLevel, Status};
use airlift_loader::{hostapi, ModuleLoader};
use airlift_semver::SemVer;

#[derive(Parser, Debug)]
#[command(name = "airlift", version)]
#[command(about = "Over-the-air module updates for edge devices")]
struct Cli {
    /// Path to the agent config file.
    #[arg(long, default_value = "airlift.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent loop: poll the catalog, apply updates, tick
    /// loaded modules.
    Run {
        /// Main-loop tick interval (e.g. 100ms, 1s).
        #[arg(long, default_value = "100ms")]
        tick_interval: String,

        /// Report "unsafe to update" to the agent; downloads queue but
        /// never start. For bench testing the gating path.
        #[arg(long)]
        hold_updates: bool,
    },
    /// Print tracked module versions from persisted state.
    Status,
    /// Fetch the manifest once and print what would be updated.
    Check,
}

/// Console host: statuses to stdout when they change, diagnostics to
/// stderr.
struct CliHost {
    safe: bool,
    last_status: Option<Status>,
}

impl Host for CliHost {
    fn safe_window(&self) -> bool {
        self.safe
    }

    fn set_status(&mut self, status: Status) {
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        let label = match status {
            Status::Idle => style("idle").dim(),
            Status::CheckingUpdates => style("checking").cyan(),
            Status::UpdateAvailable => style("update available").cyan(),
            Status::Downloading => style("downloading").yellow(),
            Status::DownloadingFast => style("applying (do not power off)").red(),
            Status::Applying => style("applying").yellow(),
            Status::Success => style("success").green(),
            Status::Failure => style("failure").red(),
            Status::Error => style("error").red(),
        };
        println!("status: {label}");
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        let tag = match level {
            LogLevel::Error => style("error").red(),
            LogLevel::Warn => style("warn").yellow(),
            LogLevel::Info => style("info").dim(),
            LogLevel::Debug => style("debug").dim(),
        };
        eprintln!("[{tag}] {message}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)?;

    match cli.cmd {
        Commands::Run {
            tick_interval,
            hold_updates,
        } => run(config, &tick_interval, hold_updates),
        Commands::Status => status(&config),
        Commands::Check => check(&config),
    }
}

fn run(config: AgentConfig, tick_interval: &str, hold_updates: bool) -> Result<()> {
    let tick_interval = parse_duration(tick_interval)?;

    let loader = ModuleLoader::new(config.update.max_modules, hostapi::system_api());
    let mut orch = Orchestrator::new(config, loader)?;
    let mut host = CliHost {
        safe: !hold_updates,
        last_status: None,
    };

    loop {
        orch.tick(Instant::now(), &mut host);
        std::thread::sleep(tick_interval);
    }
}

fn status(config: &AgentConfig) -> Result<()> {
    match load_state(&config.data_dir)? {
        Some(state) => {
            if state.modules.is_empty() {
                println!("no tracked modules");
                return Ok(());
            }
            println!("device: {}", state.device_id);
            for (name, module) in &state.modules {
                println!(
                    "  {name}  v{}  (updated {})",
                    module.version, module.updated_at
                );
            }
        }
        None => println!("no tracked modules"),
    }
    Ok(())
}

fn check(config: &AgentConfig) -> Result<()> {
    let client = CatalogClient::new(&config.catalog, config.update.max_artifact_size)?;
    let body = client
        .fetch_manifest()
        .context("failed to fetch manifest")?;
    let manifest = Manifest::parse(&body).context("failed to parse manifest")?;

    let state = load_state(&config.data_dir)?;
    let tracked = |name: &str| -> Option<SemVer> {
        state
            .as_ref()
            .and_then(|s| s.modules.get(name))
            .and_then(|m| SemVer::parse_lenient(&m.version))
    };

    let mut pending = 0usize;
    for (name, entry) in &manifest.modules {
        let current = tracked(name);
        if airlift_semver::is_upgrade(current, entry.latest_version) {
            pending += 1;
            let from = current
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{}  {from} -> {}  [{}]  fetches {}",
                style(name).bold(),
                entry.latest_version,
                format!("{:?}", entry.priority).to_lowercase(),
                artifact_path(name, entry.latest_version)
            );
        } else {
            println!("{name}  up to date");
        }
    }
    if pending == 0 {
        println!("nothing to update");
    }
    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration {s:?}"))
}
