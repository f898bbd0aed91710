use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use cadence_config::{
    find_config_path, load_config, read_config, resolve_path, save_config, Config, EngineKind,
};
use cadence_core::context::{paths, BackupStore};
use cadence_core::scheduler::{CycleRecord, SchedulerState};
use cadence_core::{ResponseOutcome, Runtime, SuggestionRecord};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "cadence", about = "Focus-aware break reminders", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent pipeline until Ctrl-C (or for a fixed duration)
    Run {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Override the cycle interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Override the simulated activity profile
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Answer the active break suggestion
    Respond {
        /// Suggestion id (see `cadence status`)
        id: String,

        /// Mark the suggestion as ignored instead of accepted
        #[arg(long)]
        ignore: bool,
    },
    /// Show configuration and the last persisted pipeline state
    Status,
    /// List context backups and whether they verify
    Backups,
    /// Initialize configuration and data directory
    Onboard {
        /// Skip interactive prompts and write defaults
        #[arg(long)]
        non_interactive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},rusqlite=warn,reqwest=warn");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard { non_interactive } => run_onboard(cli.config, non_interactive),
        Commands::Status => run_status(&config_path),
        Commands::Backups => {
            let config = load_config(&config_path)?;
            run_backups(&config)
        }
        Commands::Respond { id, ignore } => {
            let config = load_config(&config_path)?;
            run_respond(&config, &id, !ignore).await
        }
        Commands::Run {
            duration,
            interval,
            profile,
        } => {
            // Validate once, after the overrides.
            let mut config = read_config(&config_path)?;
            if let Some(secs) = interval {
                config.scheduler.interval_secs = secs;
            }
            if let Some(profile) = profile {
                config.activity.profile = profile;
            }
            config.validate()?;
            run_pipeline(&config, duration.map(Duration::from_secs)).await
        }
    }
}

async fn run_pipeline(config: &Config, duration: Option<Duration>) -> Result<()> {
    let mut runtime = Runtime::from_config(config)?;
    let handle = runtime.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            info!("Ctrl-C received, finishing current agent");
            handle.stop();
        }
    });

    println!(
        "cadence running: every {}s, activity profile '{}' (Ctrl-C to stop)",
        config.scheduler.interval_secs, config.activity.profile
    );
    let summary = runtime.run(duration).await?;
    println!(
        "Completed {} cycle(s), skipped {} tick(s)",
        summary.cycles_completed, summary.skipped_ticks
    );
    Ok(())
}

async fn run_respond(config: &Config, id: &str, accepted: bool) -> Result<()> {
    let runtime = Runtime::from_config(config)?;
    match runtime.respond(id, accepted).await? {
        ResponseOutcome::Applied(record) => {
            println!("Suggestion {} marked {}", record.id, record.status)
        }
        ResponseOutcome::Queued(path) => {
            println!("cadence run is active; response queued at {}", path.display());
            println!("It is applied at the start of the next delivery step.");
        }
    }
    Ok(())
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    use std::io::{self, Write};
    print!("{prompt} [{default}]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool> {
    use std::io::{self, Write};
    let default = if default_yes { "Y/n" } else { "y/N" };
    print!("{prompt} ({default}): ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let answer = input.trim();
    if answer.is_empty() {
        return Ok(default_yes);
    }
    let lower = answer.to_lowercase();
    Ok(matches!(lower.as_str(), "y" | "yes"))
}

/// Write a config file (prompting unless `non_interactive`) and create the data directory.
fn run_onboard(config_arg: Option<PathBuf>, non_interactive: bool) -> Result<()> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let config_path = config_arg.unwrap_or_else(|| home.join(".cadence").join("config.json"));

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `cadence onboard` again.");
    } else {
        let mut cfg = Config::default();
        if !non_interactive {
            println!("Interactive setup");
            let interval = prompt_with_default(
                "Cycle interval in seconds",
                &cfg.scheduler.interval_secs.to_string(),
            )?;
            cfg.scheduler.interval_secs = interval.parse()?;
            cfg.activity.profile = prompt_with_default("Activity profile", &cfg.activity.profile)?;
            cfg.nudge.work_session_minutes = prompt_with_default(
                "Minutes of work before a break",
                &cfg.nudge.work_session_minutes.to_string(),
            )?
            .parse()?;

            if prompt_yes_no("Use a local Ollama model for suggestions?", false)? {
                cfg.nudge.engine.kind = EngineKind::Ollama;
                cfg.nudge.engine.api_base =
                    prompt_with_default("Ollama API base", &cfg.nudge.engine.api_base)?;
                cfg.nudge.engine.model = prompt_with_default("Model", &cfg.nudge.engine.model)?;
            }

            let calendar = prompt_with_default("Calendar JSON file (empty for none)", "")?;
            if !calendar.is_empty() {
                cfg.context.calendar_file = Some(calendar);
            }
        }
        cfg.validate()?;
        save_config(&config_path, &cfg)?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(&config_path)?;
    let data_dir = resolve_path(&config.store.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    println!("Data dir: {}", data_dir.display());
    println!();
    println!("Start with: cadence run");
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    println!("cadence status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, using defaults; run `cadence onboard`)",
            config_path.display()
        );
    }
    let config = load_config(config_path)?;
    let data_dir = resolve_path(&config.store.data_dir);
    println!("  Data dir:  {}", data_dir.display());
    println!("  Interval:  {}s", config.scheduler.interval_secs);
    println!("  Activity:  {}", config.activity.profile);
    println!(
        "  Engine:    {}",
        match config.nudge.engine.kind {
            EngineKind::Template => "template".to_string(),
            EngineKind::Ollama => format!("ollama ({})", config.nudge.engine.model),
        }
    );
    println!(
        "  Calendar:  {}",
        config.context.calendar_file.as_deref().unwrap_or("(none)")
    );
    println!();

    let backups = BackupStore::new(data_dir.join("backups"), config.store.backup_keep);
    let Some(backup) = backups.load_latest_valid()? else {
        println!("  No saved state yet.");
        return Ok(());
    };
    let store = cadence_core::ContextStore::new();
    store.restore_snapshot(backup.snapshot)?;
    println!("  State:     {} (sequence {})", backup.path.display(), backup.sequence);

    if let Some(state) = store.get_as::<SchedulerState>(paths::SCHEDULER_STATE)? {
        println!("  Cycles:    {}", state.runs_completed);
        match state.next_run_at {
            Some(at) => println!("  Next run:  {}", at.to_rfc3339()),
            None => println!("  Next run:  (stopped)"),
        }
    }
    if let Some(cycle) = store.get_as::<CycleRecord>(paths::SCHEDULER_LAST_CYCLE)? {
        println!("  Last cycle #{} at {}", cycle.cycle_id, cycle.ended_at.to_rfc3339());
        for result in &cycle.agent_results {
            let detail = result.error_detail.as_deref().unwrap_or("");
            println!(
                "    {:<14} {:<8} {:>6}ms {}",
                result.agent,
                format!("{:?}", result.status).to_lowercase(),
                result.elapsed_ms,
                detail
            );
        }
    }
    if let Ok(level) = store.get("focus.current.level") {
        println!("  Focus:     {}", level.as_str().unwrap_or("?"));
    }
    match store.get_as::<Option<SuggestionRecord>>(paths::SUGGESTIONS_ACTIVE)? {
        Some(Some(active)) => println!(
            "  Active:    {} {} ({}): {}",
            active.id, active.break_type, active.status, active.message
        ),
        _ => println!("  Active:    (none)"),
    }
    Ok(())
}

fn run_backups(config: &Config) -> Result<()> {
    let dir = resolve_path(&config.store.data_dir).join("backups");
    let backups = BackupStore::new(&dir, config.store.backup_keep);
    let list = backups.list()?;
    if list.is_empty() {
        println!("No backups in {}", dir.display());
        return Ok(());
    }

    println!("Backups in {} (newest first):", dir.display());
    for info in &list {
        let verdict = match &info.problem {
            None => "ok".to_string(),
            Some(problem) => format!("CORRUPT: {problem}"),
        };
        println!(
            "  seq {:>8}  {:>8} bytes  {}",
            info.sequence, info.size_bytes, verdict
        );
    }
    if list.iter().all(|info| info.problem.is_some()) {
        bail!("no valid backup available");
    }
    Ok(())
}
