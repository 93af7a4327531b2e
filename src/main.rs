//! hl-mirror binary entry point. Mirrors the teacher's `main.rs` boot
//! shape (dotenv, clap, tracing init, then hand off to the async runtime)
//! but the actual pipeline work lives in
//! [`hl_mirror::orchestrator::Orchestrator`] per spec §4.7. The operator
//! CLI surface below (spec §4.7/§6: preflight/doctor/recovery/baseline/
//! safety) stays a thin shell over `Storage`/`SafetyService` — no business
//! logic beyond the contract ships here, matching the Non-goals.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use hl_mirror::config;
use hl_mirror::logging;
use hl_mirror::orchestrator::{Orchestrator, RunMode as OrchestratorRunMode};
use hl_mirror::safety::{SafetyMode, SafetyService};
use hl_mirror::storage::Storage;

#[derive(Parser)]
#[command(name = "hl-mirror")]
#[command(about = "Mirrors a tracked wallet's Hyperliquid position deltas into sized destination-exchange orders")]
#[command(version)]
struct Cli {
    /// Config file path (defaults to ./config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the pipeline and either loop or run a single tick.
    Run {
        #[arg(long, value_enum, default_value_t = Mode::Live)]
        mode: Mode,
    },
    /// Schema + config-hash + contract-version check. Exits 1 on any mismatch.
    Preflight,
    /// Print current safety/cursor/audit state with a suggested recovery action.
    Doctor,
    /// Mutate safety state through the same path the pipeline itself uses.
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },
    /// Create or clear the active baseline position snapshot.
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },
    /// Clear a non-HALT safety reason back to bootstrap state.
    Safety {
        #[command(subcommand)]
        action: SafetyAction,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Live,
    BackfillOnly,
    Once,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::BackfillOnly => write!(f, "backfill-only"),
            Mode::Once => write!(f, "once"),
        }
    }
}

impl From<Mode> for OrchestratorRunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Live => OrchestratorRunMode::Live,
            Mode::BackfillOnly => OrchestratorRunMode::BackfillOnly,
            Mode::Once => OrchestratorRunMode::Once,
        }
    }
}

#[derive(Subcommand)]
enum RecoveryAction {
    /// Jump the cursor past an enforced gap without waiting for a restart.
    MaintenanceSkip {
        #[arg(long)]
        dry_run: bool,
    },
    /// Force HALT back to ARMED_SAFE.
    Unhalt {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        allow_non_halt: bool,
    },
    /// Force the current mode to ARMED_LIVE.
    Promote {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        allow_non_halt: bool,
    },
}

#[derive(Subcommand)]
enum BaselineAction {
    /// Snapshot current reconstructed local positions as the active baseline.
    Sync {
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long, default_value = "manual baseline sync")]
        reason: String,
    },
    /// Deactivate the current baseline.
    Reset {
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long, default_value = "manual baseline reset")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum SafetyAction {
    /// Clear a non-HALT reason back to bootstrap state.
    Reset,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config.clone());

    match cli.command.unwrap_or(Command::Run { mode: Mode::Live }) {
        Command::Run { mode } => run(&config_path, mode).await,
        Command::Preflight => preflight(&config_path).await,
        Command::Doctor => doctor(&config_path).await,
        Command::Recovery { action } => recovery(&config_path, action).await,
        Command::Baseline { action } => baseline(&config_path, action).await,
        Command::Safety { action } => safety(&config_path, action).await,
    }
}

async fn run(config_path: &Path, mode: Mode) -> Result<()> {
    let loaded = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let _logging_guard = logging::init_logging(loaded.environment, &loaded.log_level, std::path::Path::new(&loaded.app_log_path));

    tracing::info!(mode = ?mode, config = %config_path.display(), "hl-mirror starting");

    let orchestrator = Orchestrator::boot(config_path, mode.into())
        .await
        .context("orchestrator boot failed")?;

    match mode {
        Mode::Once => orchestrator.run_once().await.context("run_once failed")?,
        Mode::Live | Mode::BackfillOnly => orchestrator.run_loop().await.context("run_loop failed")?,
    }

    Ok(())
}

/// Schema + config-hash + contract-version check (spec §4.7 CLI surface).
/// Exits the process with code 1 on any precondition failure, matching the
/// exit-code contract in spec.md §6.
async fn preflight(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config_hash = config::compute_config_hash(config_path)?;

    let storage = Storage::open(&config.db_path)?;
    let mut ok = true;

    if let Err(e) = storage.ensure_schema().await {
        eprintln!("FAIL schema: {e}");
        ok = false;
    } else {
        println!("OK schema version current");
    }

    match storage.get_system_state("config_hash").await? {
        Some(existing) if existing != config_hash => {
            println!("WARN config_hash changed since last boot (persisted={existing}, current={config_hash})");
        }
        Some(_) => println!("OK config_hash matches persisted state"),
        None => println!("OK config_hash unset (first boot)"),
    }

    match storage.get_system_state("contract_version").await? {
        Some(existing) => match hl_mirror::types::assert_contract_version(&existing) {
            Ok(()) => println!("OK contract_version {existing} compatible with {}", hl_mirror::types::CONTRACT_VERSION),
            Err(e) => {
                eprintln!("FAIL contract_version: {e}");
                ok = false;
            }
        },
        None => println!("OK contract_version unset (first boot)"),
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints current safety/cursor/audit state with a suggested recovery
/// action. Exits 1 when the pipeline is HALTed so scripts can branch on it.
async fn doctor(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let storage = Storage::open(&config.db_path)?;
    storage.ensure_schema().await?;
    let safety = SafetyService::new(storage.clone());

    let snapshot = safety.snapshot().await;
    println!("safety_mode: {}", snapshot.mode.as_str());
    println!("reason_code: {}", snapshot.reason_code);
    println!("reason_message: {}", snapshot.reason_message);
    println!("changed_at_ms: {}", snapshot.changed_at_ms);

    let cursor_ts = storage.get_system_state("last_processed_timestamp_ms").await?.unwrap_or_default();
    println!("last_processed_timestamp_ms: {cursor_ts}");

    println!("recent audit entries:");
    for entry in storage.recent_audit_entries(10).await? {
        println!(
            "  [{}] {} {}: {:?} -> {:?} ({:?})",
            entry.timestamp_ms, entry.category, entry.entity_id, entry.from_state, entry.to_state, entry.reason_code
        );
    }

    match snapshot.mode {
        SafetyMode::Halt => {
            println!("suggested action: `hl-mirror recovery unhalt` or `hl-mirror recovery maintenance-skip` once the root cause is addressed");
            std::process::exit(1);
        }
        SafetyMode::ArmedSafe => {
            println!("suggested action: pipeline is reducing-only; `hl-mirror recovery promote` to resume live sizing once confident");
        }
        SafetyMode::ArmedLive => {
            println!("suggested action: none, pipeline is running normally");
        }
    }
    Ok(())
}

async fn recovery(config_path: &Path, action: RecoveryAction) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let storage = Storage::open(&config.db_path)?;
    storage.ensure_schema().await?;
    let safety = SafetyService::new(storage.clone());
    let now = now_ms();

    match action {
        RecoveryAction::MaintenanceSkip { dry_run } => {
            let snapshot = safety.snapshot().await;
            if snapshot.reason_code != "BACKFILL_WINDOW_EXCEEDED" {
                eprintln!("refusing: current reason_code is {:?}, not BACKFILL_WINDOW_EXCEEDED", snapshot.reason_code);
                std::process::exit(1);
            }
            if dry_run {
                println!("dry-run: would set cursor to {now} and transition to ARMED_SAFE/MAINTENANCE_SKIP_GAP");
                return Ok(());
            }
            storage.force_set_cursor(now, 0, "maintenance", "MAINTENANCE", now).await?;
            safety
                .set_safety_state(SafetyMode::ArmedSafe, "MAINTENANCE_SKIP_GAP", "operator-initiated maintenance skip", now)
                .await;
            println!("cursor advanced to {now}, safety_mode=ARMED_SAFE");
        }
        RecoveryAction::Unhalt { dry_run, allow_non_halt } => {
            let snapshot = safety.snapshot().await;
            if snapshot.mode != SafetyMode::Halt && !allow_non_halt {
                eprintln!("refusing: current mode is {} not HALT (pass --allow-non-halt to override)", snapshot.mode.as_str());
                std::process::exit(1);
            }
            if dry_run {
                println!("dry-run: would transition {} -> ARMED_SAFE/MANUAL_UNHALT", snapshot.mode.as_str());
                return Ok(());
            }
            safety
                .set_safety_state(SafetyMode::ArmedSafe, "MANUAL_UNHALT", "operator-initiated unhalt", now)
                .await;
            println!("safety_mode=ARMED_SAFE");
        }
        RecoveryAction::Promote { dry_run, allow_non_halt } => {
            let snapshot = safety.snapshot().await;
            if snapshot.mode == SafetyMode::Halt && !allow_non_halt {
                eprintln!("refusing: current mode is HALT (pass --allow-non-halt to override)");
                std::process::exit(1);
            }
            if dry_run {
                println!("dry-run: would transition {} -> ARMED_LIVE/MANUAL_PROMOTE", snapshot.mode.as_str());
                return Ok(());
            }
            safety
                .set_safety_state(SafetyMode::ArmedLive, "MANUAL_PROMOTE", "operator-initiated promotion", now)
                .await;
            println!("safety_mode=ARMED_LIVE");
        }
    }
    Ok(())
}

async fn baseline(config_path: &Path, action: BaselineAction) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let storage = Storage::open(&config.db_path)?;
    storage.ensure_schema().await?;
    let now = now_ms();

    match action {
        BaselineAction::Sync { operator, reason } => {
            let positions = storage.reconstruct_local_positions().await?;
            let snapshot = storage.create_baseline(&positions, &operator, &reason, true, now).await?;
            println!("baseline {} created with {} symbols", snapshot.baseline_id, snapshot.positions.len());
        }
        BaselineAction::Reset { operator, reason } => {
            storage.deactivate_all_baselines().await?;
            tracing::info!(operator, reason, "baseline_reset");
            println!("active baseline cleared");
        }
    }
    Ok(())
}

async fn safety(config_path: &Path, action: SafetyAction) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let storage = Storage::open(&config.db_path)?;
    storage.ensure_schema().await?;
    let safety = SafetyService::new(storage.clone());

    match action {
        SafetyAction::Reset => {
            let snapshot = safety.snapshot().await;
            if snapshot.mode == SafetyMode::Halt {
                eprintln!("refusing: current mode is HALT; use `hl-mirror recovery unhalt` instead");
                std::process::exit(1);
            }
            safety
                .set_safety_state(SafetyMode::ArmedSafe, "BOOTSTRAP", "operator-acknowledged reset", now_ms())
                .await;
            println!("safety_mode=ARMED_SAFE reason_code=BOOTSTRAP");
        }
    }
    Ok(())
}
