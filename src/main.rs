use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use batchkeeper::cli::{Cli, Command, SubmitArgs};
use batchkeeper::ui::{self, SessionProgress};
use batchkeeper::{
    BatchConfig, FileSessionStore, RecoveryManager, SessionId, SessionRegistry, SessionState,
    SparkSubmitLauncher, YarnClient,
};

const LAUNCH_CHECK_INTERVAL: Duration = Duration::from_millis(200);

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn build_registry(config: &BatchConfig) -> Result<SessionRegistry> {
    let store = FileSessionStore::open(&config.state_dir)
        .with_context(|| format!("failed to open state directory {}", config.state_dir.display()))?;
    let adapter = YarnClient::new(
        config.resource_manager_url.clone(),
        Duration::from_millis(config.poll_timeout_ms),
    )
    .context("failed to build resource manager client")?;
    let launcher = SparkSubmitLauncher::new(
        config.spark_submit.clone(),
        config.spark_master.clone(),
        config.deploy_mode.clone(),
    );

    let registry = SessionRegistry::new(
        Arc::new(store),
        Arc::new(adapter),
        Arc::new(launcher),
        config.registry_settings()?,
    )?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => BatchConfig::load_from(path)?,
        None => BatchConfig::load()?,
    };
    debug!(rm = %config.resource_manager_url, state_dir = %config.state_dir.display(), "configuration loaded");

    let registry = build_registry(&config)?;
    let report = RecoveryManager::new(&registry)
        .recover()
        .context("failed to recover sessions")?;
    info!(restored = report.restored(), "sessions recovered");

    let code = run(cli.command, &registry, &config).await;
    registry.wait_for_terminations().await;
    registry.shutdown();
    code
}

async fn run(command: Command, registry: &SessionRegistry, config: &BatchConfig) -> Result<ExitCode> {
    match command {
        Command::Submit(args) => submit(registry, &args).await,
        Command::List => {
            ui::print_sessions(&registry.list());
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { id } => {
            ui::print_session(&registry.get(id)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Log { id } => {
            ui::print_log(&registry.log_tail(id)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { id } => {
            registry.delete(id)?;
            let session = registry.get(id)?;
            println!("Session {id} deleted ({}).", ui::paint_state(session.state));
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => watch(registry).await,
        Command::Gc => {
            let removed = registry.gc(config.retention())?;
            println!("Removed {} session(s).", removed.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn submit(registry: &SessionRegistry, args: &SubmitArgs) -> Result<ExitCode> {
    let spec = args.to_spec()?;
    let id = registry.create(spec)?;

    if args.detach {
        // The launch runs in this process, so stay until it has reported back.
        wait_for_launch(registry, id).await?;
        let session = registry.get(id)?;
        println!(
            "Session {id} submitted: {} {}",
            session.app_id.as_deref().unwrap_or("-"),
            ui::paint_state(session.state)
        );
        return Ok(exit_code(session.state));
    }

    let progress = SessionProgress::start(id);
    let mut state_rx = registry.subscribe(id)?;
    loop {
        let state = *state_rx.borrow_and_update();
        progress.update_state(state);
        if state.is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.abandon(&format!("Session {id} keeps running; check it later with `batchkeeper status {id}`"));
                return Ok(ExitCode::SUCCESS);
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let session = registry.get(id)?;
    progress.complete(&session);
    Ok(exit_code(session.state))
}

async fn wait_for_launch(registry: &SessionRegistry, id: SessionId) -> Result<()> {
    loop {
        let session = registry.get(id)?;
        if session.app_id.is_some() || session.state.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(LAUNCH_CHECK_INTERVAL).await;
    }
}

async fn watch(registry: &SessionRegistry) -> Result<ExitCode> {
    let live: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|session| !session.state.is_terminal())
        .map(|session| session.id)
        .collect();
    if live.is_empty() {
        println!("No active sessions.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut receivers = Vec::with_capacity(live.len());
    for id in &live {
        receivers.push((*id, registry.subscribe(*id)?));
    }
    let wait_all = async {
        for (id, mut rx) in receivers {
            if rx.wait_for(|state| state.is_terminal()).await.is_ok()
                && let Ok(session) = registry.get(id)
            {
                println!("Session {id}: {}", ui::paint_state(session.state));
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Stopped watching."),
        _ = wait_all => {}
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(state: SessionState) -> ExitCode {
    match state {
        SessionState::Dead | SessionState::Error => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}
