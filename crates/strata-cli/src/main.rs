use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use strata_core::app::{Engine, ScanRequest};
use strata_core::config::{ConfigError, EngineConfig};
use strata_core::domain::{
    CheckpointRequest, ContextError, ContextSnapshot, ImmediateContext, RecoveryType, SessionId,
    SessionSnapshot, TaskContextPatch, TaskId, TaskStatus,
};
use strata_core::impls::BroadcastEventSink;

#[derive(Parser)]
#[command(name = "strata", about = "Versioned task contexts with checkpoints and crash recovery")]
struct Cli {
    /// Path to an engine config TOML.
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory walkthrough: versions, checkpoint rollback, recovery, conflicts.
    Demo,

    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] strata_core::app::BuildError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("output encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Demo => demo(config).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, CliError> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(EngineConfig::from_toml_str(&raw)?)
}

async fn demo(config: EngineConfig) -> Result<(), CliError> {
    let events = Arc::new(BroadcastEventSink::new(256));
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!(event_type = %event.event_type, aggregate = %event.aggregate_id, "event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let engine = Engine::builder().config(config).events(events).build()?;
    let versions = engine.versions();
    let checkpoints = engine.checkpoints();
    let recovery = engine.recovery();

    // (A) task を作って進める
    let t1 = TaskId::new("T1")?;
    let mut fields = ContextSnapshot::named("auth rewrite");
    fields.key_files = vec!["src/auth.rs".into(), "src/session.rs".into()];
    versions.create(t1.clone(), fields).await?;
    versions
        .update(&t1, TaskContextPatch::new().status(TaskStatus::InProgress))
        .await?;

    // (B) checkpoint → 変更 → rollback
    let checkpoint = checkpoints
        .create(CheckpointRequest::new("pre-migration").for_task(t1.clone()))
        .await?
        .into_value();
    versions.update(&t1, TaskContextPatch::new().iteration(5)).await?;
    let rollback = checkpoints
        .rollback_to_checkpoint(&t1, &checkpoint.checkpoint_id, true)
        .await?;
    println!("{}", serde_json::to_string_pretty(&rollback.to_response()?)?);

    // (C) compaction で中断したセッションを再開
    let sid = SessionId::new("demo-session")?;
    recovery.start_session(sid.clone(), Some(t1.clone())).await?;
    recovery.record_action(&sid, "edit", "rotate refresh tokens").await?;
    recovery
        .mark_interrupted(
            &sid,
            RecoveryType::Compaction,
            Some(SessionSnapshot {
                immediate_context: Some(ImmediateContext {
                    working_on: "refresh token rotation".into(),
                    next_step: "add expiry test".into(),
                    ..Default::default()
                }),
                unsaved_changes: vec!["src/auth.rs".into()],
                note: None,
            }),
        )
        .await?;
    let report = recovery.check_for_recovery(true).await?;
    for candidate in &report.sessions {
        println!("{}\n", candidate.resume_prompt);
    }
    let resumed = recovery.resume(&sid).await?;
    info!(session_id = %sid, status = %resumed.value.session.status, "session resumed");

    // (D) 同じファイルを触る 2 つ目の task で衝突検出
    let t2 = TaskId::new("T2")?;
    let mut other = ContextSnapshot::named("session store cleanup");
    other.status = TaskStatus::InProgress;
    other.key_files = vec!["src/session.rs".into()];
    versions.create(t2, other).await?;
    let scan = engine.conflicts().scan(ScanRequest::in_progress()).await?;
    println!("{}", serde_json::to_string_pretty(&scan.to_response()?)?);

    drop(engine);
    let _ = printer.await;
    Ok(())
}
