//! Command dispatch: routes a parsed `Commands` variant to the component
//! that implements it (Supervisor, Session Store, Log Tailer, Reconciler),
//! and renders the result as plain text by default, JSON on request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::app::AppConfig;
use crate::cli::args::Commands;
use crate::paths;
use crate::reconciler::Reconciler;
use crate::session::{Session, SessionStatus, SessionStore, SqliteSessionStore, StartOptions};
use crate::supervisor::Supervisor;
use crate::tailer::LogTailer;
use crate::Result;

/// Dispatch a parsed command. Shared across the single-shot CLI entrypoint;
/// owns nothing beyond what a single invocation needs.
pub async fn execute_command(command: Commands, config: &AppConfig) -> Result<()> {
    let store: Arc<dyn SessionStore> =
        Arc::new(SqliteSessionStore::connect(&paths::database_path(&config.data_root)).await?);

    match command {
        Commands::Start {
            task,
            iterations,
            model,
            path,
            background,
            no_sleep_inhibitor,
            checkpoint_interval,
            allowed_tools,
        } => {
            start(
                store,
                config,
                task,
                iterations,
                model,
                path,
                background,
                no_sleep_inhibitor,
                checkpoint_interval,
                allowed_tools,
            )
            .await
        }
        Commands::Stop { session_id } => stop(store, config, session_id).await,
        Commands::Status { status, json } => status_cmd(store, status, json).await,
        Commands::Stats { json } => stats(store, json).await,
        Commands::Tail {
            session_id,
            interval_secs,
            follow_until_done,
        } => tail(store, config, session_id, interval_secs, follow_until_done).await,
        Commands::Cleanup { days } => cleanup(store, days).await,
        Commands::Validate { dry_run } => validate(store, config, dry_run).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn start(
    store: Arc<dyn SessionStore>,
    config: &AppConfig,
    task: String,
    iterations: u32,
    model: Option<String>,
    path: Option<std::path::PathBuf>,
    background: bool,
    no_sleep_inhibitor: bool,
    checkpoint_interval: u64,
    allowed_tools: Option<Vec<String>>,
) -> Result<()> {
    let options = StartOptions {
        iterations,
        model,
        working_dir: path,
        background,
        prevent_sleep: !no_sleep_inhibitor && !config.no_sleep_inhibitor,
        checkpoint_interval,
        allowed_tools: allowed_tools.unwrap_or_default(),
    };

    let supervisor = Supervisor::new(
        store,
        config.data_root.clone(),
        config.assistant_program.clone(),
        options.allowed_tools.clone(),
    );

    let session = if background {
        supervisor.start_background(task, options).await?
    } else {
        supervisor.start_foreground(task, options).await?
    };

    println!("{} {} ({})", session.id, session.task, session.status);
    Ok(())
}

async fn stop(store: Arc<dyn SessionStore>, config: &AppConfig, session_id: String) -> Result<()> {
    let supervisor = Supervisor::new(store, config.data_root.clone(), config.assistant_program.clone(), vec![]);
    let session = supervisor.stop(&session_id).await?;
    println!("{} stopped (status: {})", session.id, session.status);
    Ok(())
}

async fn status_cmd(store: Arc<dyn SessionStore>, status: Option<String>, json: bool) -> Result<()> {
    let sessions = match status {
        Some(s) => {
            let parsed: SessionStatus = s.parse()?;
            store.by_status(parsed).await?
        }
        None => store.all().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in &sessions {
        print_session_line(s);
    }
    Ok(())
}

fn print_session_line(s: &Session) {
    println!(
        "{:<28} {:<10} {}/{} iterations  {}",
        s.id, s.status, s.iterations_completed, s.iterations_planned, s.task
    );
}

async fn stats(store: Arc<dyn SessionStore>, json: bool) -> Result<()> {
    let stats = store.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "total={} running={} completed={} error={} stopped={} failed={} pending={}",
            stats.total,
            stats.running,
            stats.completed,
            stats.error,
            stats.stopped,
            stats.failed,
            stats.pending
        );
    }
    Ok(())
}

async fn tail(
    store: Arc<dyn SessionStore>,
    config: &AppConfig,
    session_id: String,
    interval_secs: u64,
    follow_until_done: bool,
) -> Result<()> {
    let session = store
        .find_by_partial_id(&session_id)
        .await?
        .ok_or_else(|| crate::Error::NotFound(session_id))?;

    let tailer = LogTailer::new(config.data_root.clone());

    if !follow_until_done {
        match tailer.read_once(&session.id).await? {
            Some(content) => print!("{content}"),
            None => println!("(no log yet)"),
        }
        return Ok(());
    }

    let interval = Duration::from_secs(interval_secs.max(1));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let watcher_flag = stop_flag.clone();
    let watcher_store = store.clone();
    let watch_id = session.id.clone();
    let watcher = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Ok(Some(s)) = watcher_store.get(&watch_id).await {
                if s.status.is_terminal() {
                    watcher_flag.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let follow_id = session.id.clone();
    let follow_flag = stop_flag.clone();
    let follow_task = tokio::spawn(async move {
        tailer
            .follow(&follow_id, interval, tx, move || follow_flag.load(Ordering::SeqCst))
            .await;
    });

    while let Some(chunk) = rx.recv().await {
        print!("{}", chunk.text);
    }

    watcher.abort();
    let _ = follow_task.await;
    Ok(())
}

async fn cleanup(store: Arc<dyn SessionStore>, days: i64) -> Result<()> {
    let removed = store.cleanup_terminated(days).await?;
    println!("removed {removed} session(s) older than {days} day(s)");
    Ok(())
}

async fn validate(store: Arc<dyn SessionStore>, config: &AppConfig, dry_run: bool) -> Result<()> {
    if dry_run {
        let running = store.by_status(SessionStatus::Running).await?;
        println!("would check {} running session(s)", running.len());
        return Ok(());
    }

    let reconciler = Reconciler::new(store.as_ref(), &config.data_root);
    let report = reconciler.reconcile().await?;
    println!(
        "checked={} marked_error={} restored={} adopted_pids={} orphans={}",
        report.total_checked(),
        report.marked_error.len(),
        report.restored.len(),
        report.adopted_pids.len(),
        report.orphans.len()
    );
    Ok(())
}
