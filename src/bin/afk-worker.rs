//! Worker Bootstrap: the detached process `Supervisor::start_background`
//! execs. Decodes its `WorkerConfig` argument, redirects stdio into the
//! session's worker log, detaches from its parent's controlling terminal,
//! and runs the same foreground loop the in-process path uses.

use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use afk::app::AppConfig;
use afk::paths;
use afk::session::{SessionStore, SqliteSessionStore, WorkerConfig};
use afk::supervisor::Supervisor;

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("afk-worker: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> afk::Result<()> {
    let raw = std::env::args()
        .nth(1)
        .ok_or_else(|| afk::Error::Validation("afk-worker requires a config argument".to_string()))?;
    let config = WorkerConfig::decode(&raw)?;

    detach()?;

    let runtime = tokio::runtime::Runtime::new().map_err(afk::Error::from)?;
    runtime.block_on(async_main(config))
}

/// Become a session leader so we survive the parent shell exiting, ahead of
/// redirecting the three standard streams away from whatever terminal spawned
/// us. `setsid` is also invoked by the parent via `pre_exec` before this
/// binary's entrypoint runs; calling it again here is a no-op once already a
/// session leader and is otherwise harmless.
#[cfg(unix)]
fn detach() -> afk::Result<()> {
    let _ = nix::unistd::setsid();
    Ok(())
}

#[cfg(not(unix))]
fn detach() -> afk::Result<()> {
    Ok(())
}

async fn async_main(config: WorkerConfig) -> afk::Result<()> {
    let app_config = AppConfig::new(0).map_err(|e| afk::Error::Other(e.to_string()))?;
    let data_root = app_config.data_root.clone();

    let worker_log = paths::registry_dir(&data_root)
        .join(config.session_id.as_str())
        .join("worker.log");
    if let Some(parent) = worker_log.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    redirect_stdio(&worker_log)?;

    if let Err(e) = std::env::set_current_dir(&config.working_directory) {
        tracing::warn!(
            "afk-worker: could not chdir to {}: {e}",
            config.working_directory.display()
        );
    }

    afk::app::init_logging(&app_config);

    let store: Arc<dyn SessionStore> = Arc::new(
        SqliteSessionStore::connect(&paths::database_path(&data_root)).await?,
    );

    let session = store
        .get(&config.session_id)
        .await?
        .ok_or_else(|| afk::Error::NotFound(config.session_id.to_string()))?;

    let stop_flag = spawn_signal_handlers();

    let supervisor = Arc::new(Supervisor::new(
        store,
        data_root,
        app_config.assistant_program.clone(),
        config.options.allowed_tools.clone(),
    ));

    let session_id = session.id.clone();
    let supervisor_for_signal = supervisor.clone();
    tokio::select! {
        result = supervisor.run_foreground_loop(&session.id) => result,
        _ = wait_for_stop(stop_flag) => {
            supervisor_for_signal.stop(session_id.as_str()).await?;
            Ok(())
        }
    }
}

/// Redirect stdout/stderr (and close stdin) to the session's worker log so
/// the assistant invocation's own console output never leaks to whatever
/// terminal happened to be around when the worker was forked.
#[cfg(unix)]
fn redirect_stdio(log_path: &std::path::Path) -> afk::Result<()> {
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let fd = file.as_raw_fd();
    unsafe {
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
    std::mem::forget(file);
    Ok(())
}

#[cfg(not(unix))]
fn redirect_stdio(_log_path: &std::path::Path) -> afk::Result<()> {
    Ok(())
}

/// Install SIGTERM/SIGINT handlers that flip an atomic flag the async loop
/// watches for, and ignore SIGHUP so losing the (already detached)
/// controlling terminal never kills the worker.
fn spawn_signal_handlers() -> Arc<std::sync::atomic::AtomicBool> {
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag_for_thread = flag.clone();
    if let Ok(mut signals) = Signals::new([SIGTERM, SIGINT, SIGHUP]) {
        std::thread::spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGTERM | SIGINT => {
                        flag_for_thread.store(true, std::sync::atomic::Ordering::SeqCst);
                        break;
                    }
                    SIGHUP => continue,
                    _ => {}
                }
            }
        });
    }
    flag
}

async fn wait_for_stop(flag: Arc<std::sync::atomic::AtomicBool>) {
    loop {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}
