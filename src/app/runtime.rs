//! Runtime initialization: logging, data-directory setup, and the
//! startup reconcile pass every entry point (CLI or worker) performs
//! before touching the Session Store.

use tracing::{debug, warn};

use crate::app::{config::AppConfig, logging::init_logging};
use crate::paths;
use crate::session::SqliteSessionStore;
use crate::Result;

/// Initialize logging, ensure the data root exists, and run one Reconciler
/// pass. Reconciliation failures are non-fatal — the CLI still starts even
/// if a drift check fails.
pub async fn initialize_app(config: &AppConfig) -> Result<()> {
    init_logging(config);

    std::fs::create_dir_all(&config.data_root)?;

    let db_path = paths::database_path(&config.data_root);
    let store = SqliteSessionStore::connect(&db_path).await?;

    match crate::reconciler::Reconciler::new(&store, &config.data_root)
        .reconcile()
        .await
    {
        Ok(report) => {
            if report.total_checked() > 0 {
                debug!(
                    "startup reconcile: {} checked, {} marked error, {} restored",
                    report.total_checked(),
                    report.marked_error.len(),
                    report.restored.len()
                );
            }
        }
        Err(e) => warn!("startup reconcile failed (non-fatal): {e}"),
    }

    Ok(())
}
