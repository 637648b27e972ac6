//! Ingestion, reconciliation and retrieval workflows.
//!
//! This module coordinates the store lifecycle:
//! - Create-store and add-files workflows (background)
//! - On-demand task status reconciliation
//! - Multi-store retrieval fan-out
//! - RAG query over retrieved chunks
//! - Store and file management

mod ingestion;
mod query;
mod reconcile;
mod retrieval;
mod stores;
#[cfg(test)]
pub(crate) mod testing;

pub use ingestion::{CreateStoreRequest, UploadFile};
pub use query::{QueryRequest, QueryResponse};
pub use reconcile::{DocumentView, TaskStatusView};
pub use retrieval::RetrieveRequest;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chat::ChatClient;
use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::error::ServiceResult;
use crate::gateway::IndexingGateway;
use crate::staging::FileStaging;

/// Main service coordinator
pub struct NeedleService {
    pub runtime_config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub gateway: Arc<dyn IndexingGateway>,
    pub staging: Arc<FileStaging>,
    pub chat: Arc<ChatClient>,
}

impl NeedleService {
    pub fn new(
        runtime_config: Arc<RuntimeConfig>,
        db: Arc<Database>,
        gateway: Arc<dyn IndexingGateway>,
        staging: Arc<FileStaging>,
        chat: Arc<ChatClient>,
    ) -> Self {
        info!(
            staging_dir = %staging.root().display(),
            "Initializing Needle service"
        );

        Self {
            runtime_config,
            db,
            gateway,
            staging,
            chat,
        }
    }

    /// Fail tasks whose workflow died with a previous process.
    ///
    /// Workflows run in-process, so a task still running without a job id
    /// at startup will never make progress.
    pub fn recover_interrupted_tasks(&self) -> ServiceResult<usize> {
        let count = self
            .db
            .fail_interrupted_tasks("Task interrupted by service restart")?;

        if count > 0 {
            warn!(count, "Marked interrupted tasks as failed");
        }

        Ok(count)
    }

    /// Persist setting overrides and hot-reload the dynamic config.
    ///
    /// A null value removes the override for that key.
    pub fn update_settings(&self, settings: &HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        self.db.set_settings(settings)?;
        self.runtime_config.reload_from_db(&self.db)?;

        info!(keys = settings.len(), "Settings updated");
        Ok(())
    }
}
