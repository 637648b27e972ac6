use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::format_error_chain;
use crate::gateway::{Chunk, RetrieveParams};
use crate::service::NeedleService;

/// Retrieval request across one or more stores.
///
/// Unset tuning parameters fall back to the `retrieval` settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrieveRequest {
    pub store_ids: Vec<String>,
    pub query: String,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub rerank_top_k: Option<u32>,
    #[serde(default)]
    pub sparse_top_k: Option<u32>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub filters: Option<Vec<HashMap<String, String>>>,
}

impl NeedleService {
    /// Query every store concurrently and concatenate the chunks.
    ///
    /// Chunks arrive in completion order. A store whose call fails
    /// contributes nothing and is logged; it never fails the whole call.
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Vec<Chunk> {
        let defaults = self.runtime_config.dynamic().retrieval.clone();
        let params = Arc::new(RetrieveParams {
            query: request.query.clone(),
            top_k: request.top_k.unwrap_or(defaults.top_k),
            rerank_top_k: request.rerank_top_k.unwrap_or(defaults.rerank_top_k),
            sparse_top_k: request.sparse_top_k.unwrap_or(defaults.sparse_top_k),
            min_score: request.min_score.unwrap_or(defaults.min_score),
            filters: request.filters.clone(),
        });

        let store_ids = dedupe(&request.store_ids);
        let start = Instant::now();

        // Caps in-flight gateway calls
        let semaphore = Arc::new(Semaphore::new(defaults.max_concurrency.max(1)));
        let mut branches = JoinSet::new();

        for store_id in store_ids.iter().cloned() {
            let gateway = self.gateway.clone();
            let params = params.clone();
            let semaphore = semaphore.clone();

            branches.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = gateway.retrieve(&store_id, &params).await;
                (store_id, result)
            });
        }

        let mut chunks = Vec::new();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((store_id, Ok(found))) => {
                    debug!(store_id = %store_id, chunks = found.len(), "Store retrieval succeeded");
                    chunks.extend(found);
                }
                Ok((store_id, Err(e))) => {
                    warn!(
                        store_id = %store_id,
                        error = %format_error_chain(&e),
                        "Store retrieval failed, omitting its chunks"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Store retrieval branch panicked");
                }
            }
        }

        debug!(
            stores = store_ids.len(),
            chunks = chunks.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Retrieval complete"
        );

        chunks
    }
}

/// Drop repeated ids, keeping first occurrence order
fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
