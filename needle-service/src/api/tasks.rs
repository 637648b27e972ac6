use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use crate::error::ServiceError;
use crate::service::TaskStatusView;

use super::AppState;

/// Poll a task; reconciles against the remote index job first
pub async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusView>, ServiceError> {
    let view = state.service.get_task_status(&task_id).await?;
    Ok(Json(view))
}
