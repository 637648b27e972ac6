//! Settings API endpoints for runtime configuration.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::AppState;
use crate::config::DynamicConfig;
use crate::error::ServiceError;

/// Response for GET /api/settings
#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    /// All current settings (merged: defaults + DB overrides)
    pub settings: HashMap<String, serde_json::Value>,
    /// Which keys have DB overrides (vs using defaults)
    pub overridden: Vec<String>,
}

/// Request body for PUT /api/settings
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    /// Settings to update (key -> value). Use null to revert to default.
    pub settings: HashMap<String, serde_json::Value>,
}

/// GET /api/settings - retrieve all settings with their current values
pub async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SettingsResponse>, ServiceError> {
    let db_settings = state.service.db.get_all_settings()?;

    let config = state.service.runtime_config.dynamic();
    let mut overridden: Vec<String> = db_settings.into_keys().collect();
    overridden.sort();

    Ok(Json(SettingsResponse {
        settings: config.to_key_value_map(),
        overridden,
    }))
}

/// PUT /api/settings - update settings (triggers hot reload)
pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, ServiceError> {
    let valid_keys = DynamicConfig::valid_keys();
    if let Some(key) = request
        .settings
        .keys()
        .find(|key| !valid_keys.contains(key.as_str()))
    {
        return Err(ServiceError::InvalidRequest {
            message: format!("Unknown setting key: {}", key),
        });
    }

    state.service.update_settings(&request.settings)?;

    get_settings_handler(State(state)).await
}
