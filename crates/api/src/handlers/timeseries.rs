//! Timeseries query endpoint.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::response::{code, err, ok, storage_err, Envelope};
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsQuery {
    pub auth_key: String,
    pub data_key: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// `GET /device/ts` — paged history of the caller's own recorded data,
/// newest first.
pub async fn query(State(state): State<ApiState>, Query(query): Query<TsQuery>) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&query.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };

    match state
        .db
        .query_timeseries(
            &device.uuid,
            query.data_key.as_deref(),
            query.start,
            query.end,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
        )
        .await
    {
        Ok(page) => ok(page),
        Err(e) => storage_err(e),
    }
}
