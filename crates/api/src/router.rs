//! Router construction.

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;

use crate::auth::mgmt_auth;
use crate::handlers::{device, group, mgmt, schedule, timeseries};
use crate::state::ApiState;

/// The device-facing API, served on the public HTTP port.
pub fn device_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(device::health))
        .route("/device/auth", post(device::register).get(device::online))
        .route("/device/s", post(device::send))
        .route("/device/r", get(device::recv))
        .route("/device/ts", get(timeseries::query))
        .route("/group/join", post(group::join))
        .route("/group/devices", get(group::devices))
        .route("/schedule", post(schedule::create).get(schedule::list))
        .route("/schedule/:id", put(schedule::update).delete(schedule::remove))
        .with_state(state)
}

/// The management API, served on the management port behind the bearer
/// check.
pub fn mgmt_router(state: ApiState) -> Router {
    Router::new()
        .route("/mgmt/devices", get(mgmt::list_devices).post(mgmt::create_device))
        .route("/mgmt/devices/:uuid", get(mgmt::get_device))
        .route(
            "/mgmt/bridge/remotes",
            get(mgmt::list_remotes).post(mgmt::add_remote),
        )
        .route(
            "/mgmt/bridge/remotes/:broker_id",
            put(mgmt::update_remote).delete(mgmt::delete_remote),
        )
        .route("/mgmt/bridge/reload", post(mgmt::reload_remotes))
        .route(
            "/mgmt/bridge/shares",
            get(mgmt::list_shares)
                .post(mgmt::add_share)
                .delete(mgmt::remove_share),
        )
        .route("/mgmt/bridge/status", get(mgmt::bridge_status))
        .route("/mgmt/bridge/shared-data", get(mgmt::shared_data))
        .layer(middleware::from_fn_with_state(state.clone(), mgmt_auth))
        .with_state(state)
}
