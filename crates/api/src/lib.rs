//! HTTP surfaces.
//!
//! Two routers share one state: the device-facing API (register, online,
//! publish, receive, groups, timeseries, schedules) and the management API
//! (device and peer administration). Every response uses the
//! `{"message": code, "detail": value}` envelope; the code carries the
//! outcome and the transport status is always 200.

mod auth;
mod handlers;
mod response;
mod router;
mod state;

pub use response::{code, Envelope};
pub use router::{device_router, mgmt_router};
pub use state::ApiState;
