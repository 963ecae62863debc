//! HTTP handlers.

pub mod device;
pub mod group;
pub mod mgmt;
pub mod schedule;
pub mod timeseries;
