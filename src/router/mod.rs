//! HTTP API.

pub mod create;
pub mod status;
