//! HTTP admin surface for a zram-plus device.
//!
//! - [`admin_api`]: request/response types and route handlers

pub mod admin_api;
