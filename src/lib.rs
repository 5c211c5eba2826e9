//! Keeps a BLE peripheral connected and exposes its characteristics as typed
//! resources.

pub mod domain;
pub mod infrastructure;
