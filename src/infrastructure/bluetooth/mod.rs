//! Bluetooth Module
//!
//! Keeps one BLE peripheral connected and routes its characteristic values to
//! typed resources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Event loop - public API for the application)           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!             ┌───────────────────┐
//!             │ ConnectionManager │
//!             └─────────┬─────────┘
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │  Registry  │  │ Protocol │
//! │           │  │            │  │          │
//! │ - scan    │  │ - bindings │  │ - events │
//! │ - matching│  │ - routing  │  │ - cmds   │
//! └───────────┘  └─────┬──────┘  └────┬─────┘
//!                      ▼              ▼
//!                 Resource<C>    Radio backend
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opaque handles, radio events and radio commands
//! - [`resource`] - Typed resources bound to one characteristic each
//! - [`registry`] - Handle to resource bindings
//! - [`scanner`] - Scan control and advertisement matching
//! - [`connection`] - Connection state machine
//! - [`service`] - Event loop driving the connection manager
//! - [`worker`] - Ordered per-peripheral command queues for backends
//! - `backend` - btleplug radio backend (feature `btleplug`)

#[cfg(feature = "btleplug")]
pub mod backend;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod scanner;
pub mod service;
pub mod worker;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use protocol::{RadioCommand, RadioEvent, RadioLink};
pub use resource::{DataResource, Resource};
pub use service::{BluetoothCommand, BluetoothService};
