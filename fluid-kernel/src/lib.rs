//! Fluid kernel: control plane for sandbox hosts.
//!
//! Hosts dial in over a WebSocket (`stream`), get tracked in the `registry`,
//! and receive commands through the `correlator`. The `orchestrator` turns
//! org-scoped API calls into host commands and persists results in the `store`.

pub mod config;
pub mod correlator;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod stream;
