//! Fluid host agent
//!
//! Runs on a virtualization host and executes sandbox commands on behalf of
//! the kernel over a single outbound WebSocket:
//! - `client`: registration, heartbeats, command dispatch
//! - `reconnect`: exponential backoff between sessions
//! - `handlers`: one reply per command, rollback on partial create
//! - `janitor`: destroys sandboxes past their TTL
//! - `managers`: QEMU microVMs, tap devices, overlays, images, source VMs
//! - `state`: local record of sandboxes, survives restarts

pub mod client;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod handlers;
pub mod janitor;
pub mod managers;
pub mod metrics;
pub mod reconnect;
pub mod state;
