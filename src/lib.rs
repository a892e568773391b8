//! Idlegate - wakes a GPU backend on demand and stops it when idle
//!
//! This library provides an activity-driven reverse proxy that:
//! - Forwards HTTP and WebSocket traffic to a single backend
//! - Starts the backend (local process or Docker container) when traffic arrives
//! - Tracks in-flight requests and the backend's own job queue as activity
//! - Stops the backend after a configurable idle timeout
//! - Exposes an admin API with status, manual control, settings and an event stream

pub mod activity;
pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod idle;
pub mod lifecycle;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod target;
