//! The managed backend, seen through a small async interface

use crate::config::{SharedSettings, TargetConfig, TargetType};
use crate::docker::DockerTarget;
use crate::error::TargetError;
use crate::process::LocalProcess;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Local,
    Docker,
}

/// Point-in-time description of the target
#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub kind: TargetKind,
    pub name: String,
    /// Process id or container id
    pub id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub alive: bool,
}

/// Upper bound for [`Target::logs`] requests
pub const MAX_LOG_TAIL: usize = 1000;
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Result of a stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// The target ignored the graceful signal and had to be killed
    pub forced: bool,
}

/// Lifecycle operations on the backend.
///
/// Implementations own the raw handle (child process, container id). `stop`
/// must be idempotent: stopping a target that is already gone succeeds.
#[async_trait]
pub trait Target: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Launch the backend. Returns once it has been spawned, not once it is ready.
    async fn start(&self) -> Result<(), TargetError>;

    /// Graceful stop, escalating to a forced kill after `grace`
    async fn stop(&self, grace: Duration) -> Result<StopReport, TargetError>;

    /// Whether the process or container currently exists and runs
    async fn is_alive(&self) -> bool;

    async fn inspect(&self) -> Result<TargetInfo, TargetError>;

    /// The last `tail` lines of backend output, oldest first
    async fn logs(&self, tail: usize) -> Result<Vec<String>, TargetError>;
}

/// Build the target described by the config
pub fn from_config(config: &TargetConfig, settings: SharedSettings) -> Arc<dyn Target> {
    match config.target_type {
        TargetType::Local => Arc::new(LocalProcess::new(config.clone(), settings)),
        TargetType::Docker => Arc::new(DockerTarget::new(config.clone(), settings)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use parking_lot::RwLock;

    fn settings() -> SharedSettings {
        Arc::new(RwLock::new(RuntimeSettings {
            idle_timeout_secs: 600,
            poll_interval_secs: 5,
            startup_timeout_secs: 30,
            auto_start_enabled: true,
            target_name: "comfyui".to_string(),
        }))
    }

    #[test]
    fn test_from_config_picks_target_kind() {
        let local = from_config(&TargetConfig::local("python main.py", 8189), settings());
        assert_eq!(local.kind(), TargetKind::Local);

        let docker = from_config(&TargetConfig::docker("comfyui", 8189), settings());
        assert_eq!(docker.kind(), TargetKind::Docker);
    }
}
