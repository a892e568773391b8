//! Lifecycle controller: the single owner of the backend's state.
//!
//! Every transition (start, stop, idle stop, reconciliation) runs under one
//! async transition lock, so at most one start is ever in flight and stops
//! are applied only after a running start settles. Status, the activity clock
//! and the in-flight counter sit behind short-held locks or atomics and can be
//! read at any time without waiting for a transition.

use crate::activity::{ActivityKind, ActivityLog};
use crate::config::{ConfigValidationError, RuntimeSettings, SettingsStore, SettingsUpdate};
use crate::error::{LifecycleError, TargetError};
use crate::idle;
use crate::probe::{ProbeError, Prober, QueueCheck};
use crate::target::{Target, TargetKind, MAX_LOG_TAIL};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The last start or stop failed. A new start is always allowed.
    Error,
    /// The configured container does not exist
    NotFound,
}

impl LifecycleState {
    /// Whether the target is, or is about to be, consuming resources
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
            LifecycleState::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Fixed timings that do not change at runtime
#[derive(Debug, Clone)]
pub struct LifecycleTimings {
    pub shutdown_grace_period: Duration,
    pub drain_timeout: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only view of the controller for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub state: LifecycleState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub idle_seconds: u64,
    /// Seconds until the idle stop, only while running
    pub remaining_seconds: Option<u64>,
    pub in_flight: usize,
    pub last_error: Option<String>,
    pub auto_start_enabled: bool,
    pub idle_timeout_secs: u64,
    pub target: String,
    pub target_kind: TargetKind,
}

struct Status {
    state: LifecycleState,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Outcome of the last failed start, handed to callers that waited on it
    last_failure: Option<LifecycleError>,
    /// Last time the backend was seen answering
    last_ready_check: Option<Instant>,
    /// Number of settled start attempts
    episodes: u64,
}

struct ActivityClock {
    instant: Instant,
    wall: DateTime<Utc>,
}

/// Decrements the in-flight counter when dropped
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the backend lifecycle.
///
/// Like the other long-lived services here it is created behind an `Arc`;
/// methods that may spawn the idle monitor take `self: &Arc<Self>`.
pub struct LifecycleController {
    target: Arc<dyn Target>,
    prober: Prober,
    queue: Option<Arc<dyn QueueCheck>>,
    settings: Arc<SettingsStore>,
    timings: LifecycleTimings,
    activity: Arc<ActivityLog>,
    status: RwLock<Status>,
    clock: Mutex<ActivityClock>,
    in_flight: Arc<AtomicUsize>,
    transition: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<watch::Sender<bool>>>,
}

impl LifecycleController {
    pub fn new(
        target: Arc<dyn Target>,
        prober: Prober,
        queue: Option<Arc<dyn QueueCheck>>,
        settings: Arc<SettingsStore>,
        activity: Arc<ActivityLog>,
        timings: LifecycleTimings,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            prober,
            queue,
            settings,
            timings,
            activity,
            status: RwLock::new(Status {
                state: LifecycleState::Stopped,
                started_at: None,
                last_error: None,
                last_failure: None,
                last_ready_check: None,
                episodes: 0,
            }),
            clock: Mutex::new(ActivityClock {
                instant: Instant::now(),
                wall: Utc::now(),
            }),
            in_flight: Arc::new(AtomicUsize::new(0)),
            transition: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.status.read().state
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings.get()
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub(crate) fn queue_probe(&self) -> Option<&Arc<dyn QueueCheck>> {
        self.queue.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_duration(&self) -> Duration {
        self.clock.lock().instant.elapsed()
    }

    /// Make sure the backend is running and ready, starting it if needed.
    ///
    /// Concurrent callers share one start: whoever waited on it gets its
    /// outcome instead of launching another.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<StartOutcome, LifecycleError> {
        let (seen, state) = {
            let status = self.status.read();
            if status.state == LifecycleState::Running
                && status
                    .last_ready_check
                    .is_some_and(|t| t.elapsed() < self.prober.interval())
            {
                return Ok(StartOutcome::AlreadyRunning);
            }
            (status.episodes, status.state)
        };

        if state == LifecycleState::Running && self.prober.probe_once().await {
            self.mark_responsive();
            return Ok(StartOutcome::AlreadyRunning);
        }

        let _guard = self.transition.lock().await;

        {
            let status = self.status.read();
            if status.episodes > seen {
                match status.state {
                    LifecycleState::Running => return Ok(StartOutcome::AlreadyRunning),
                    LifecycleState::Error | LifecycleState::NotFound => {
                        if let Some(ref err) = status.last_failure {
                            return Err(err.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        match self.state() {
            LifecycleState::Running => {
                if self.target.is_alive().await {
                    // A busy backend may miss health checks; requests are forwarded regardless
                    if self.prober.probe_once().await {
                        self.mark_responsive();
                    } else {
                        debug!("Backend is alive but not answering probes");
                    }
                    return Ok(StartOutcome::AlreadyRunning);
                }
                self.clean_up_exited().await;
            }
            LifecycleState::NotFound => match self.target.inspect().await {
                Err(TargetError::NotFound(name)) => {
                    return Err(self.settle_failure(LifecycleError::TargetNotFound(name)));
                }
                Err(e) => warn!(error = %e, "Failed to inspect target before start"),
                Ok(_) => {
                    info!("Target found again");
                    self.set_state(LifecycleState::Stopped);
                }
            },
            _ => {}
        }

        self.start_locked().await
    }

    /// Tear down a Running target whose process or container is gone.
    /// Caller holds the transition lock.
    async fn clean_up_exited(&self) {
        self.activity
            .record(ActivityKind::Error, "Backend exited unexpectedly, restarting");
        self.set_state(LifecycleState::Stopping);
        self.cancel_monitor();
        self.drain().await;
        if let Err(e) = self.target.stop(self.timings.shutdown_grace_period).await {
            warn!(error = %e, "Failed to clean up exited backend");
        }
        let mut status = self.status.write();
        status.state = LifecycleState::Stopped;
        status.started_at = None;
        status.last_ready_check = None;
    }

    /// Start sequence. Caller holds the transition lock.
    async fn start_locked(self: &Arc<Self>) -> Result<StartOutcome, LifecycleError> {
        let settings = self.settings.get();
        let startup_timeout = settings.startup_timeout();

        {
            let mut status = self.status.write();
            status.state = LifecycleState::Starting;
            status.last_error = None;
            status.last_failure = None;
        }
        self.activity.record(
            ActivityKind::System,
            format!("Starting {}", settings.target_name),
        );

        if let Err(e) = self.target.start().await {
            let err = LifecycleError::from(e);
            if !matches!(err, LifecycleError::TargetNotFound(_)) {
                self.cleanup_failed_start().await;
            }
            return Err(self.settle_failure(err));
        }

        match self
            .prober
            .wait_until_ready(startup_timeout, self.target.as_ref())
            .await
        {
            Ok(took) => {
                {
                    let mut status = self.status.write();
                    status.state = LifecycleState::Running;
                    status.started_at = Some(Utc::now());
                    status.last_ready_check = Some(Instant::now());
                    status.episodes += 1;
                }
                self.reset_clock();
                self.activity.record(
                    ActivityKind::System,
                    format!(
                        "{} is ready (took {:.1}s)",
                        settings.target_name,
                        took.as_secs_f64()
                    ),
                );
                self.start_monitor();
                Ok(StartOutcome::Started)
            }
            Err(probe_err) => {
                let err = match probe_err {
                    ProbeError::Timeout(_) => LifecycleError::ReadinessTimeout(startup_timeout.as_secs()),
                    ProbeError::TargetExited => LifecycleError::TargetExited,
                };
                self.cleanup_failed_start().await;
                Err(self.settle_failure(err))
            }
        }
    }

    async fn cleanup_failed_start(&self) {
        match self.target.stop(self.timings.shutdown_grace_period).await {
            Ok(report) if report.forced => warn!("Backend had to be killed during startup cleanup"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to clean up after failed start"),
        }
    }

    /// Record a failed start and return the error to hand out
    fn settle_failure(&self, err: LifecycleError) -> LifecycleError {
        {
            let mut status = self.status.write();
            status.state = if matches!(err, LifecycleError::TargetNotFound(_)) {
                LifecycleState::NotFound
            } else {
                LifecycleState::Error
            };
            status.started_at = None;
            status.last_error = Some(err.to_string());
            status.last_failure = Some(err.clone());
            status.episodes += 1;
        }
        self.activity
            .record(ActivityKind::Error, format!("Start failed: {}", err));
        err
    }

    /// Stop the backend if it is running. A stop requested during a start is
    /// applied once that start settles.
    ///
    /// After a failed stop the state is Error while the target may still be
    /// up, so Error retries the stop whenever the target is alive.
    pub async fn request_stop(&self, reason: &str) -> Result<StopOutcome, LifecycleError> {
        let _guard = self.transition.lock().await;
        match self.state() {
            LifecycleState::Running => self.stop_locked(reason).await,
            LifecycleState::Error if self.target.is_alive().await => {
                info!("Backend still alive after an error, stopping it");
                self.stop_locked(reason).await
            }
            state => {
                debug!(state = %state, "Stop requested while not running");
                Ok(StopOutcome::AlreadyStopped)
            }
        }
    }

    /// Idle monitor entry point. Idleness is re-checked under the transition
    /// lock, so traffic that arrived after the monitor's check wins.
    pub async fn stop_if_idle(&self) -> Result<Option<StopOutcome>, LifecycleError> {
        let _guard = self.transition.lock().await;
        if self.state() != LifecycleState::Running || self.in_flight() > 0 {
            return Ok(None);
        }

        let timeout = self.settings.get().idle_timeout();
        let idle = self.idle_duration();
        if idle < timeout {
            debug!(idle_secs = idle.as_secs(), "Activity arrived before idle stop");
            return Ok(None);
        }

        let reason = format!(
            "Idle timeout ({}) exceeded, stopping backend",
            format_duration(timeout)
        );
        self.stop_locked(&reason).await.map(Some)
    }

    /// Stop sequence. Caller holds the transition lock and has checked the target is up.
    async fn stop_locked(&self, reason: &str) -> Result<StopOutcome, LifecycleError> {
        // No new requests are admitted once Stopping is visible
        self.set_state(LifecycleState::Stopping);
        self.cancel_monitor();
        self.drain().await;

        match self.target.stop(self.timings.shutdown_grace_period).await {
            Ok(report) => {
                if report.forced {
                    warn!(
                        grace_period_secs = self.timings.shutdown_grace_period.as_secs(),
                        "Backend did not exit within the grace period and was killed"
                    );
                }
                {
                    let mut status = self.status.write();
                    status.state = LifecycleState::Stopped;
                    status.started_at = None;
                    status.last_ready_check = None;
                }
                self.activity.record(ActivityKind::Shutdown, reason);
                Ok(StopOutcome::Stopped)
            }
            Err(e) => {
                let err = LifecycleError::Stop(e.to_string());
                {
                    let mut status = self.status.write();
                    status.state = LifecycleState::Error;
                    status.last_error = Some(err.to_string());
                }
                self.activity
                    .record(ActivityKind::Error, format!("Stop failed: {}", e));
                Err(err)
            }
        }
    }

    /// Wait for in-flight requests to finish, up to the drain timeout
    async fn drain(&self) {
        let drain_start = Instant::now();
        while self.in_flight() > 0 {
            if drain_start.elapsed() > self.timings.drain_timeout {
                warn!(
                    remaining = self.in_flight(),
                    "Drain timeout exceeded, proceeding with shutdown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis() as u64, "Drained in-flight requests");
        }
    }

    /// Reset the idle clock. Never blocks on a transition.
    pub fn record_activity(&self) {
        self.touch_clock();
        self.mark_responsive();
    }

    /// Recent backend output, `tail` clamped to 1..=MAX_LOG_TAIL
    pub async fn logs(&self, tail: usize) -> Result<Vec<String>, TargetError> {
        self.target.logs(tail.clamp(1, MAX_LOG_TAIL)).await
    }

    /// Manual idle reset from the admin API
    pub fn reset_idle(&self) {
        self.touch_clock();
        self.activity
            .record(ActivityKind::Activity, "Idle timer reset manually");
    }

    fn touch_clock(&self) {
        let now = Instant::now();
        let mut clock = self.clock.lock();
        if now > clock.instant {
            clock.instant = now;
            clock.wall = Utc::now();
        }
    }

    fn reset_clock(&self) {
        let mut clock = self.clock.lock();
        clock.instant = Instant::now();
        clock.wall = Utc::now();
    }

    fn mark_responsive(&self) {
        let mut status = self.status.write();
        if status.state == LifecycleState::Running {
            status.last_ready_check = Some(Instant::now());
        }
    }

    fn set_state(&self, state: LifecycleState) {
        self.status.write().state = state;
    }

    /// Count a proxied request if the backend is running
    pub fn begin_request(&self) -> Option<InFlightGuard> {
        let status = self.status.read();
        if status.state != LifecycleState::Running {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        })
    }

    pub fn snapshot(&self) -> StateView {
        let settings = self.settings.get();
        let (last_activity, idle) = {
            let clock = self.clock.lock();
            (clock.wall, clock.instant.elapsed())
        };
        let status = self.status.read();

        let remaining_seconds = (status.state == LifecycleState::Running)
            .then(|| settings.idle_timeout().saturating_sub(idle).as_secs());

        StateView {
            state: status.state,
            started_at: status.started_at,
            last_activity,
            idle_seconds: idle.as_secs(),
            remaining_seconds,
            in_flight: self.in_flight(),
            last_error: status.last_error.clone(),
            auto_start_enabled: settings.auto_start_enabled,
            idle_timeout_secs: settings.idle_timeout_secs,
            target: settings.target_name,
            target_kind: self.target.kind(),
        }
    }

    /// Align the state with the live target at startup
    pub async fn reconcile(self: &Arc<Self>) -> LifecycleState {
        let _guard = self.transition.lock().await;

        match self.target.inspect().await {
            Err(TargetError::NotFound(name)) => {
                let err = LifecycleError::TargetNotFound(name);
                let mut status = self.status.write();
                status.state = LifecycleState::NotFound;
                status.last_error = Some(err.to_string());
                status.last_failure = Some(err);
            }
            Err(e) => {
                warn!(error = %e, "Could not inspect target, assuming stopped");
                self.set_state(LifecycleState::Stopped);
            }
            Ok(info) if info.alive && self.prober.probe_once().await => {
                {
                    let mut status = self.status.write();
                    status.state = LifecycleState::Running;
                    status.started_at = Some(info.started_at.unwrap_or_else(Utc::now));
                    status.last_ready_check = Some(Instant::now());
                }
                self.reset_clock();
                self.activity.record(
                    ActivityKind::System,
                    format!("Found {} already running", info.name),
                );
                self.start_monitor();
            }
            Ok(info) => {
                if info.alive {
                    debug!(target = %info.name, "Target is alive but not ready yet");
                }
                self.set_state(LifecycleState::Stopped);
            }
        }

        let state = self.state();
        info!(state = %state, "Reconciled backend state");
        state
    }

    /// Validate and apply a settings update.
    ///
    /// The target cannot be renamed while it is starting, running or stopping.
    pub fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<RuntimeSettings, ConfigValidationError> {
        let status = self.status.read();
        if status.state.is_active() && update.changes_target(&self.settings.get()) {
            return Err(ConfigValidationError::TargetActive(status.state.to_string()));
        }
        let next = self.settings.update(update)?;
        drop(status);

        self.activity
            .record(ActivityKind::System, "Configuration updated");
        Ok(next)
    }

    /// Apply settings re-read from the config file (SIGHUP).
    ///
    /// A target rename is deferred while the target is active.
    pub fn reload_settings(&self, reloaded: RuntimeSettings) -> Result<(), ConfigValidationError> {
        let mut update = SettingsUpdate {
            idle_timeout_secs: Some(reloaded.idle_timeout_secs as i64),
            poll_interval_secs: Some(reloaded.poll_interval_secs as i64),
            startup_timeout_secs: Some(reloaded.startup_timeout_secs as i64),
            auto_start_enabled: Some(reloaded.auto_start_enabled),
            target_name: Some(reloaded.target_name),
        };

        match self.update_settings(&update) {
            Err(ConfigValidationError::TargetActive(state)) => {
                warn!(state = %state, "Target rename ignored while the target is active");
                update.target_name = None;
                self.update_settings(&update).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let (tx, rx) = watch::channel(false);
        if let Some(previous) = self.monitor.lock().replace(tx) {
            let _ = previous.send(true);
        }
        idle::spawn_monitor(Arc::clone(self), rx);
    }

    /// Signal the idle monitor to exit. Never waits for it.
    fn cancel_monitor(&self) {
        if let Some(tx) = self.monitor.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Stop the backend on process exit and silence the monitor
    pub async fn shutdown(&self) -> Result<StopOutcome, LifecycleError> {
        let outcome = self.request_stop("idlegate shutting down").await;
        self.cancel_monitor();
        outcome
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{FakeCheck, FakeQueue};
    use crate::probe::QueueStatus;
    use crate::target::fake::FakeTarget;

    struct Harness {
        controller: Arc<LifecycleController>,
        target: Arc<FakeTarget>,
        check: Arc<FakeCheck>,
    }

    fn settings(idle: u64, poll: u64, startup: u64) -> RuntimeSettings {
        RuntimeSettings {
            idle_timeout_secs: idle,
            poll_interval_secs: poll,
            startup_timeout_secs: startup,
            auto_start_enabled: true,
            target_name: "comfyui".to_string(),
        }
    }

    fn harness_with(
        target: Arc<FakeTarget>,
        check: Arc<FakeCheck>,
        settings: RuntimeSettings,
        queue: Option<Arc<dyn QueueCheck>>,
    ) -> Harness {
        let controller = LifecycleController::new(
            target.clone(),
            Prober::new(check.clone(), Duration::from_secs(1)),
            queue,
            Arc::new(SettingsStore::new(settings, None)),
            Arc::new(ActivityLog::new(100)),
            LifecycleTimings {
                shutdown_grace_period: Duration::from_secs(1),
                drain_timeout: Duration::from_secs(5),
            },
        );
        Harness {
            controller,
            target,
            check,
        }
    }

    fn harness(idle: u64, poll: u64, startup: u64) -> Harness {
        harness_with(
            FakeTarget::stopped(),
            FakeCheck::ready(),
            settings(idle, poll, startup),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_start() {
        let h = harness(600, 5, 30);
        h.target.set_start_delay(Duration::from_secs(2));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let controller = Arc::clone(&h.controller);
            handles.push(tokio::spawn(async move { controller.ensure_running().await }));
        }

        let mut started = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                StartOutcome::Started => started += 1,
                StartOutcome::AlreadyRunning => {}
            }
        }

        assert_eq!(started, 1);
        assert_eq!(h.target.starts(), 1);
        assert_eq!(h.controller.state(), LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_failure() {
        let h = harness_with(
            FakeTarget::stopped(),
            FakeCheck::never(),
            settings(600, 5, 10),
            None,
        );

        let mut handles = Vec::new();
        for _ in 0..5 {
            let controller = Arc::clone(&h.controller);
            handles.push(tokio::spawn(async move { controller.ensure_running().await }));
        }

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(LifecycleError::ReadinessTimeout(10))
            );
        }
        assert_eq!(h.target.starts(), 1);
        assert_eq!(h.target.stops(), 1);
        assert_eq!(h.controller.state(), LifecycleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_cleans_up_once() {
        let h = harness_with(
            FakeTarget::stopped(),
            FakeCheck::never(),
            settings(600, 5, 10),
            None,
        );

        let started = Instant::now();
        let err = h.controller.ensure_running().await.unwrap_err();
        assert_eq!(err, LifecycleError::ReadinessTimeout(10));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(h.target.stops(), 1);

        let view = h.controller.snapshot();
        assert_eq!(view.state, LifecycleState::Error);
        assert!(view.last_error.unwrap().contains("10s"));

        let log = h.controller.activity().recent(1);
        assert_eq!(log[0].kind, ActivityKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_allows_retry() {
        let h = harness(600, 5, 30);
        h.target.set_fail_start(true);

        let err = h.controller.ensure_running().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn(_)));
        assert_eq!(h.controller.state(), LifecycleState::Error);

        h.target.set_fail_start(false);
        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert!(h.controller.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_exiting_during_startup() {
        let h = harness_with(
            FakeTarget::stopped(),
            FakeCheck::never(),
            settings(600, 5, 30),
            None,
        );
        h.target.set_die_on_start(true);

        let started = Instant::now();
        let err = h.controller.ensure_running().await.unwrap_err();
        assert_eq!(err, LifecycleError::TargetExited);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.target.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_running_does_not_restart() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(h.target.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_but_alive_backend_is_not_restarted() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();
        let guard = h.controller.begin_request().unwrap();

        h.check.set_ready(false);
        *h.check.ready_at.lock() = Some(Instant::now() + Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(h.target.starts(), 1);
        assert_eq!(h.target.stops(), 0);
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.controller.in_flight(), 1);
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_backend_restart_drains_first() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();
        let guard = h.controller.begin_request().unwrap();

        h.target.set_alive(false);
        h.check.set_ready(false);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let controller = Arc::clone(&h.controller);
        let restart = tokio::spawn(async move { controller.ensure_running().await });
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(h.controller.state(), LifecycleState::Stopping);
        assert!(h.controller.begin_request().is_none());
        assert_eq!(h.target.stops(), 0);

        drop(guard);
        h.check.set_ready(true);
        assert_eq!(restart.await.unwrap().unwrap(), StartOutcome::Started);
        assert_eq!(h.target.stops(), 1);
        assert_eq!(h.target.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_retried_after_failed_stop() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        h.target.set_fail_stop(true);
        assert!(h.controller.request_stop("manual").await.is_err());
        assert_eq!(h.controller.state(), LifecycleState::Error);
        assert!(h.target.is_alive().await);

        h.target.set_fail_stop(false);
        assert_eq!(
            h.controller.request_stop("manual").await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(h.target.stops(), 2);
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
        assert!(!h.target.is_alive().await);

        assert_eq!(
            h.controller.request_stop("manual").await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(h.target.stops(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logs_tail_is_clamped() {
        let h = harness(600, 5, 30);
        assert_eq!(h.controller.logs(0).await.unwrap().len(), 1);
        assert_eq!(h.controller.logs(20).await.unwrap().len(), 20);
        assert_eq!(h.controller.logs(5000).await.unwrap().len(), MAX_LOG_TAIL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_stopped_is_noop() {
        let h = harness(600, 5, 30);
        assert_eq!(
            h.controller.request_stop("manual").await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(h.target.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        assert_eq!(
            h.controller.request_stop("Stopped via admin API").await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(h.target.stops(), 1);
        assert_eq!(h.controller.state(), LifecycleState::Stopped);

        let entry = &h.controller.activity().recent(1)[0];
        assert_eq!(entry.kind, ActivityKind::Shutdown);
        assert_eq!(entry.message, "Stopped via admin API");

        assert_eq!(
            h.controller.request_stop("again").await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(h.target.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_stop_still_stops() {
        let h = harness(600, 5, 30);
        h.target.set_forced_stop(true);
        h.controller.ensure_running().await.unwrap();
        assert_eq!(
            h.controller.request_stop("manual").await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stop_after_timeout() {
        let h = harness(60, 5, 30);
        h.controller.ensure_running().await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(h.controller.state(), LifecycleState::Running);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
        assert_eq!(h.target.stops(), 1);

        let entry = &h.controller.activity().recent(1)[0];
        assert_eq!(entry.kind, ActivityKind::Shutdown);
        assert!(entry.message.contains("Idle timeout (1m)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_backend_running() {
        let h = harness(60, 5, 30);
        h.controller.ensure_running().await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            h.controller.record_activity();
        }
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.target.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_defers_idle_stop() {
        let h = harness(60, 5, 30);
        h.controller.ensure_running().await.unwrap();

        let guard = h.controller.begin_request().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.controller.in_flight(), 1);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_queue_counts_as_activity() {
        let queue = Arc::new(FakeQueue::default());
        *queue.status.lock() = Some(QueueStatus { running: 1, pending: 0 });
        let h = harness_with(
            FakeTarget::stopped(),
            FakeCheck::ready(),
            settings(60, 5, 30),
            Some(queue.clone()),
        );
        h.controller.ensure_running().await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert!(h
            .controller
            .activity()
            .recent(10)
            .iter()
            .any(|e| e.kind == ActivityKind::Activity && e.message.contains("1 running")));

        *queue.status.lock() = Some(QueueStatus::default());
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_applies_after_start() {
        let h = harness(600, 5, 30);
        h.target.set_start_delay(Duration::from_secs(5));

        let controller = Arc::clone(&h.controller);
        let start = tokio::spawn(async move { controller.ensure_running().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.controller.state(), LifecycleState::Starting);

        let outcome = h.controller.request_stop("manual").await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(start.await.unwrap().unwrap(), StartOutcome::Started);
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
        assert_eq!(h.target.starts(), 1);
        assert_eq!(h.target.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_request_requires_running() {
        let h = harness(600, 5, 30);
        assert!(h.controller.begin_request().is_none());

        h.controller.ensure_running().await.unwrap();
        {
            let _a = h.controller.begin_request().unwrap();
            let _b = h.controller.begin_request().unwrap();
            assert_eq!(h.controller.in_flight(), 2);
        }
        assert_eq!(h.controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_backend_is_restarted() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        h.target.set_alive(false);
        h.check.set_ready(false);
        *h.check.ready_at.lock() = Some(Instant::now() + Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(h.target.starts(), 2);
        assert_eq!(h.target.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_target() {
        let h = harness(600, 5, 30);
        h.target.set_exists(false);

        assert_eq!(h.controller.reconcile().await, LifecycleState::NotFound);
        let err = h.controller.ensure_running().await.unwrap_err();
        assert!(matches!(err, LifecycleError::TargetNotFound(_)));
        assert_eq!(h.target.starts(), 0);
        assert_eq!(h.controller.state(), LifecycleState::NotFound);

        h.target.set_exists(true);
        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::Started
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_adopts_running_target() {
        let h = harness_with(
            FakeTarget::running(),
            FakeCheck::ready(),
            settings(600, 5, 30),
            None,
        );
        assert_eq!(h.controller.reconcile().await, LifecycleState::Running);
        assert_eq!(
            h.controller.ensure_running().await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(h.target.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_stopped_target() {
        let h = harness(600, 5, 30);
        assert_eq!(h.controller.reconcile().await, LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_remaining_time() {
        let h = harness(600, 5, 30);
        let view = h.controller.snapshot();
        assert_eq!(view.state, LifecycleState::Stopped);
        assert!(view.remaining_seconds.is_none());

        h.controller.ensure_running().await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        let view = h.controller.snapshot();
        assert_eq!(view.idle_seconds, 100);
        assert_eq!(view.remaining_seconds, Some(500));
        assert_eq!(view.target, "comfyui");
        assert!(view.started_at.is_some());

        h.controller.reset_idle();
        let view = h.controller.snapshot();
        assert_eq!(view.idle_seconds, 0);
        assert_eq!(view.remaining_seconds, Some(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_does_not_wait_for_start() {
        let h = harness(600, 5, 30);
        h.target.set_start_delay(Duration::from_secs(10));

        let controller = Arc::clone(&h.controller);
        tokio::spawn(async move { controller.ensure_running().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.controller.snapshot().state, LifecycleState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_rename_rejected_while_running() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        let rename = SettingsUpdate {
            target_name: Some("other".to_string()),
            ..Default::default()
        };
        assert_eq!(
            h.controller.update_settings(&rename),
            Err(ConfigValidationError::TargetActive("running".to_string()))
        );
        assert_eq!(h.controller.settings().target_name, "comfyui");

        let timeout = SettingsUpdate {
            idle_timeout_secs: Some(120),
            ..Default::default()
        };
        assert_eq!(
            h.controller.update_settings(&timeout).unwrap().idle_timeout_secs,
            120
        );

        h.controller.request_stop("manual").await.unwrap();
        assert_eq!(
            h.controller.update_settings(&rename).unwrap().target_name,
            "other"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_defers_rename() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        let mut reloaded = settings(900, 10, 30);
        reloaded.target_name = "renamed".to_string();
        h.controller.reload_settings(reloaded).unwrap();

        let current = h.controller.settings();
        assert_eq!(current.idle_timeout_secs, 900);
        assert_eq!(current.target_name, "comfyui");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_change_applies_without_restart() {
        let h = harness(600, 5, 30);
        h.controller.ensure_running().await.unwrap();

        h.controller
            .update_settings(&SettingsUpdate {
                idle_timeout_secs: Some(60),
                ..Default::default()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(66)).await;
        assert_eq!(h.controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(1800)), "30m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::NotFound).unwrap(),
            "\"not_found\""
        );
        assert!(LifecycleState::Starting.is_active());
        assert!(!LifecycleState::Error.is_active());
    }
}
