//! Local subprocess target.
//!
//! The backend runs in its own process group so that helpers it forks (model
//! loaders, worker pools) are signalled together with it.

use crate::config::{SharedSettings, TargetConfig};
use crate::error::TargetError;
use crate::target::{StopReport, Target, TargetInfo, TargetKind, MAX_LOG_TAIL};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a stopping process group is checked for survivors
#[cfg(unix)]
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RunningChild {
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

/// Recent output lines, kept across restarts so a crash can be diagnosed
#[derive(Default)]
struct OutputBuffer {
    lines: parking_lot::Mutex<VecDeque<String>>,
}

impl OutputBuffer {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == MAX_LOG_TAIL {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        lines.iter().skip(lines.len().saturating_sub(n)).cloned().collect()
    }
}

pub struct LocalProcess {
    config: TargetConfig,
    settings: SharedSettings,
    child: Mutex<Option<RunningChild>>,
    output: Arc<OutputBuffer>,
}

impl LocalProcess {
    pub fn new(config: TargetConfig, settings: SharedSettings) -> Self {
        Self {
            config,
            settings,
            child: Mutex::new(None),
            output: Arc::new(OutputBuffer::default()),
        }
    }

    fn name(&self) -> String {
        self.settings.read().target_name.clone()
    }

    /// Program and arguments, splitting `command` like a shell when no args are given
    fn command_line(&self) -> Result<(String, Vec<String>), TargetError> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| TargetError::Spawn("local target requires 'command'".to_string()))?;

        if !self.config.args.is_empty() {
            return Ok((command.to_string(), self.config.args.clone()));
        }

        let mut parts = shell_words::split(command)
            .map_err(|e| TargetError::Spawn(format!("invalid command '{}': {}", command, e)))?;
        if parts.is_empty() {
            return Err(TargetError::Spawn("empty command".to_string()));
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }

    fn build_command(&self) -> Result<Command, TargetError> {
        let (program, args) = self.command_line()?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", self.config.port.to_string());

        Ok(cmd)
    }
}

#[async_trait]
impl Target for LocalProcess {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    async fn start(&self) -> Result<(), TargetError> {
        let mut slot = self.child.lock().await;

        if let Some(running) = slot.as_mut() {
            if matches!(running.child.try_wait(), Ok(None)) {
                debug!(pid = ?running.pid, "Backend process already running");
                return Ok(());
            }
        }

        let name = self.name();
        let mut cmd = self.build_command()?;
        info!(backend = %name, command = ?self.config.command, "Starting local backend");

        let mut child = cmd
            .spawn()
            .map_err(|e| TargetError::Spawn(format!("{}: {}", name, e)))?;
        let pid = child.id();
        info!(backend = %name, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, name.clone(), "stdout", Arc::clone(&self.output));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, name, "stderr", Arc::clone(&self.output));
        }

        *slot = Some(RunningChild {
            child,
            pid,
            started_at: Utc::now(),
        });
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<StopReport, TargetError> {
        // Take the child so liveness checks see it as gone while it winds down
        let Some(mut running) = self.child.lock().await.take() else {
            return Ok(StopReport::default());
        };
        let pid = running.pid;

        let deadline = Instant::now() + grace;

        if let Ok(Some(status)) = running.child.try_wait() {
            debug!(pid = ?pid, ?status, "Backend process had already exited");
            terminate_group(pid);
            let forced = !wait_for_group(pid, deadline).await;
            if forced {
                kill_leftovers(pid);
            }
            return Ok(StopReport { forced });
        }

        info!(pid = ?pid, "Sending SIGTERM to backend process group");
        terminate(&mut running.child, pid);

        match tokio::time::timeout(grace, running.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = ?pid, ?status, "Backend process exited gracefully");
                // Other group members got the same SIGTERM and share the grace period
                let forced = !wait_for_group(pid, deadline).await;
                if forced {
                    warn!(
                        pid = ?pid,
                        grace_period_secs = grace.as_secs(),
                        "Backend subprocesses outlived the grace period"
                    );
                    kill_leftovers(pid);
                }
                Ok(StopReport { forced })
            }
            Ok(Err(e)) => {
                kill_leftovers(pid);
                let _ = running.child.kill().await;
                Err(TargetError::Stop(e.to_string()))
            }
            Err(_) => {
                warn!(
                    pid = ?pid,
                    grace_period_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                kill_leftovers(pid);
                running
                    .child
                    .kill()
                    .await
                    .map_err(|e| TargetError::Stop(e.to_string()))?;
                Ok(StopReport { forced: true })
            }
        }
    }

    async fn is_alive(&self) -> bool {
        let mut slot = self.child.lock().await;
        let Some(running) = slot.as_mut() else {
            return false;
        };
        match running.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = ?running.pid, ?status, "Backend process has exited");
                false
            }
            Err(_) => false,
        }
    }

    async fn inspect(&self) -> Result<TargetInfo, TargetError> {
        let alive = self.is_alive().await;
        let slot = self.child.lock().await;
        Ok(TargetInfo {
            kind: TargetKind::Local,
            name: self.name(),
            id: slot.as_ref().and_then(|r| r.pid).map(|p| p.to_string()),
            started_at: slot.as_ref().map(|r| r.started_at),
            alive,
        })
    }

    async fn logs(&self, tail: usize) -> Result<Vec<String>, TargetError> {
        Ok(self.output.tail(tail))
    }
}

/// Forward each line of backend output to tracing under the `backend` target
/// and keep it, timestamped, for [`Target::logs`]
fn forward_output<R>(reader: R, name: String, stream: &'static str, output: Arc<OutputBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "backend", backend = %name, stream, "{}", line);
                    output.push(format!(
                        "{} {}",
                        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                        line
                    ));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(backend = %name, stream, error = %e, "Stopped reading backend output");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // A negative pid addresses the whole process group led by `pid`
    unsafe { libc::kill(-(pid as i32), signal) == 0 }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// SIGTERM the remains of a group whose leader already exited
#[cfg(unix)]
fn terminate_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) {}

/// Wait until the process group is empty. Returns false if members are still
/// alive at `deadline`.
#[cfg(unix)]
async fn wait_for_group(pid: Option<u32>, deadline: Instant) -> bool {
    let Some(pid) = pid else {
        return true;
    };
    loop {
        if !signal_group(pid, 0) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(not(unix))]
async fn wait_for_group(_pid: Option<u32>, _deadline: Instant) -> bool {
    true
}

/// SIGKILL anything still left in the backend's process group
#[cfg(unix)]
fn kill_leftovers(pid: Option<u32>) {
    if let Some(pid) = pid {
        if signal_group(pid, 0) {
            warn!(pid, "Killing leftover processes in backend process group");
            signal_group(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_leftovers(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn settings() -> SharedSettings {
        Arc::new(RwLock::new(RuntimeSettings {
            idle_timeout_secs: 60,
            poll_interval_secs: 1,
            startup_timeout_secs: 10,
            auto_start_enabled: true,
            target_name: "test-backend".to_string(),
        }))
    }

    fn local(command: &str) -> LocalProcess {
        LocalProcess::new(TargetConfig::local(command, 3000), settings())
    }

    #[test]
    fn test_command_line_splits_shell_words() {
        let target = local("python main.py --listen '0.0.0.0' --port 8188");
        let (program, args) = target.command_line().unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, vec!["main.py", "--listen", "0.0.0.0", "--port", "8188"]);
    }

    #[test]
    fn test_command_line_uses_explicit_args() {
        let target = LocalProcess::new(
            TargetConfig::local("/usr/bin/env", 3000).with_args(vec!["node".to_string()]),
            settings(),
        );
        let (program, args) = target.command_line().unwrap();
        assert_eq!(program, "/usr/bin/env");
        assert_eq!(args, vec!["node"]);
    }

    #[test]
    fn test_command_line_rejects_unbalanced_quotes() {
        let target = local("python 'main.py");
        assert!(matches!(target.command_line(), Err(TargetError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let target = local("/nonexistent/idlegate-test-binary");
        let err = target.start().await.unwrap_err();
        assert!(matches!(err, TargetError::Spawn(_)));
        assert!(!target.is_alive().await);
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let target = local("sleep 30");
        target.start().await.unwrap();
        assert!(target.is_alive().await);

        let info = target.inspect().await.unwrap();
        assert_eq!(info.kind, TargetKind::Local);
        assert_eq!(info.name, "test-backend");
        assert!(info.id.is_some());
        assert!(info.alive);

        let report = target.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!report.forced);
        assert!(!target.is_alive().await);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let target = LocalProcess::new(
            TargetConfig::local("sh", 3000).with_args(vec![
                "-c".to_string(),
                "trap '' TERM; sleep 30".to_string(),
            ]),
            settings(),
        );
        target.start().await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = target.stop(Duration::from_millis(300)).await.unwrap();
        assert!(report.forced);
        assert!(!target.is_alive().await);
    }

    /// `sh -c` script whose worker subprocess handles SIGTERM with `on_term`
    fn with_worker(on_term: &str) -> LocalProcess {
        let script = format!(
            "(trap '{}' TERM; while true; do sleep 0.1; done) & wait",
            on_term
        );
        LocalProcess::new(
            TargetConfig::local("sh", 3000).with_args(vec!["-c".to_string(), script]),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_stop_gives_workers_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("worker-done");
        let target = with_worker(&format!("sleep 0.5; echo done > {}; exit 0", marker.display()));
        target.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid = target.inspect().await.unwrap().id.unwrap().parse::<u32>().unwrap();

        let report = target.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!report.forced);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "done");
        assert!(!signal_group(pid, 0));
    }

    #[tokio::test]
    async fn test_stop_kills_workers_that_ignore_sigterm() {
        let target = with_worker("");
        target.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid = target.inspect().await.unwrap().id.unwrap().parse::<u32>().unwrap();

        let started = Instant::now();
        let report = target.stop(Duration::from_millis(500)).await.unwrap();
        assert!(report.forced);
        assert!(started.elapsed() >= Duration::from_millis(450));

        let deadline = Instant::now() + Duration::from_secs(2);
        while signal_group(pid, 0) {
            assert!(Instant::now() < deadline, "worker survived SIGKILL");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_output_is_kept_for_logs() {
        let target = LocalProcess::new(
            TargetConfig::local("sh", 3000).with_args(vec![
                "-c".to_string(),
                "echo one; echo two; echo three".to_string(),
            ]),
            settings(),
        );
        target.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while target.logs(MAX_LOG_TAIL).await.unwrap().len() < 3 {
            assert!(Instant::now() < deadline, "output never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let lines = target.logs(2).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" two"));
        assert!(lines[1].ends_with(" three"));
    }

    #[test]
    fn test_output_buffer_is_bounded() {
        let buffer = OutputBuffer::default();
        for i in 0..MAX_LOG_TAIL + 5 {
            buffer.push(format!("line {}", i));
        }
        let all = buffer.tail(usize::MAX);
        assert_eq!(all.len(), MAX_LOG_TAIL);
        assert_eq!(all[0], "line 5");
        assert!(buffer.tail(0).is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let target = local("sleep 30");
        let report = target.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report, StopReport::default());

        target.start().await.unwrap();
        target.stop(Duration::from_secs(5)).await.unwrap();
        let report = target.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_exited_process_is_not_alive() {
        let target = local("true");
        target.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while target.is_alive().await {
            assert!(tokio::time::Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let info = target.inspect().await.unwrap();
        assert!(!info.alive);
    }

    #[tokio::test]
    async fn test_port_is_exported() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("port");
        let target = LocalProcess::new(
            TargetConfig::local("sh", 4321).with_args(vec![
                "-c".to_string(),
                format!("echo $PORT > {}", out.display()),
            ]),
            settings(),
        );
        target.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while target.is_alive().await {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "4321");
    }
}
