//! Background idle monitor, one per running period

use crate::activity::ActivityKind;
use crate::lifecycle::{LifecycleController, LifecycleState};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

enum Tick {
    Continue,
    Done,
}

/// Spawn the monitor. It exits when `cancel` fires (or its sender is dropped),
/// when the backend leaves Running, or after it has stopped the backend.
pub fn spawn_monitor(
    controller: Arc<LifecycleController>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Idle monitor started");

        loop {
            // Settings are re-read every tick so updates apply immediately
            let poll_interval = controller.settings().poll_interval();

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.changed() => break,
            }

            if *cancel.borrow() {
                break;
            }

            if let Tick::Done = tick(&controller).await {
                break;
            }
        }

        debug!("Idle monitor exited");
    })
}

async fn tick(controller: &LifecycleController) -> Tick {
    if controller.state() != LifecycleState::Running {
        return Tick::Done;
    }

    if let Some(queue) = controller.queue_probe() {
        if let Some(status) = queue.queue().await {
            if status.is_busy() {
                controller.record_activity();
                controller.activity().record(
                    ActivityKind::Activity,
                    format!(
                        "Queue active: {} running, {} pending",
                        status.running, status.pending
                    ),
                );
                return Tick::Continue;
            }
        }
    }

    let in_flight = controller.in_flight();
    if in_flight > 0 {
        debug!(in_flight, "Requests in flight, not idle");
        return Tick::Continue;
    }

    let idle = controller.idle_duration();
    let timeout = controller.settings().idle_timeout();
    if idle < timeout {
        debug!(
            idle_secs = idle.as_secs(),
            remaining_secs = (timeout - idle).as_secs(),
            "Backend active"
        );
        return Tick::Continue;
    }

    match controller.stop_if_idle().await {
        Ok(Some(_)) => Tick::Done,
        Ok(None) => Tick::Continue,
        Err(e) => {
            error!(error = %e, "Idle stop failed");
            Tick::Done
        }
    }
}
