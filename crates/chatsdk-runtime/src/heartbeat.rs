//! Fixed-period keep-alive while the session is connected.

use std::{sync::Arc, time::Duration};

use chatsdk_platform::StreamTransport;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

struct RunningHeartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Sends a ping every `period` while resumed.
///
/// `resume` and `suspend` are idempotent. A suspended scheduler holds no task
/// and no timer.
pub struct HeartbeatScheduler {
    period: Duration,
    running: Option<RunningHeartbeat>,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn resume(&mut self, transport: Arc<dyn StreamTransport>) {
        if self.running.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop_child.cancelled() => break,
                    _ = ticks.tick() => {
                        match transport.send_ping() {
                            Ok(()) => trace!("heartbeat ping sent"),
                            Err(err) => warn!(error = %err, "heartbeat ping failed"),
                        }
                    }
                }
            }
        });

        debug!(period_secs = self.period.as_secs(), "heartbeat resumed");
        self.running = Some(RunningHeartbeat { stop, task });
    }

    pub fn suspend(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
            running.task.abort();
            debug!("heartbeat suspended");
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.suspend();
    }
}
