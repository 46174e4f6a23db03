//! Grace window between leaving foreground and tearing the session down.

use std::{sync::Arc, time::Duration};

use chatsdk_core::SessionInput;
use chatsdk_platform::{BackgroundExecution, BackgroundTaskToken};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKGROUND_TASK_NAME: &str = "chatsdk-session";

struct BackgroundGrant {
    grant_id: u64,
    deadline: time::Instant,
    cancel: CancellationToken,
    timer: JoinHandle<()>,
    token: Option<BackgroundTaskToken>,
}

/// Owns at most one outstanding background grant.
///
/// When the deadline fires, the timer reports `BackgroundDeadlineExpired` back
/// through the session input queue; the state machine decides what to tear down.
pub struct BackgroundGracePolicy {
    grace: Duration,
    executor: Arc<dyn BackgroundExecution>,
    grant: Option<BackgroundGrant>,
}

impl BackgroundGracePolicy {
    pub fn new(grace: Duration, executor: Arc<dyn BackgroundExecution>) -> Self {
        Self {
            grace,
            executor,
            grant: None,
        }
    }

    pub fn has_grant(&self) -> bool {
        self.grant.is_some()
    }

    pub fn deadline(&self) -> Option<time::Instant> {
        self.grant.as_ref().map(|grant| grant.deadline)
    }

    /// Start the grace timer and request OS extended execution.
    ///
    /// No-op while another grant is outstanding.
    pub fn begin(&mut self, grant_id: u64, input_tx: mpsc::UnboundedSender<SessionInput>) {
        if let Some(existing) = &self.grant {
            debug!(
                outstanding = existing.grant_id,
                requested = grant_id,
                "background grant already outstanding"
            );
            return;
        }

        let token = match self.executor.begin_background_task(BACKGROUND_TASK_NAME) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(error = %err, "extended execution unavailable; relying on grace timer");
                None
            }
        };

        let deadline = time::Instant::now() + self.grace;
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = cancel_child.cancelled() => {}
                () = time::sleep_until(deadline) => {
                    let _ = input_tx.send(SessionInput::BackgroundDeadlineExpired { grant_id });
                }
            }
        });

        info!(
            grant_id,
            grace_secs = self.grace.as_secs(),
            "background grace window started"
        );
        self.grant = Some(BackgroundGrant {
            grant_id,
            deadline,
            cancel,
            timer,
            token,
        });
    }

    /// Cancel the timer and release the OS grant for `grant_id`.
    pub fn end(&mut self, grant_id: u64) {
        match &self.grant {
            Some(grant) if grant.grant_id == grant_id => {}
            _ => {
                debug!(grant_id, "no matching background grant to end");
                return;
            }
        }
        self.release();
    }

    fn release(&mut self) {
        let Some(grant) = self.grant.take() else {
            return;
        };
        grant.cancel.cancel();
        grant.timer.abort();
        if let Some(token) = grant.token {
            self.executor.end_background_task(token);
        }
        debug!(grant_id = grant.grant_id, "background grant released");
    }
}

impl Drop for BackgroundGracePolicy {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use chatsdk_platform::InMemoryBackgroundExecution;

    use super::*;

    fn policy(executor: &InMemoryBackgroundExecution) -> BackgroundGracePolicy {
        BackgroundGracePolicy::new(Duration::from_secs(300), Arc::new(executor.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_expiry_through_input_queue() {
        let executor = InMemoryBackgroundExecution::default();
        let mut grace = policy(&executor);
        let (tx, mut rx) = mpsc::unbounded_channel();

        grace.begin(7, tx);
        assert_eq!(executor.active_tasks(), 1);

        time::sleep(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            rx.try_recv(),
            Ok(SessionInput::BackgroundDeadlineExpired { grant_id: 7 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_begin_is_a_no_op() {
        let executor = InMemoryBackgroundExecution::default();
        let mut grace = policy(&executor);
        let (tx, _rx) = mpsc::unbounded_channel();

        grace.begin(1, tx.clone());
        let deadline = grace.deadline();
        time::sleep(Duration::from_secs(10)).await;
        grace.begin(2, tx);

        assert_eq!(executor.active_tasks(), 1);
        assert_eq!(grace.deadline(), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn end_cancels_timer_and_releases_token() {
        let executor = InMemoryBackgroundExecution::default();
        let mut grace = policy(&executor);
        let (tx, mut rx) = mpsc::unbounded_channel();

        grace.begin(3, tx);
        grace.end(2);
        assert!(grace.has_grant());

        grace.end(3);
        assert!(!grace.has_grant());
        assert_eq!(executor.active_tasks(), 0);

        time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_still_runs_without_os_support() {
        let executor = InMemoryBackgroundExecution::unsupported();
        let mut grace = policy(&executor);
        let (tx, mut rx) = mpsc::unbounded_channel();

        grace.begin(0, tx);
        time::sleep(Duration::from_secs(301)).await;
        assert!(rx.try_recv().is_ok());
    }
}
