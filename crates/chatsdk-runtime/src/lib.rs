//! Tokio runtime for one chat session.
//!
//! [`spawn_runtime`] starts an actor that owns the connection state machine.
//! Transport callbacks, reachability changes, lifecycle calls and timer
//! expiries all arrive on one input queue and are applied in order. The
//! actor stops, closing the transport, once every [`SessionHandle`] is gone
//! or [`SessionHandle::shutdown`] is called.

use std::{sync::Arc, time::Duration};

use chatsdk_core::{
    AppState, Connection, ConnectionStateMachine, EventStream, Reachability, SessionChannelError,
    SessionChannels, SessionContext, SessionEffect, SessionError, SessionInput, SessionPresenter,
    TransportEvent, User,
};
use chatsdk_platform::{
    BackgroundExecution, ReachabilityMonitor, ReachabilitySink, StreamTransport,
    TransportEventSink,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub mod background;
pub mod config;
pub mod heartbeat;
pub mod submit;

pub use background::BackgroundGracePolicy;
pub use config::{ConfigError, SessionConfig};
pub use heartbeat::HeartbeatScheduler;
pub use submit::{GuardedSubmitter, RequestSubmitter};

/// Host implementations the runtime drives.
#[derive(Clone)]
pub struct SessionPlatform {
    pub transport: Arc<dyn StreamTransport>,
    pub reachability: Arc<dyn ReachabilityMonitor>,
    pub background: Arc<dyn BackgroundExecution>,
}

/// Cheap, cloneable entry point into a running session.
///
/// Dropping the last clone shuts the session down.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
    shutdown: CancellationToken,
    _stop_on_drop: Arc<DropGuard>,
}

impl SessionHandle {
    /// Arm the session and connect as soon as network and foreground allow.
    ///
    /// This is also the only way out of `Connection::Disconnected`.
    pub fn connect(&self) -> Result<(), SessionChannelError> {
        self.channels.submit(SessionInput::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SessionChannelError> {
        self.channels.submit(SessionInput::Disconnect)
    }

    pub fn enter_background(&self) -> Result<(), SessionChannelError> {
        self.channels
            .submit(SessionInput::Lifecycle(AppState::Background))
    }

    pub fn enter_foreground(&self) -> Result<(), SessionChannelError> {
        self.channels
            .submit(SessionInput::Lifecycle(AppState::Foreground))
    }

    /// Snapshot of the current connection state.
    pub fn connection(&self) -> Connection {
        self.channels.connection()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<Connection> {
        self.channels.subscribe_connection()
    }

    pub fn subscribe_user(&self) -> watch::Receiver<Option<User>> {
        self.channels.subscribe_user()
    }

    pub fn subscribe_events(&self) -> EventStream {
        self.channels.subscribe_events()
    }

    /// New paginated list gated on this session's connection.
    pub fn presenter<T>(&self) -> SessionPresenter<T> {
        SessionPresenter::new(self.channels.subscribe_connection())
    }

    /// Wrap `inner` so it only submits while this session is connected.
    pub fn guard<S: RequestSubmitter>(&self, inner: S) -> GuardedSubmitter<S> {
        GuardedSubmitter::new(inner, self.channels.subscribe_connection())
    }

    /// Stop the runtime: close the transport, cancel every timer and stop
    /// observing reachability. Other clones of this handle stop working too.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Spawn the session actor on the current tokio runtime.
pub fn spawn_runtime(
    config: &SessionConfig,
    platform: SessionPlatform,
    context: SessionContext,
) -> SessionHandle {
    let (channels, input_rx) = SessionChannels::new(config.event_buffer);
    channels.publish_user(context.current_user().cloned());

    // observe before taking the snapshot so no change slips between the two
    platform
        .reachability
        .start_observing(reachability_sink(&channels));
    let _ = channels.submit(SessionInput::Reachability(
        platform.reachability.current(),
    ));

    let shutdown = CancellationToken::new();
    let runtime = SessionRuntime::new(config, platform, context, channels.clone(), input_rx);
    let stop = shutdown.child_token();
    tokio::spawn(async move {
        runtime.run(stop).await;
    });

    SessionHandle {
        channels,
        _stop_on_drop: Arc::new(shutdown.clone().drop_guard()),
        shutdown,
    }
}

struct ReconnectTimer {
    attempt_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionRuntime {
    channels: SessionChannels,
    input_rx: mpsc::UnboundedReceiver<SessionInput>,
    machine: ConnectionStateMachine,
    platform: SessionPlatform,
    heartbeat: HeartbeatScheduler,
    grace: BackgroundGracePolicy,
    reconnect: Option<ReconnectTimer>,
}

impl SessionRuntime {
    fn new(
        config: &SessionConfig,
        platform: SessionPlatform,
        context: SessionContext,
        channels: SessionChannels,
        input_rx: mpsc::UnboundedReceiver<SessionInput>,
    ) -> Self {
        Self {
            machine: ConnectionStateMachine::new(context, config.machine_settings()),
            heartbeat: HeartbeatScheduler::new(config.heartbeat_interval),
            grace: BackgroundGracePolicy::new(
                config.background_grace,
                Arc::clone(&platform.background),
            ),
            platform,
            channels,
            input_rx,
            reconnect: None,
        }
    }

    async fn run(mut self, stop: CancellationToken) {
        info!("session runtime started");
        loop {
            let input = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                input = self.input_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            for effect in self.machine.handle(input) {
                self.apply(effect);
            }
        }
        self.stop();
    }

    /// Tear the session down the same way a deliberate disconnect does.
    fn stop(&mut self) {
        for effect in self.machine.handle(SessionInput::Disconnect) {
            self.apply(effect);
        }
        self.cancel_reconnect();
        self.heartbeat.suspend();
        self.platform.reachability.stop_observing();
        info!("session runtime stopped");
    }

    fn apply(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::ConnectionChanged(connection) => {
                info!(state = connection.label(), "connection changed");
                self.channels.publish_connection(connection);
            }
            SessionEffect::OpenTransport { stream_id } => {
                let sink = transport_sink(&self.channels, stream_id);
                if let Err(err) = self.platform.transport.connect(sink) {
                    warn!(stream_id, error = %err, "transport connect failed");
                    let _ = self.channels.submit(SessionInput::Transport {
                        stream_id,
                        event: TransportEvent::Disconnected {
                            error: Some(SessionError::transport(err.to_string())),
                        },
                    });
                }
            }
            SessionEffect::CloseTransport => self.platform.transport.disconnect(),
            SessionEffect::ResumeHeartbeat => self
                .heartbeat
                .resume(Arc::clone(&self.platform.transport)),
            SessionEffect::SuspendHeartbeat => self.heartbeat.suspend(),
            SessionEffect::BeginBackgroundGrant { grant_id } => {
                self.grace.begin(grant_id, self.channels.input_sender())
            }
            SessionEffect::EndBackgroundGrant { grant_id } => self.grace.end(grant_id),
            SessionEffect::StartReachabilityObservation => {
                debug!("resuming reachability observation");
                self.platform
                    .reachability
                    .start_observing(reachability_sink(&self.channels));
                let _ = self.channels.submit(SessionInput::Reachability(
                    self.platform.reachability.current(),
                ));
            }
            SessionEffect::StopReachabilityObservation => {
                debug!("stopping reachability observation");
                self.platform.reachability.stop_observing();
            }
            SessionEffect::ScheduleReconnect { attempt_id, delay } => {
                self.schedule_reconnect(attempt_id, delay)
            }
            SessionEffect::CancelReconnect => self.cancel_reconnect(),
            SessionEffect::Deliver(event) => self.channels.emit(event),
            SessionEffect::UserUpdated(user) => self.channels.publish_user(Some(user)),
        }
    }

    fn schedule_reconnect(&mut self, attempt_id: u64, delay: Duration) {
        self.cancel_reconnect();

        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();
        let input_tx = self.channels.input_sender();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = cancel_child.cancelled() => {}
                () = time::sleep(delay) => {
                    let _ = input_tx.send(SessionInput::ReconnectDue { attempt_id });
                }
            }
        });
        self.reconnect = Some(ReconnectTimer {
            attempt_id,
            cancel,
            task,
        });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            debug!(attempt_id = timer.attempt_id, "cancelling reconnect timer");
            timer.cancel.cancel();
            timer.task.abort();
        }
    }
}

fn transport_sink(channels: &SessionChannels, stream_id: u64) -> TransportEventSink {
    let input_tx = channels.input_sender();
    Arc::new(move |event: TransportEvent| {
        let _ = input_tx.send(SessionInput::Transport { stream_id, event });
    })
}

fn reachability_sink(channels: &SessionChannels) -> ReachabilitySink {
    let input_tx = channels.input_sender();
    Arc::new(move |reachability: Reachability| {
        let _ = input_tx.send(SessionInput::Reachability(reachability));
    })
}
