//! Host collaborator contracts for the chat session runtime.
//!
//! The runtime never talks to sockets, OS network monitors or OS background
//! task APIs directly. Hosts implement these traits; the in-memory versions
//! below back tests and the smoke app.

use std::{
    collections::HashSet,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use chatsdk_core::{Reachability, TransportEvent};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform capability unavailable: {0}")]
    Unavailable(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("platform backend failure: {0}")]
    Backend(String),
}

/// Callback the transport uses to report connects, disconnects and frames.
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Callback a reachability monitor uses to report changes.
pub type ReachabilitySink = Arc<dyn Fn(Reachability) + Send + Sync>;

/// Persistent bidirectional stream to the chat service.
///
/// `connect` and `disconnect` return immediately; the outcome arrives through
/// the sink handed to `connect`.
pub trait StreamTransport: Send + Sync {
    fn connect(&self, sink: TransportEventSink) -> Result<(), PlatformError>;

    fn disconnect(&self);

    /// Send one no-payload keep-alive.
    fn send_ping(&self) -> Result<(), PlatformError>;

    fn is_connected(&self) -> bool;
}

/// Network reachability source with an immediate snapshot.
pub trait ReachabilityMonitor: Send + Sync {
    fn current(&self) -> Reachability;

    fn start_observing(&self, sink: ReachabilitySink);

    fn stop_observing(&self);
}

/// Opaque handle for one OS extended-execution grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackgroundTaskToken(Uuid);

impl BackgroundTaskToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackgroundTaskToken {
    fn default() -> Self {
        Self::new()
    }
}

/// OS facility that keeps the process alive briefly after it leaves foreground.
pub trait BackgroundExecution: Send + Sync {
    fn begin_background_task(&self, name: &str) -> Result<BackgroundTaskToken, PlatformError>;

    fn end_background_task(&self, token: BackgroundTaskToken);
}

/// One sink per `connect` call, oldest first.
#[derive(Default)]
struct TransportState {
    sinks: Vec<TransportEventSink>,
}

/// Transport double that records calls and lets the caller script events.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<RwLock<TransportState>>,
    connected: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Deliver `event` to the sink registered by the last `connect`.
    pub fn emit(&self, event: TransportEvent) -> Result<(), PlatformError> {
        let latest = self.connect_calls().checked_sub(1).ok_or(PlatformError::NotConnected)?;
        self.emit_on(latest, event)
    }

    /// Deliver `event` to the sink of the `connection`-th `connect` call,
    /// counting from zero. Older sinks stand for sockets that were replaced
    /// but still report late callbacks.
    pub fn emit_on(&self, connection: usize, event: TransportEvent) -> Result<(), PlatformError> {
        let (sink, latest) = {
            let state = self
                .state
                .read()
                .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))?;
            let sink = state
                .sinks
                .get(connection)
                .cloned()
                .ok_or(PlatformError::NotConnected)?;
            (sink, connection + 1 == state.sinks.len())
        };

        if latest {
            match &event {
                TransportEvent::Connected => self.connected.store(true, Ordering::SeqCst),
                TransportEvent::Disconnected { .. } => {
                    self.connected.store(false, Ordering::SeqCst)
                }
                TransportEvent::Frame(_) => {}
            }
        }
        sink(event);
        Ok(())
    }

    /// Shorthand for emitting one raw frame.
    pub fn emit_frame(&self, payload: impl Into<String>) -> Result<(), PlatformError> {
        self.emit(TransportEvent::Frame(chatsdk_core::Frame::new(payload)))
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn pings_sent(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

impl StreamTransport for ScriptedTransport {
    fn connect(&self, sink: TransportEventSink) -> Result<(), PlatformError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))?;
        state.sinks.push(sink);
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!("scripted transport connect");
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn send_ping(&self) -> Result<(), PlatformError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PlatformError::NotConnected);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct ReachabilityState {
    current: Reachability,
    sink: Option<ReachabilitySink>,
}

/// Reachability double whose value is set by hand.
#[derive(Clone)]
pub struct ManualReachability {
    state: Arc<RwLock<ReachabilityState>>,
}

impl ManualReachability {
    pub fn new(initial: Reachability) -> Self {
        Self {
            state: Arc::new(RwLock::new(ReachabilityState {
                current: initial,
                sink: None,
            })),
        }
    }

    /// Change reachability, notifying the observer when one is registered.
    pub fn set(&self, reachability: Reachability) {
        let sink = {
            let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
            state.current = reachability;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink(reachability);
        }
    }

    pub fn is_observing(&self) -> bool {
        self.state
            .read()
            .map(|state| state.sink.is_some())
            .unwrap_or(false)
    }
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new(Reachability::Available)
    }
}

impl ReachabilityMonitor for ManualReachability {
    fn current(&self) -> Reachability {
        self.state
            .read()
            .map(|state| state.current)
            .unwrap_or(Reachability::Unavailable)
    }

    fn start_observing(&self, sink: ReachabilitySink) {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        state.sink = Some(sink);
    }

    fn stop_observing(&self) {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        state.sink = None;
    }
}

/// Background execution that only tracks outstanding tokens.
#[derive(Clone, Default)]
pub struct InMemoryBackgroundExecution {
    active: Arc<RwLock<HashSet<BackgroundTaskToken>>>,
    unsupported: bool,
}

impl InMemoryBackgroundExecution {
    /// A host without extended-execution support; every request fails.
    pub fn unsupported() -> Self {
        Self {
            active: Arc::default(),
            unsupported: true,
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.read().map(|active| active.len()).unwrap_or(0)
    }
}

impl BackgroundExecution for InMemoryBackgroundExecution {
    fn begin_background_task(&self, name: &str) -> Result<BackgroundTaskToken, PlatformError> {
        if self.unsupported {
            return Err(PlatformError::Unavailable(format!(
                "extended execution for '{name}'"
            )));
        }
        let token = BackgroundTaskToken::new();
        self.active
            .write()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))?
            .insert(token);
        Ok(token)
    }

    fn end_background_task(&self, token: BackgroundTaskToken) {
        let mut active = self.active.write().unwrap_or_else(|err| err.into_inner());
        active.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chatsdk_core::SessionError;

    use super::*;

    #[test]
    fn scripted_transport_forwards_events_to_sink() {
        let transport = ScriptedTransport::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        transport
            .connect(Arc::new(move |event: TransportEvent| {
                sink_seen.lock().expect("sink lock").push(event)
            }))
            .expect("connect should work");

        transport.emit(TransportEvent::Connected).expect("emit connected");
        transport.emit_frame("{}").expect("emit frame");
        assert!(transport.is_connected());
        assert_eq!(seen.lock().expect("seen lock").len(), 2);

        transport
            .emit(TransportEvent::Disconnected {
                error: Some(SessionError::transport("reset")),
            })
            .expect("emit disconnect");
        assert!(!transport.is_connected());
        assert_eq!(transport.connect_calls(), 1);
    }

    #[test]
    fn replaced_sinks_still_receive_late_events() {
        let transport = ScriptedTransport::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for connection in 0..2usize {
            let sink_seen = Arc::clone(&seen);
            transport
                .connect(Arc::new(move |event: TransportEvent| {
                    sink_seen
                        .lock()
                        .expect("sink lock")
                        .push((connection, event))
                }))
                .expect("connect should work");
        }

        transport.emit(TransportEvent::Connected).expect("emit connected");
        transport
            .emit_on(0, TransportEvent::Disconnected { error: None })
            .expect("emit on replaced sink");

        // a late close on the old socket leaves the new one open
        assert!(transport.is_connected());
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![
                (1, TransportEvent::Connected),
                (0, TransportEvent::Disconnected { error: None }),
            ]
        );
        assert_eq!(
            transport.emit_on(2, TransportEvent::Connected),
            Err(PlatformError::NotConnected)
        );
    }

    #[test]
    fn emit_without_connect_fails() {
        let transport = ScriptedTransport::default();
        assert_eq!(
            transport.emit(TransportEvent::Connected),
            Err(PlatformError::NotConnected)
        );
    }

    #[test]
    fn ping_requires_open_stream() {
        let transport = ScriptedTransport::default();
        assert_eq!(transport.send_ping(), Err(PlatformError::NotConnected));

        transport
            .connect(Arc::new(|_: TransportEvent| {}))
            .expect("connect");
        transport.emit(TransportEvent::Connected).expect("emit");
        transport.send_ping().expect("ping should work");
        assert_eq!(transport.pings_sent(), 1);
    }

    #[test]
    fn reachability_notifies_only_while_observed() {
        let monitor = ManualReachability::new(Reachability::Unavailable);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        monitor.start_observing(Arc::new(move |reachability: Reachability| {
            sink_seen.lock().expect("sink lock").push(reachability)
        }));

        monitor.set(Reachability::Available);
        monitor.stop_observing();
        monitor.set(Reachability::Unavailable);

        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![Reachability::Available]
        );
        assert_eq!(monitor.current(), Reachability::Unavailable);
        assert!(!monitor.is_observing());
    }

    #[test]
    fn background_tokens_are_tracked_until_ended() {
        let executor = InMemoryBackgroundExecution::default();
        let token = executor
            .begin_background_task("chat-session")
            .expect("begin should work");
        assert_eq!(executor.active_tasks(), 1);
        executor.end_background_task(token);
        assert_eq!(executor.active_tasks(), 0);
    }

    #[test]
    fn unsupported_host_refuses_background_tasks() {
        let executor = InMemoryBackgroundExecution::unsupported();
        assert!(matches!(
            executor.begin_background_task("chat-session"),
            Err(PlatformError::Unavailable(_))
        ));
    }
}
