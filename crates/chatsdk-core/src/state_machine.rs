use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    parser::{Frame, FrameDecoder, JsonFrameDecoder, MessageParser, ParseOutcome},
    retry::{ReconnectPolicy, RetryState},
    session::SessionContext,
    types::{AppState, Connection, Event, Reachability, TransportEvent, User},
};

const DEFAULT_DECODE_FAILURE_WARN_THRESHOLD: u32 = 5;

/// Every signal the state machine reacts to. All of them arrive through one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Explicit connect call; also the only way out of `Disconnected`.
    Connect,
    /// Explicit, deliberate disconnect.
    Disconnect,
    Lifecycle(AppState),
    Reachability(Reachability),
    /// Callback from the transport opened by `OpenTransport { stream_id }`.
    Transport {
        stream_id: u64,
        event: TransportEvent,
    },
    /// Background grace window ran out.
    BackgroundDeadlineExpired { grant_id: u64 },
    /// Backoff delay for a scheduled reconnect elapsed.
    ReconnectDue { attempt_id: u64 },
}

/// Side effects requested by a transition, executed in order by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    ConnectionChanged(Connection),
    /// Open a fresh transport; tag its callbacks with `stream_id`.
    OpenTransport { stream_id: u64 },
    CloseTransport,
    ResumeHeartbeat,
    SuspendHeartbeat,
    BeginBackgroundGrant { grant_id: u64 },
    EndBackgroundGrant { grant_id: u64 },
    StartReachabilityObservation,
    StopReachabilityObservation,
    ScheduleReconnect { attempt_id: u64, delay: Duration },
    CancelReconnect,
    /// Freshly decoded event for application observers.
    Deliver(Event),
    /// Cached session identity changed.
    UserUpdated(User),
}

/// Tunables for [`ConnectionStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub reconnect: ReconnectPolicy,
    /// Warn each time this many decode failures have happened in a row.
    pub decode_failure_warn_threshold: u32,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            decode_failure_warn_threshold: DEFAULT_DECODE_FAILURE_WARN_THRESHOLD,
        }
    }
}

/// Single owner of the authoritative [`Connection`] value.
///
/// Transitions are synchronous: [`handle`](Self::handle) consumes one input and
/// returns the effects to run. Timers and I/O live in the runtime.
#[derive(Debug)]
pub struct ConnectionStateMachine<D = JsonFrameDecoder> {
    connection: Connection,
    retry: RetryState,
    context: SessionContext,
    parser: MessageParser<D>,
    settings: MachineSettings,
    app_state: AppState,
    internet_available: bool,
    wants_connection: bool,
    handshake_done: bool,
    heartbeat_running: bool,
    reachability_observed: bool,
    active_grant: Option<u64>,
    next_grant_id: u64,
    pending_reconnect: Option<u64>,
    next_attempt_id: u64,
    stream_id: u64,
}

impl ConnectionStateMachine<JsonFrameDecoder> {
    pub fn new(context: SessionContext, settings: MachineSettings) -> Self {
        Self::with_decoder(context, settings, JsonFrameDecoder)
    }
}

impl<D: FrameDecoder> ConnectionStateMachine<D> {
    pub fn with_decoder(context: SessionContext, settings: MachineSettings, decoder: D) -> Self {
        Self {
            connection: Connection::NotConnected,
            retry: RetryState::default(),
            context,
            parser: MessageParser::new(decoder),
            settings,
            app_state: AppState::Foreground,
            internet_available: false,
            wants_connection: false,
            handshake_done: false,
            heartbeat_running: false,
            reachability_observed: true,
            active_grant: None,
            next_grant_id: 0,
            pending_reconnect: None,
            next_attempt_id: 0,
            stream_id: 0,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn parser(&self) -> &MessageParser<D> {
        &self.parser
    }

    pub fn has_background_grant(&self) -> bool {
        self.active_grant.is_some()
    }

    /// Id of the most recently opened transport. Callbacks tagged with any
    /// other id are ignored.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        match input {
            SessionInput::Connect => self.on_connect_requested(&mut effects),
            SessionInput::Disconnect => self.on_disconnect_requested(&mut effects),
            SessionInput::Lifecycle(AppState::Foreground) => self.on_foreground(&mut effects),
            SessionInput::Lifecycle(AppState::Background) => self.on_background(&mut effects),
            SessionInput::Reachability(reachability) => {
                self.on_reachability(reachability, &mut effects)
            }
            SessionInput::Transport { stream_id, event } if stream_id != self.stream_id => {
                debug!(
                    stream_id,
                    current = self.stream_id,
                    kind = event.label(),
                    "ignoring callback from a replaced transport"
                );
            }
            SessionInput::Transport { event, .. } => match event {
                TransportEvent::Connected => self.on_transport_connected(),
                TransportEvent::Disconnected { error } => {
                    self.on_transport_disconnected(error, &mut effects)
                }
                TransportEvent::Frame(frame) => self.on_frame(&frame, &mut effects),
            },
            SessionInput::BackgroundDeadlineExpired { grant_id } => {
                self.on_grant_expired(grant_id, &mut effects)
            }
            SessionInput::ReconnectDue { attempt_id } => {
                self.on_reconnect_due(attempt_id, &mut effects)
            }
        }
        effects
    }

    fn on_connect_requested(&mut self, effects: &mut Vec<SessionEffect>) {
        self.wants_connection = true;
        match self.connection {
            Connection::Connected { .. } | Connection::Connecting => {}
            Connection::NotConnected | Connection::Disconnected { .. } => {
                self.retry.clear();
                if self.can_connect() {
                    self.begin_connecting(effects);
                } else if matches!(self.connection, Connection::Disconnected { .. }) {
                    self.set_connection(Connection::NotConnected, effects);
                }
            }
        }
    }

    fn on_disconnect_requested(&mut self, effects: &mut Vec<SessionEffect>) {
        self.wants_connection = false;
        match self.connection {
            Connection::Connected { .. } | Connection::Connecting => {
                self.tear_down(effects);
                self.retry.clear();
                self.set_connection(Connection::NotConnected, effects);
            }
            Connection::Disconnected { .. } => {
                self.release_grant(effects);
                self.set_connection(Connection::NotConnected, effects);
            }
            Connection::NotConnected => self.release_grant(effects),
        }
    }

    fn on_foreground(&mut self, effects: &mut Vec<SessionEffect>) {
        self.app_state = AppState::Foreground;
        self.release_grant(effects);

        if !self.reachability_observed {
            // the fresh snapshot that follows decides whether to connect
            self.reachability_observed = true;
            self.internet_available = false;
            effects.push(SessionEffect::StartReachabilityObservation);
            return;
        }

        if matches!(self.connection, Connection::NotConnected) && self.can_connect() {
            self.begin_connecting(effects);
        }
    }

    fn on_background(&mut self, effects: &mut Vec<SessionEffect>) {
        self.app_state = AppState::Background;
        if self.connection.is_connected() {
            self.acquire_grant(effects);
        }
    }

    fn on_reachability(&mut self, reachability: Reachability, effects: &mut Vec<SessionEffect>) {
        self.internet_available = reachability == Reachability::Available;
        match reachability {
            Reachability::Available => {
                if matches!(self.connection, Connection::NotConnected) && self.can_connect() {
                    self.begin_connecting(effects);
                }
            }
            Reachability::Unavailable => {
                if self.connection.is_connected_or_connecting() {
                    info!("network unavailable; dropping stream connection");
                    self.tear_down(effects);
                    self.set_connection(Connection::NotConnected, effects);
                }
            }
        }
    }

    fn on_transport_connected(&mut self) {
        if matches!(self.connection, Connection::Connecting) {
            debug!("transport handshake complete; waiting for health check");
            self.handshake_done = true;
        } else {
            debug!(
                state = self.connection.label(),
                "ignoring transport connect outside connecting state"
            );
        }
    }

    fn on_transport_disconnected(
        &mut self,
        error: Option<SessionError>,
        effects: &mut Vec<SessionEffect>,
    ) {
        if !self.connection.is_connected_or_connecting() {
            debug!(
                state = self.connection.label(),
                "ignoring transport disconnect"
            );
            return;
        }

        let envelope = self.parser.take_last_json_error();
        self.suspend_heartbeat(effects);
        self.release_grant(effects);
        self.cancel_reconnect(effects);
        self.context.clear_connection_id();
        self.handshake_done = false;

        let Some(transport_error) = error else {
            debug!("transport closed cleanly");
            self.retry.reset_failures();
            self.set_connection(Connection::NotConnected, effects);
            return;
        };

        let cause = envelope.map(SessionError::from).unwrap_or(transport_error);
        if cause.is_retryable() {
            let retry_after = cause.retry_after_ms;
            let failures = self.retry.record_failure(cause);
            let delay = self
                .settings
                .reconnect
                .delay_after_failures(failures, retry_after);
            let attempt_id = self.next_attempt_id;
            self.next_attempt_id += 1;
            self.pending_reconnect = Some(attempt_id);
            info!(
                failures,
                delay_ms = delay.as_millis() as u64,
                "retryable disconnect; scheduling reconnect"
            );
            self.set_connection(Connection::Connecting, effects);
            effects.push(SessionEffect::ScheduleReconnect { attempt_id, delay });
        } else {
            warn!(code = %cause.code, "session stopped by non-retryable error");
            self.wants_connection = false;
            self.retry.reset_failures();
            self.set_connection(Connection::Disconnected { error: cause }, effects);
        }
    }

    fn on_frame(&mut self, frame: &Frame, effects: &mut Vec<SessionEffect>) {
        if !self.connection.is_connected_or_connecting() {
            debug!(
                state = self.connection.label(),
                "dropping frame received while offline"
            );
            return;
        }

        match self.parser.parse_frame(frame) {
            ParseOutcome::Event(event) => {
                self.retry.reset_failures();
                self.apply_event(&event, effects);
                effects.push(SessionEffect::Deliver(event));
            }
            ParseOutcome::Duplicate(event) => {
                self.retry.reset_failures();
                self.apply_event(&event, effects);
            }
            ParseOutcome::ServerError(error) => {
                warn!(
                    code = error.code,
                    status = ?error.status_code,
                    message = %error.message,
                    "server sent error envelope"
                );
            }
            ParseOutcome::Undecodable(error) => {
                let failures = self.parser.consecutive_decode_failures();
                let threshold = self.settings.decode_failure_warn_threshold.max(1);
                if failures % threshold == 0 {
                    warn!(failures, error = %error, "repeated undecodable frames");
                } else {
                    debug!(error = %error, "ignoring undecodable frame");
                }
            }
        }
    }

    fn apply_event(&mut self, event: &Event, effects: &mut Vec<SessionEffect>) {
        match event {
            Event::HealthCheck { connection_id, me } => {
                if !matches!(self.connection, Connection::Connecting) || connection_id.is_empty() {
                    return;
                }
                if !self.handshake_done {
                    debug!("health check before transport handshake; still connecting");
                    return;
                }
                let Some(user) = me.clone() else {
                    debug!("health check without identity; still connecting");
                    return;
                };
                if self.pending_reconnect.is_some() {
                    return;
                }
                self.establish(connection_id.clone(), user, effects);
            }
            Event::NotificationMutesUpdated { me } => {
                if self.context.refresh_user(me) {
                    debug!(mutes = me.mutes.len(), "mute list updated for current user");
                    effects.push(SessionEffect::UserUpdated(me.clone()));
                }
            }
            Event::Other { .. } => {}
        }
    }

    fn establish(&mut self, connection_id: String, user: User, effects: &mut Vec<SessionEffect>) {
        info!(connection_id = %connection_id, user_id = %user.id, "session connected");
        self.retry.reset_failures();
        self.context.bind(connection_id.clone(), user.clone());
        self.set_connection(
            Connection::Connected {
                connection_id,
                user: user.clone(),
            },
            effects,
        );
        effects.push(SessionEffect::UserUpdated(user));
        self.heartbeat_running = true;
        effects.push(SessionEffect::ResumeHeartbeat);
        if self.app_state == AppState::Background {
            self.acquire_grant(effects);
        }
    }

    fn on_grant_expired(&mut self, grant_id: u64, effects: &mut Vec<SessionEffect>) {
        if self.active_grant != Some(grant_id) {
            debug!(grant_id, "ignoring stale background deadline");
            return;
        }

        info!(grant_id, "background grace window elapsed; forcing disconnect");
        self.release_grant(effects);
        if self.connection.is_connected_or_connecting() {
            self.tear_down(effects);
            self.set_connection(Connection::NotConnected, effects);
        }
        self.reachability_observed = false;
        effects.push(SessionEffect::StopReachabilityObservation);
    }

    fn on_reconnect_due(&mut self, attempt_id: u64, effects: &mut Vec<SessionEffect>) {
        if self.pending_reconnect != Some(attempt_id)
            || !matches!(self.connection, Connection::Connecting)
        {
            debug!(attempt_id, "ignoring stale reconnect timer");
            return;
        }
        self.pending_reconnect = None;

        if self.internet_available {
            debug!(attempt_id, "reconnecting");
            self.open_transport(effects);
        } else {
            self.set_connection(Connection::NotConnected, effects);
        }
    }

    fn can_connect(&self) -> bool {
        self.wants_connection && self.internet_available && self.app_state == AppState::Foreground
    }

    fn begin_connecting(&mut self, effects: &mut Vec<SessionEffect>) {
        self.set_connection(Connection::Connecting, effects);
        self.open_transport(effects);
    }

    fn open_transport(&mut self, effects: &mut Vec<SessionEffect>) {
        self.parser.reset();
        self.handshake_done = false;
        self.stream_id += 1;
        effects.push(SessionEffect::OpenTransport {
            stream_id: self.stream_id,
        });
    }

    /// Stop timers before the connection id is cleared, then close the socket.
    fn tear_down(&mut self, effects: &mut Vec<SessionEffect>) {
        self.suspend_heartbeat(effects);
        self.release_grant(effects);
        self.cancel_reconnect(effects);
        self.context.clear_connection_id();
        self.handshake_done = false;
        effects.push(SessionEffect::CloseTransport);
    }

    fn suspend_heartbeat(&mut self, effects: &mut Vec<SessionEffect>) {
        if self.heartbeat_running {
            self.heartbeat_running = false;
            effects.push(SessionEffect::SuspendHeartbeat);
        }
    }

    fn cancel_reconnect(&mut self, effects: &mut Vec<SessionEffect>) {
        if self.pending_reconnect.take().is_some() {
            effects.push(SessionEffect::CancelReconnect);
        }
    }

    fn acquire_grant(&mut self, effects: &mut Vec<SessionEffect>) {
        if self.active_grant.is_some() {
            return;
        }
        let grant_id = self.next_grant_id;
        self.next_grant_id += 1;
        self.active_grant = Some(grant_id);
        effects.push(SessionEffect::BeginBackgroundGrant { grant_id });
    }

    fn release_grant(&mut self, effects: &mut Vec<SessionEffect>) {
        if let Some(grant_id) = self.active_grant.take() {
            effects.push(SessionEffect::EndBackgroundGrant { grant_id });
        }
    }

    fn set_connection(&mut self, next: Connection, effects: &mut Vec<SessionEffect>) {
        debug!(
            from = self.connection.label(),
            to = next.label(),
            "connection transition"
        );
        self.connection = next.clone();
        effects.push(SessionEffect::ConnectionChanged(next));
    }
}
