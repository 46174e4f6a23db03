use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    state_machine::SessionInput,
    types::{Connection, Event, User},
};

/// Broadcast event stream type used by application observers.
pub type EventStream = broadcast::Receiver<Event>;

/// Errors returned by session channel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionChannelError {
    /// The runtime dropped its input receiver.
    #[error("session input channel is closed")]
    InputChannelClosed,
}

/// Input queue and observer channels shared by a session runtime and its handles.
///
/// Every signal goes through the single input queue, so the state machine sees
/// them in arrival order. Connection and user state replay the latest value to
/// new subscribers.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    input_tx: mpsc::UnboundedSender<SessionInput>,
    connection_tx: watch::Sender<Connection>,
    user_tx: watch::Sender<Option<User>>,
    event_tx: broadcast::Sender<Event>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the input receiver.
    pub fn new(event_buffer: usize) -> (Self, mpsc::UnboundedReceiver<SessionInput>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (connection_tx, _) = watch::channel(Connection::NotConnected);
        let (user_tx, _) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                input_tx,
                connection_tx,
                user_tx,
                event_tx,
            },
            input_rx,
        )
    }

    /// Clone the input sender, for timers and platform callbacks.
    pub fn input_sender(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.input_tx.clone()
    }

    /// Queue one input for the state machine.
    pub fn submit(&self, input: SessionInput) -> Result<(), SessionChannelError> {
        self.input_tx
            .send(input)
            .map_err(|_| SessionChannelError::InputChannelClosed)
    }

    /// Latest published connection state.
    pub fn connection(&self) -> Connection {
        self.connection_tx.borrow().clone()
    }

    pub fn publish_connection(&self, connection: Connection) {
        self.connection_tx.send_replace(connection);
    }

    pub fn publish_user(&self, user: Option<User>) {
        self.user_tx.send_replace(user);
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<Connection> {
        self.connection_tx.subscribe()
    }

    pub fn subscribe_user(&self) -> watch::Receiver<Option<User>> {
        self.user_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> EventStream {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::AppState;

    #[tokio::test]
    async fn inputs_arrive_in_submission_order() {
        let (channels, mut rx) = SessionChannels::new(8);
        channels.submit(SessionInput::Connect).expect("submit connect");
        channels
            .submit(SessionInput::Lifecycle(AppState::Background))
            .expect("submit lifecycle");

        assert_eq!(rx.recv().await, Some(SessionInput::Connect));
        assert_eq!(
            rx.recv().await,
            Some(SessionInput::Lifecycle(AppState::Background))
        );
    }

    #[test]
    fn submit_fails_once_runtime_is_gone() {
        let (channels, rx) = SessionChannels::new(8);
        drop(rx);
        assert_eq!(
            channels.submit(SessionInput::Connect),
            Err(SessionChannelError::InputChannelClosed)
        );
    }

    #[test]
    fn late_subscriber_sees_latest_connection() {
        let (channels, _rx) = SessionChannels::new(8);
        channels.publish_connection(Connection::Connecting);
        channels.publish_connection(Connection::Connected {
            connection_id: "conn-1".into(),
            user: User::new("alice"),
        });

        let rx = channels.subscribe_connection();
        assert_eq!(rx.borrow().connection_id(), Some("conn-1"));
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _rx) = SessionChannels::new(16);
        let mut a = channels.subscribe_events();
        let mut b = channels.subscribe_events();

        channels.emit(Event::Other {
            kind: "message.new".into(),
            payload: json!({ "id": "m1" }),
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }
}
