//! Core session contract for the chat client SDK.
//!
//! This crate holds the connection state machine, frame deduplication and
//! decoding, reconnect backoff, and the connection-gated pagination presenter.
//! Nothing here performs I/O; the runtime crate drives it.

/// Input queue and observer channels.
pub mod channel;
/// Session error taxonomy and HTTP classification helpers.
pub mod error;
/// Frame fingerprinting, duplicate suppression and event decoding.
pub mod parser;
/// Connection-gated pagination.
pub mod presenter;
/// Reconnect backoff policy and failure bookkeeping.
pub mod retry;
/// Per-session identity context.
pub mod session;
/// Connection state machine.
pub mod state_machine;
/// Connection, user and event types.
pub mod types;

pub use channel::{EventStream, SessionChannelError, SessionChannels};
pub use error::{ErrorCategory, SessionError, classify_http_status};
pub use parser::{
    DecodeError, Fingerprint, Frame, FrameDecoder, JsonFrameDecoder, MessageParser, ParseOutcome,
};
pub use presenter::{Cursor, PageRequest, Pagination, RequestStream, SessionPresenter};
pub use retry::{ReconnectPolicy, RetryState};
pub use session::SessionContext;
pub use state_machine::{ConnectionStateMachine, MachineSettings, SessionEffect, SessionInput};
pub use types::{
    AppState, Connection, Event, Mute, Reachability, ServerError, TransportEvent, User,
};
