//! Frame fingerprinting, duplicate suppression and event decoding.
//!
//! The transport may hand the same frame over more than once. [`MessageParser`]
//! remembers the fingerprint of the last successfully decoded frame and answers
//! a repeat with the cached [`Event`] instead of decoding it again.

use std::time::SystemTime;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Event, ServerError, User};

/// SHA-256 of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(payload: &str) -> Self {
        let digest = Sha256::digest(payload.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

/// One raw payload delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub fingerprint: Fingerprint,
    pub received_at: SystemTime,
}

impl Frame {
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            fingerprint: Fingerprint::of(&payload),
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// Why a frame could not be decoded into an [`Event`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not a JSON object with a string `type` field.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Known event type whose payload does not match its schema.
    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Decoding seam between raw payloads and typed events.
pub trait FrameDecoder {
    /// Decode the distinguished error envelope, `None` when the payload is not one.
    fn decode_error(&self, payload: &str) -> Option<ServerError>;

    /// Decode a domain event.
    fn decode_event(&self, payload: &str) -> Result<Event, DecodeError>;
}

/// JSON wire format used by the chat service.
///
/// Events are objects tagged by a string `type`; errors arrive as
/// `{"error": {"code": .., "message": .., "StatusCode": ..}}` without a `type`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameDecoder;

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ServerError,
}

#[derive(Deserialize)]
struct HealthCheckPayload {
    connection_id: String,
    #[serde(default)]
    me: Option<User>,
}

#[derive(Deserialize)]
struct MutesUpdatedPayload {
    me: User,
}

impl FrameDecoder for JsonFrameDecoder {
    fn decode_error(&self, payload: &str) -> Option<ServerError> {
        let value: Value = serde_json::from_str(payload).ok()?;
        if value.get("type").is_some() {
            return None;
        }
        serde_json::from_value::<ErrorEnvelope>(value)
            .ok()
            .map(|envelope| envelope.error)
    }

    fn decode_event(&self, payload: &str) -> Result<Event, DecodeError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::Malformed("missing string 'type' field".to_owned()))?
            .to_owned();

        match kind.as_str() {
            "health.check" => {
                let body = HealthCheckPayload::deserialize(&value)
                    .map_err(|err| invalid_payload(&kind, err))?;
                Ok(Event::HealthCheck {
                    connection_id: body.connection_id,
                    me: body.me,
                })
            }
            "notification.mutes_updated" => {
                let body = MutesUpdatedPayload::deserialize(&value)
                    .map_err(|err| invalid_payload(&kind, err))?;
                Ok(Event::NotificationMutesUpdated { me: body.me })
            }
            _ => Ok(Event::Other {
                kind,
                payload: value,
            }),
        }
    }
}

fn invalid_payload(kind: &str, err: serde_json::Error) -> DecodeError {
    DecodeError::InvalidPayload {
        kind: kind.to_owned(),
        reason: err.to_string(),
    }
}

/// Result of feeding one frame to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Newly decoded event.
    Event(Event),
    /// Same payload as the previous frame; cached event, decoder not invoked.
    Duplicate(Event),
    /// Server error envelope, recorded as the last JSON error.
    ServerError(ServerError),
    /// Neither an envelope nor a decodable event.
    Undecodable(DecodeError),
}

/// Deduplicating frame parser. One instance per session, owned by the state machine.
#[derive(Debug, Default)]
pub struct MessageParser<D = JsonFrameDecoder> {
    decoder: D,
    last: Option<(Fingerprint, Event)>,
    last_json_error: Option<ServerError>,
    consecutive_decode_failures: u32,
}

impl<D: FrameDecoder> MessageParser<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            last: None,
            last_json_error: None,
            consecutive_decode_failures: 0,
        }
    }

    /// Decode a frame, returning the event when there is one.
    pub fn parse_message(&mut self, frame: &Frame) -> Option<Event> {
        match self.parse_frame(frame) {
            ParseOutcome::Event(event) | ParseOutcome::Duplicate(event) => Some(event),
            ParseOutcome::ServerError(_) | ParseOutcome::Undecodable(_) => None,
        }
    }

    pub fn parse_frame(&mut self, frame: &Frame) -> ParseOutcome {
        if let Some((fingerprint, event)) = &self.last
            && *fingerprint == frame.fingerprint
        {
            return ParseOutcome::Duplicate(event.clone());
        }

        if let Some(error) = self.decoder.decode_error(&frame.payload) {
            self.last = None;
            self.last_json_error = Some(error.clone());
            return ParseOutcome::ServerError(error);
        }

        match self.decoder.decode_event(&frame.payload) {
            Ok(event) => {
                self.last = Some((frame.fingerprint, event.clone()));
                self.consecutive_decode_failures = 0;
                ParseOutcome::Event(event)
            }
            Err(err) => {
                self.last = None;
                self.consecutive_decode_failures = self.consecutive_decode_failures.saturating_add(1);
                ParseOutcome::Undecodable(err)
            }
        }
    }

    pub fn last_json_error(&self) -> Option<&ServerError> {
        self.last_json_error.as_ref()
    }

    pub fn take_last_json_error(&mut self) -> Option<ServerError> {
        self.last_json_error.take()
    }

    pub fn consecutive_decode_failures(&self) -> u32 {
        self.consecutive_decode_failures
    }

    /// Forget everything learned from the previous connection.
    pub fn reset(&mut self) {
        self.last = None;
        self.last_json_error = None;
        self.consecutive_decode_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[derive(Clone, Default)]
    struct CountingDecoder {
        event_calls: Rc<Cell<u32>>,
    }

    impl FrameDecoder for CountingDecoder {
        fn decode_error(&self, payload: &str) -> Option<ServerError> {
            JsonFrameDecoder.decode_error(payload)
        }

        fn decode_event(&self, payload: &str) -> Result<Event, DecodeError> {
            self.event_calls.set(self.event_calls.get() + 1);
            JsonFrameDecoder.decode_event(payload)
        }
    }

    const HEALTH: &str =
        r#"{"type":"health.check","connection_id":"conn-1","me":{"id":"alice"}}"#;

    #[test]
    fn duplicate_frames_reuse_cached_event_without_decoding() {
        let decoder = CountingDecoder::default();
        let calls = Rc::clone(&decoder.event_calls);
        let mut parser = MessageParser::new(decoder);

        let first = parser.parse_message(&Frame::new(HEALTH)).expect("first decode");
        for _ in 0..4 {
            let again = parser.parse_frame(&Frame::new(HEALTH));
            assert_eq!(again, ParseOutcome::Duplicate(first.clone()));
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn decodes_health_check_and_mutes_update() {
        let mut parser = MessageParser::new(JsonFrameDecoder);
        match parser.parse_message(&Frame::new(HEALTH)) {
            Some(Event::HealthCheck { connection_id, me }) => {
                assert_eq!(connection_id, "conn-1");
                assert_eq!(me.map(|user| user.id).as_deref(), Some("alice"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let mutes = r#"{"type":"notification.mutes_updated","me":{"id":"alice","mutes":[{"target_id":"bob"}]}}"#;
        match parser.parse_message(&Frame::new(mutes)) {
            Some(Event::NotificationMutesUpdated { me }) => assert_eq!(me.mutes[0].target_id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_kept_opaque() {
        let mut parser = MessageParser::new(JsonFrameDecoder);
        let event = parser
            .parse_message(&Frame::new(r#"{"type":"message.new","cid":"messaging:1"}"#))
            .expect("domain event");
        assert_eq!(event.kind(), "message.new");
    }

    #[test]
    fn error_envelope_is_recorded_and_clears_cache() {
        let decoder = CountingDecoder::default();
        let calls = Rc::clone(&decoder.event_calls);
        let mut parser = MessageParser::new(decoder);
        parser.parse_message(&Frame::new(HEALTH));

        let envelope = r#"{"error":{"code":40,"message":"token expired","StatusCode":401}}"#;
        assert_eq!(parser.parse_message(&Frame::new(envelope)), None);
        assert_eq!(parser.last_json_error().map(|err| err.code), Some(40));

        // cache was cleared, so the same health check is decoded again
        parser.parse_message(&Frame::new(HEALTH));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn undecodable_frame_keeps_last_json_error_and_counts_failures() {
        let mut parser = MessageParser::new(JsonFrameDecoder);
        parser.parse_message(&Frame::new(r#"{"error":{"code":5,"message":"boom"}}"#));

        assert!(matches!(
            parser.parse_frame(&Frame::new("not json")),
            ParseOutcome::Undecodable(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            parser.parse_frame(&Frame::new(r#"{"type":"health.check"}"#)),
            ParseOutcome::Undecodable(DecodeError::InvalidPayload { .. })
        ));
        assert_eq!(parser.consecutive_decode_failures(), 2);
        assert_eq!(parser.last_json_error().map(|err| err.code), Some(5));

        parser.parse_message(&Frame::new(HEALTH));
        assert_eq!(parser.consecutive_decode_failures(), 0);
    }

    #[test]
    fn object_with_type_and_error_fields_is_an_event() {
        let mut parser = MessageParser::new(JsonFrameDecoder);
        let outcome = parser.parse_frame(&Frame::new(
            r#"{"type":"message.new","error":{"code":1,"message":"x"}}"#,
        ));
        assert!(matches!(outcome, ParseOutcome::Event(_)));
        assert!(parser.last_json_error().is_none());
    }
}
