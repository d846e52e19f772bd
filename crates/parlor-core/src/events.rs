//! Wire envelope exchanged with chat clients.
//!
//! Every frame is `{"action": "<name>", "payload": {...}}`. The payload is kept
//! as raw JSON until the action has been resolved, so frames carrying an
//! unknown action are never decoded past the envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::errors::DecodeError;
use crate::ids::RoomId;

/// Actions understood by the hub. Inbound actions are dispatched to handlers;
/// `MessageReceived` is only ever produced by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    SendMessage,
    MessageReceived,
    JoinRoom,
    ChatbotCommand,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::SendMessage,
        Action::MessageReceived,
        Action::JoinRoom,
        Action::ChatbotCommand,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "sendMessage",
            Self::MessageReceived => "messageReceived",
            Self::JoinRoom => "joinRoom",
            Self::ChatbotCommand => "chatbotCommand",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a frame names an action the server does not know.
#[derive(Debug, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// The `{action, payload}` unit exchanged with clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub action: String,
    pub payload: Box<RawValue>,
}

impl Event {
    /// Build an event from a typed payload.
    pub fn new<T: Serialize>(action: Action, payload: &T) -> Result<Self, DecodeError> {
        let payload = serde_json::value::to_raw_value(payload).map_err(DecodeError::Encode)?;
        Ok(Self {
            action: action.as_str().to_string(),
            payload,
        })
    }

    /// Decode one raw frame. Only the envelope is validated here.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(frame).map_err(DecodeError::Envelope)
    }

    pub fn encode(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(DecodeError::Encode)
    }

    /// Decode the payload into the shape registered for `action`.
    pub fn payload_as<T: DeserializeOwned>(&self, action: Action) -> Result<T, DecodeError> {
        serde_json::from_str(self.payload.get()).map_err(|source| DecodeError::Payload {
            action: action.as_str(),
            source,
        })
    }

    /// The payload exactly as the client sent it.
    pub fn raw_payload(&self) -> &str {
        self.payload.get()
    }
}

/// Chat message as fanned out to a room (`messageReceived`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub from: String,
    pub sent: DateTime<Utc>,
}

/// Inbound `sendMessage` payload. Any client-supplied `from`/`sent` is ignored;
/// the hub stamps both.
#[derive(Clone, Debug, Deserialize)]
pub struct SendMessagePayload {
    pub message: String,
}

/// Inbound `joinRoom` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_match_wire_protocol() {
        assert_eq!(Action::SendMessage.as_str(), "sendMessage");
        assert_eq!(Action::MessageReceived.as_str(), "messageReceived");
        assert_eq!(Action::JoinRoom.as_str(), "joinRoom");
        assert_eq!(Action::ChatbotCommand.as_str(), "chatbotCommand");
    }

    #[test]
    fn action_parse() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
        assert_eq!(
            "dance".parse::<Action>(),
            Err(UnknownAction("dance".into()))
        );
    }

    #[test]
    fn decode_keeps_payload_raw() {
        let frame = br#"{"action":"joinRoom","payload":{"roomID": 3}}"#;
        let event = Event::decode(frame).unwrap();
        assert_eq!(event.action, "joinRoom");
        assert_eq!(event.raw_payload(), r#"{"roomID": 3}"#);

        let join: JoinRoomPayload = event.payload_as(Action::JoinRoom).unwrap();
        assert_eq!(join.room_id, RoomId(3));
    }

    #[test]
    fn decode_rejects_malformed_envelope() {
        assert!(matches!(
            Event::decode(b"not json"),
            Err(DecodeError::Envelope(_))
        ));
        assert!(matches!(
            Event::decode(br#"{"payload":{}}"#),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn unknown_action_decodes_as_envelope() {
        // The payload is garbage for any handler but the envelope is fine.
        let event = Event::decode(br#"{"action":"dance","payload":[1,2]}"#).unwrap();
        assert_eq!(event.action, "dance");
    }

    #[test]
    fn payload_decode_failure_is_reported_per_action() {
        let event = Event::decode(br#"{"action":"joinRoom","payload":{"roomID":"x"}}"#).unwrap();
        let err = event.payload_as::<JoinRoomPayload>(Action::JoinRoom).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { action: "joinRoom", .. }));
    }

    #[test]
    fn chat_message_wire_shape() {
        let sent = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = ChatMessage {
            message: "hello world!".into(),
            from: "user".into(),
            sent,
        };
        let event = Event::new(Action::MessageReceived, &msg).unwrap();
        assert_eq!(
            event.encode().unwrap(),
            r#"{"action":"messageReceived","payload":{"message":"hello world!","from":"user","sent":"2020-01-01T00:00:00Z"}}"#
        );
    }

    #[test]
    fn send_message_payload_ignores_client_timestamp() {
        let event = Event::decode(
            br#"{"action":"sendMessage","payload":{"message":"hi","from":"mallory","sent":"1999-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let payload: SendMessagePayload = event.payload_as(Action::SendMessage).unwrap();
        assert_eq!(payload.message, "hi");
    }
}
