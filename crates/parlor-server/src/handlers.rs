//! Handlers for the inbound actions. Each one runs on the calling session's
//! inbound loop; slow side effects are detached.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use parlor_core::commands::CommandInput;
use parlor_core::errors::BrokerError;
use parlor_core::Broker;
use parlor_core::events::{Action, ChatMessage, Event, JoinRoomPayload, SendMessagePayload};

use crate::error::HubError;
use crate::hub::Hub;
use crate::session::Session;

/// Stamp a chat message, persist it in the background and broadcast it to the
/// sender's room.
pub(crate) fn send_message(hub: &Hub, event: &Event, session: &Session) -> Result<(), HubError> {
    let room = session.room().ok_or(HubError::NoRoom)?;
    if !hub.is_valid_room(room) {
        return Err(HubError::InvalidRoom(room));
    }

    let payload: SendMessagePayload = event.payload_as(Action::SendMessage)?;
    let user = session.user();
    let message = ChatMessage {
        message: payload.message,
        from: user.username.clone(),
        sent: Utc::now(),
    };

    let store = hub.store();
    let user_id = user.id;
    let content = message.message.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.create_message(user_id, room, &content) {
            tracing::warn!(user_id = %user_id, room_id = %room, error = %e, "failed to persist message");
        }
    });

    let out = Event::new(Action::MessageReceived, &message)?;
    hub.broadcast(room, Arc::new(out));
    Ok(())
}

pub(crate) fn join_room(hub: &Hub, event: &Event, session: &Session) -> Result<(), HubError> {
    let payload: JoinRoomPayload = event.payload_as(Action::JoinRoom)?;
    if !hub.is_valid_room(payload.room_id) {
        return Err(HubError::InvalidRoom(payload.room_id));
    }
    session.set_room(payload.room_id);
    tracing::info!(
        session_id = %session.id(),
        user_id = %session.user().id,
        room_id = %payload.room_id,
        "joined room"
    );
    Ok(())
}

/// Forward the command payload to the workers exactly as the client sent it.
pub(crate) fn chatbot_command(
    hub: &Hub,
    event: &Event,
    session: &Session,
) -> Result<(), HubError> {
    let input: CommandInput = event.payload_as(Action::ChatbotCommand)?;
    let raw = Bytes::copy_from_slice(event.raw_payload().as_bytes());

    let broker = hub.broker();
    let timeout = hub.publish_timeout();
    let session_id = session.id().clone();
    tokio::spawn(async move {
        match publish_within(broker.as_ref(), raw, timeout).await {
            Ok(()) => tracing::debug!(
                session_id = %session_id,
                room_id = %input.room_id,
                command = %input.command_name,
                "command published"
            ),
            Err(e) => tracing::warn!(
                session_id = %session_id,
                room_id = %input.room_id,
                error = %e,
                error_kind = e.error_kind(),
                "failed to publish command"
            ),
        }
    });
    Ok(())
}

/// Publish `raw`, giving up with [`BrokerError::Timeout`] after `timeout`.
async fn publish_within(
    broker: &dyn Broker,
    raw: Bytes,
    timeout: Duration,
) -> Result<(), BrokerError> {
    tokio::time::timeout(timeout, broker.publish(raw))
        .await
        .unwrap_or(Err(BrokerError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use futures::StreamExt;
    use parlor_core::ids::{RoomId, UserId};
    use parlor_core::MemoryBroker;
    use tokio_util::sync::CancellationToken;

    use crate::hub::tests::{fixture, frame, join};

    #[tokio::test]
    async fn send_message_reaches_room_with_server_stamp() {
        let f = fixture(&[7, 8]);
        let (a, mut rx_a) = join(&f.hub, "alice", Some(7), 8);
        let (_b, mut rx_b) = join(&f.hub, "bob", Some(7), 8);
        let (_c, mut rx_c) = join(&f.hub, "carol", Some(8), 8);

        let before = Utc::now();
        let raw = frame(
            "sendMessage",
            r#"{"message":"hi","from":"mallory","sent":"2001-01-01T00:00:00Z"}"#,
        );
        assert!(f.hub.handle_frame(&a, &raw));

        let got_a = rx_a.try_recv().unwrap();
        let got_b = rx_b.try_recv().unwrap();
        assert!(rx_c.try_recv().is_err());
        assert_eq!(got_a.action, "messageReceived");
        assert_eq!(got_a.raw_payload(), got_b.raw_payload());

        let msg: ChatMessage = got_a.payload_as(Action::MessageReceived).unwrap();
        assert_eq!(msg.message, "hi");
        assert_eq!(msg.from, "alice");
        assert!(msg.sent >= before);
    }

    #[tokio::test]
    async fn send_message_is_persisted() {
        let f = fixture(&[7]);
        let (a, _rx) = join(&f.hub, "alice", Some(7), 8);
        assert!(f.hub.handle_frame(&a, &frame("sendMessage", r#"{"message":"keep"}"#)));

        for _ in 0..50 {
            if !f.store.messages.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = f.store.messages.lock().clone();
        assert_eq!(messages, vec![(UserId(1), RoomId(7), "keep".to_string())]);
    }

    #[tokio::test]
    async fn persistence_failure_still_broadcasts() {
        let f = fixture(&[7]);
        let (a, mut rx) = join(&f.hub, "alice", Some(7), 8);
        assert!(f.hub.is_valid_room(RoomId(7)));
        f.store.fail.store(true, Ordering::SeqCst);

        assert!(f.hub.handle_frame(&a, &frame("sendMessage", r#"{"message":"hi"}"#)));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_message_without_room_is_fatal() {
        let f = fixture(&[7]);
        let (a, mut rx) = join(&f.hub, "alice", None, 8);
        let event = Event::decode(&frame("sendMessage", r#"{"message":"hi"}"#)).unwrap();

        let err = send_message(&f.hub, &event, &a).unwrap_err();
        assert!(matches!(err, HubError::NoRoom));
        assert!(err.is_fatal());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_to_vanished_room_is_fatal() {
        let f = fixture(&[7]);
        let (a, mut rx) = join(&f.hub, "alice", Some(9), 8);
        let event = Event::decode(&frame("sendMessage", r#"{"message":"hi"}"#)).unwrap();

        let err = send_message(&f.hub, &event, &a).unwrap_err();
        assert!(matches!(err, HubError::InvalidRoom(RoomId(9))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn join_room_sets_room_without_broadcast() {
        let f = fixture(&[3]);
        let (a, mut rx_a) = join(&f.hub, "alice", None, 8);
        let (_b, mut rx_b) = join(&f.hub, "bob", Some(3), 8);

        let event = Event::decode(&frame("joinRoom", r#"{"roomID":3}"#)).unwrap();
        join_room(&f.hub, &event, &a).unwrap();

        assert_eq!(a.room(), Some(RoomId(3)));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn join_unknown_room_leaves_room_unchanged() {
        let f = fixture(&[3]);
        let (a, _rx) = join(&f.hub, "alice", Some(3), 8);

        let event = Event::decode(&frame("joinRoom", r#"{"roomID":404}"#)).unwrap();
        let err = join_room(&f.hub, &event, &a).unwrap_err();

        assert!(matches!(err, HubError::InvalidRoom(RoomId(404))));
        assert_eq!(a.room(), Some(RoomId(3)));
    }

    #[tokio::test]
    async fn chatbot_command_forwards_raw_payload() {
        let f = fixture(&[1]);
        let (a, mut rx) = join(&f.hub, "alice", Some(1), 8);
        let payload = r#"{"roomID":1,"from":"alice","commandName":"stock","command":"amzn.us"}"#;

        assert!(f.hub.handle_frame(&a, &frame("chatbotCommand", payload)));

        let cancel = CancellationToken::new();
        let got = tokio::time::timeout(Duration::from_secs(1), f.workers.consume(cancel).next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], payload.as_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chatbot_command_with_bad_schema_publishes_nothing() {
        let f = fixture(&[1]);
        let (a, _rx) = join(&f.hub, "alice", Some(1), 8);

        assert!(f.hub.handle_frame(&a, &frame("chatbotCommand", r#"{"command":"amzn.us"}"#)));

        let cancel = CancellationToken::new();
        let got =
            tokio::time::timeout(Duration::from_millis(100), f.workers.consume(cancel).next()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn stalled_publish_times_out() {
        // Nobody consumes the worker side, so the second publish waits for room.
        let (hub_side, _workers) = MemoryBroker::pair(1);
        publish_within(&hub_side, Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .unwrap();

        let err = publish_within(&hub_side, Bytes::from_static(b"2"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout));
        assert_eq!(err.error_kind(), "timeout");
    }
}
