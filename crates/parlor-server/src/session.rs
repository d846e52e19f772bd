use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use parlor_core::events::Event;
use parlor_core::ids::{RoomId, SessionId};
use parlor_core::AuthenticatedUser;

use crate::hub::Hub;

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-connection settings derived from the server config.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Read deadline T. Pings go out every 0.9 T.
    pub liveness_timeout: Duration,
    pub outbound_queue: usize,
}

impl SessionConfig {
    pub fn ping_period(&self) -> Duration {
        self.liveness_timeout.mul_f64(0.9)
    }
}

/// Outcome of offering an event to a session's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue full; the event was discarded for this session only.
    Dropped,
    Closed,
}

/// One live connection as seen by the hub.
pub struct Session {
    id: SessionId,
    user: AuthenticatedUser,
    /// Current room, 0 while the session has not joined one.
    room: AtomicI64,
    outbound: mpsc::Sender<Arc<Event>>,
    state: AtomicU8,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl Session {
    pub fn new(user: AuthenticatedUser, queue: usize) -> (Arc<Self>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let session = Arc::new(Self {
            id: SessionId::new(),
            user,
            room: AtomicI64::new(0),
            outbound: tx,
            state: AtomicU8::new(SessionState::Connecting as u8),
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn user(&self) -> &AuthenticatedUser {
        &self.user
    }

    pub fn room(&self) -> Option<RoomId> {
        match self.room.load(Ordering::Acquire) {
            0 => None,
            id => Some(RoomId(id)),
        }
    }

    pub fn set_room(&self, room: RoomId) {
        self.room.store(room.get(), Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `Closing` unless the session is already past it.
    pub(crate) fn begin_closing(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Active as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Non-blocking offer to the outbound queue.
    pub fn enqueue(&self, event: Arc<Event>) -> Enqueue {
        match self.outbound.try_send(event) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Enqueue::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Events discarded because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once every queued event has been taken by the outbound loop.
    pub fn is_drained(&self) -> bool {
        self.outbound.capacity() == self.outbound.max_capacity()
    }

    /// Ask both loops to stop and the socket to close.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

/// Run one upgraded connection until either loop gives up.
pub async fn serve(
    mut socket: WebSocket,
    user: AuthenticatedUser,
    hub: Arc<Hub>,
    config: SessionConfig,
) {
    let (session, rx) = Session::new(user, config.outbound_queue);

    if !hub.register(Arc::clone(&session)).await {
        tracing::info!(session_id = %session.id(), "registration refused, closing");
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(outbound_loop(
        sink,
        rx,
        Arc::clone(&session),
        Arc::clone(&hub),
        config.ping_period(),
    ));

    inbound_loop(stream, Arc::clone(&session), Arc::clone(&hub), config.liveness_timeout).await;
    let _ = writer.await;
}

async fn inbound_loop(
    mut stream: SplitStream<WebSocket>,
    session: Arc<Session>,
    hub: Arc<Hub>,
    liveness: Duration,
) {
    let mut deadline = Instant::now() + liveness;

    loop {
        let frame = tokio::select! {
            biased;
            () = session.closed_token().cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                Err(_) => {
                    tracing::info!(session_id = %session.id(), "liveness deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(session_id = %session.id(), error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            },
        };

        let keep_going = match frame {
            WsMessage::Text(text) => hub.handle_frame(&session, text.as_str().as_bytes()),
            WsMessage::Binary(data) => hub.handle_frame(&session, &data),
            WsMessage::Pong(_) => {
                deadline = Instant::now() + liveness;
                tracing::trace!(session_id = %session.id(), "pong");
                true
            }
            WsMessage::Ping(_) => true, // axum answers pings itself
            WsMessage::Close(_) => false,
        };
        if !keep_going {
            break;
        }
    }

    session.begin_closing();
    hub.deregister(&session).await;
}

async fn outbound_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<Event>>,
    session: Arc<Session>,
    hub: Arc<Hub>,
    ping_period: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping_interval = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            biased;
            () = session.closed_token().cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            msg = rx.recv() => {
                let Some(event) = msg else { break };
                match event.encode() {
                    Ok(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            hub.metrics().counter_inc("session.write_failed", &[], 1);
                            tracing::warn!(session_id = %session.id(), error = %e, "write failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session.id(), error = %e, "failed to encode event");
                    }
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "ping failed");
                    break;
                }
                tracing::trace!(session_id = %session.id(), "sent ping");
            }
        }
    }

    session.begin_closing();
    hub.deregister(&session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use parlor_core::events::{Action, ChatMessage};

    use crate::hub::tests::fixture;

    /// Records every frame and fails the first `failing_writes` text frames.
    struct ScriptedSink {
        sent: Arc<parking_lot::Mutex<Vec<WsMessage>>>,
        failing_writes: usize,
    }

    impl Sink<WsMessage> for ScriptedSink {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
            if matches!(item, WsMessage::Text(_)) && self.failing_writes > 0 {
                self.failing_writes -= 1;
                return Err(std::io::Error::other("broken pipe"));
            }
            self.sent.lock().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn user() -> AuthenticatedUser {
        AuthenticatedUser::new(1, "alice")
    }

    fn event(text: &str) -> Arc<Event> {
        let msg = ChatMessage {
            message: text.into(),
            from: "alice".into(),
            sent: chrono::Utc::now(),
        };
        Arc::new(Event::new(Action::MessageReceived, &msg).unwrap())
    }

    #[test]
    fn new_session_has_no_room() {
        let (session, _rx) = Session::new(user(), 4);
        assert_eq!(session.room(), None);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.id().as_str().starts_with("sess_"));

        session.set_room(RoomId(7));
        assert_eq!(session.room(), Some(RoomId(7)));
    }

    #[test]
    fn full_queue_drops_new_events() {
        let (session, mut rx) = Session::new(user(), 2);
        assert_eq!(session.enqueue(event("1")), Enqueue::Queued);
        assert_eq!(session.enqueue(event("2")), Enqueue::Queued);
        assert_eq!(session.enqueue(event("3")), Enqueue::Dropped);
        assert_eq!(session.dropped(), 1);

        // Oldest events survive.
        let first = rx.try_recv().unwrap();
        assert!(first.raw_payload().contains("\"1\""));
    }

    #[test]
    fn drained_once_receiver_takes_everything() {
        let (session, mut rx) = Session::new(user(), 4);
        assert!(session.is_drained());

        session.enqueue(event("x"));
        assert!(!session.is_drained());

        rx.try_recv().unwrap();
        assert!(session.is_drained());
    }

    #[test]
    fn enqueue_after_receiver_dropped_reports_closed() {
        let (session, rx) = Session::new(user(), 4);
        drop(rx);
        assert_eq!(session.enqueue(event("x")), Enqueue::Closed);
        assert_eq!(session.dropped(), 0);
    }

    #[test]
    fn closing_does_not_reopen_closed_session() {
        let (session, _rx) = Session::new(user(), 1);
        session.set_state(SessionState::Active);
        session.begin_closing();
        assert_eq!(session.state(), SessionState::Closing);

        session.set_state(SessionState::Closed);
        session.begin_closing();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn ping_period_is_ninety_percent() {
        let config = SessionConfig {
            liveness_timeout: Duration::from_secs(10),
            outbound_queue: 64,
        };
        assert_eq!(config.ping_period(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn write_failure_is_counted_and_loop_continues() {
        let f = fixture(&[1]);
        let (session, rx) = Session::new(user(), 4);
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = ScriptedSink {
            sent: Arc::clone(&sent),
            failing_writes: 1,
        };
        let writer = tokio::spawn(outbound_loop(
            sink,
            rx,
            Arc::clone(&session),
            Arc::clone(&f.hub),
            Duration::from_secs(3600),
        ));

        assert_eq!(session.enqueue(event("lost")), Enqueue::Queued);
        assert_eq!(session.enqueue(event("kept")), Enqueue::Queued);

        let deadline = Instant::now() + Duration::from_secs(2);
        while sent.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        {
            let frames = sent.lock();
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                WsMessage::Text(text) => assert!(text.as_str().contains("kept")),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(f.metrics.counter_get("session.write_failed", &[]), 1);
        assert!(!session.is_closed());

        session.close();
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent.lock().last(), Some(WsMessage::Close(None))));
        assert_eq!(session.state(), SessionState::Closing);
    }
}
