//! The hub owns the session registry and the room cache, routes inbound
//! events to their handlers and fans events out to every session in a room.
//!
//! The registry is only mutated by the control loop. Sessions ask for
//! registration and removal through [`HubCommand`]s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parlor_core::events::{Action, Event, UnknownAction};
use parlor_core::ids::{RoomId, SessionId};
use parlor_core::rooms::RoomStore;
use parlor_core::Broker;
use parlor_telemetry::MetricsRecorder;

use crate::error::HubError;
use crate::handlers;
use crate::session::{Enqueue, Session, SessionState};

const CONTROL_QUEUE: usize = 1024;
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Run store I/O that blocks the calling thread. On a multi-thread runtime
/// the worker hands its other tasks off first.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

pub(crate) enum HubCommand {
    Register {
        session: Arc<Session>,
        ack: oneshot::Sender<bool>,
    },
    Deregister(SessionId),
}

pub struct Hub {
    sessions: DashMap<SessionId, Arc<Session>>,
    rooms: Mutex<HashSet<RoomId>>,
    store: Arc<dyn RoomStore>,
    broker: Arc<dyn Broker>,
    metrics: Arc<MetricsRecorder>,
    control: mpsc::Sender<HubCommand>,
    accepting: AtomicBool,
    publish_timeout: Duration,
}

/// Receiving half of the hub's control queue. Drive it with [`HubControl::run`].
pub struct HubControl {
    hub: Arc<Hub>,
    rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new(
        store: Arc<dyn RoomStore>,
        broker: Arc<dyn Broker>,
        metrics: Arc<MetricsRecorder>,
        publish_timeout: Duration,
    ) -> (Arc<Self>, HubControl) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        let hub = Arc::new(Self {
            sessions: DashMap::new(),
            rooms: Mutex::new(HashSet::new()),
            store,
            broker,
            metrics,
            control: tx,
            accepting: AtomicBool::new(true),
            publish_timeout,
        });
        let control = HubControl {
            hub: Arc::clone(&hub),
            rx,
        };
        (hub, control)
    }

    pub(crate) fn store(&self) -> Arc<dyn RoomStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub(crate) fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of registered sessions currently in `room`.
    pub fn room_occupancy(&self, room: RoomId) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().room() == Some(room))
            .count()
    }

    /// Ask the control loop to add `session`. Resolves to `false` once the hub
    /// has stopped accepting connections.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let (ack, accepted) = oneshot::channel();
        if self
            .control
            .send(HubCommand::Register { session, ack })
            .await
            .is_err()
        {
            return false;
        }
        accepted.await.unwrap_or(false)
    }

    /// Ask the control loop to remove `session`. Safe to call more than once.
    pub async fn deregister(&self, session: &Session) {
        if self
            .control
            .send(HubCommand::Deregister(session.id().clone()))
            .await
            .is_err()
        {
            // Control loop is gone; the registry was already cleared.
            session.close();
        }
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        session.set_state(SessionState::Active);
        info!(
            session_id = %session.id(),
            user_id = %session.user().id,
            username = %session.user().username,
            "user connected"
        );
        self.sessions.insert(session.id().clone(), session);
        self.metrics
            .gauge_set("hub.sessions", &[], self.sessions.len() as i64);
    }

    /// Remove a session and close it. Only the first removal closes.
    pub(crate) fn remove(&self, id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.close();
            session.set_state(SessionState::Closed);
            self.metrics
                .gauge_set("hub.sessions", &[], self.sessions.len() as i64);
            info!(
                session_id = %id,
                user_id = %session.user().id,
                dropped = session.dropped(),
                "user disconnected"
            );
        }
    }

    /// Check the room cache, refetching from the store once on a miss.
    pub fn is_valid_room(&self, room: RoomId) -> bool {
        let mut cache = self.rooms.lock();
        if cache.contains(&room) {
            return true;
        }

        match blocking(|| self.store.list_rooms()) {
            Ok(rooms) => {
                *cache = rooms.into_iter().map(|r| r.id).collect();
                debug!(rooms = cache.len(), "room cache refreshed");
                cache.contains(&room)
            }
            Err(e) => {
                warn!(room_id = %room, error = %e, "room refresh failed");
                false
            }
        }
    }

    /// Offer `event` to every session in `room`. Returns how many queued it.
    pub fn broadcast(&self, room: RoomId, event: Arc<Event>) -> usize {
        let mut queued = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.room() != Some(room) {
                continue;
            }
            match session.enqueue(Arc::clone(&event)) {
                Enqueue::Queued => queued += 1,
                Enqueue::Dropped => {
                    self.metrics.counter_inc("hub.outbound_dropped", &[], 1);
                    warn!(
                        session_id = %session.id(),
                        room_id = %room,
                        "outbound queue full, dropping event"
                    );
                }
                Enqueue::Closed => {}
            }
        }
        self.metrics.counter_inc("hub.broadcasts", &[], 1);
        debug!(room_id = %room, action = %event.action, queued, "broadcast");
        queued
    }

    /// Dispatch one decoded event to its handler.
    pub fn route(&self, event: &Event, session: &Session) -> Result<(), HubError> {
        let action: Action = event
            .action
            .parse()
            .map_err(|UnknownAction(name)| HubError::InvalidAction(name))?;

        match action {
            Action::SendMessage => handlers::send_message(self, event, session),
            Action::JoinRoom => handlers::join_room(self, event, session),
            Action::ChatbotCommand => handlers::chatbot_command(self, event, session),
            Action::MessageReceived => Err(HubError::InvalidAction(action.to_string())),
        }
    }

    /// Decode and route one raw frame. Returns `false` when the session must close.
    pub(crate) fn handle_frame(&self, session: &Session, frame: &[u8]) -> bool {
        let event = match Event::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                self.metrics
                    .counter_inc("hub.frames_rejected", &[("reason", "envelope")], 1);
                warn!(session_id = %session.id(), error = %e, "dropping malformed frame");
                return true;
            }
        };

        match self.route(&event, session) {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                warn!(
                    session_id = %session.id(),
                    action = %event.action,
                    error = %e,
                    "protocol violation, closing session"
                );
                false
            }
            Err(e) => {
                self.metrics
                    .counter_inc("hub.frames_rejected", &[("reason", e.error_kind())], 1);
                warn!(
                    session_id = %session.id(),
                    action = %event.action,
                    error = %e,
                    "dropping frame"
                );
                true
            }
        }
    }

    fn all_drained(&self) -> bool {
        self.sessions.iter().all(|e| e.value().is_drained())
    }

    fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.remove(id);
        }
    }
}

impl HubControl {
    /// Apply register/deregister requests until `cancel` fires, then drain.
    pub async fn run(mut self, cancel: CancellationToken, drain_timeout: Duration) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
            }
        }

        self.drain(drain_timeout).await;
    }

    fn apply(&self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { session, ack } => {
                let accepted = self.hub.is_accepting();
                if accepted {
                    self.hub.insert(session);
                }
                let _ = ack.send(accepted);
            }
            HubCommand::Deregister(id) => self.hub.remove(&id),
        }
    }

    /// Stop accepting, give outbound queues up to `timeout` to empty, then
    /// close whatever is left.
    async fn drain(mut self, timeout: Duration) {
        self.hub.accepting.store(false, Ordering::Release);
        info!(
            sessions = self.hub.session_count(),
            timeout_ms = timeout.as_millis() as u64,
            "draining sessions"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(DRAIN_POLL);
        while !self.hub.all_drained() {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    warn!("drain timeout reached");
                    break;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = poll.tick() => {}
            }
        }

        self.hub.close_all();
        info!("hub stopped");
    }
}
