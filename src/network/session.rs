//! Client Sessions
//!
//! One accepted WebSocket client as the listener sees it. The socket itself
//! lives in the connection task; the session talks to it through a bounded
//! message queue and a separate one-shot close request, so a close never
//! waits behind messages a stalled client is not reading.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::game::chat::ChannelId;
use crate::game::router::{PlayingRouter, RouterId};
use crate::network::protocol::ServerMessage;

/// Close code sent to sessions idle past the dormancy limit.
pub const DORMANCY_CLOSE_CODE: u16 = 1003;

/// Close reason sent with [`DORMANCY_CLOSE_CODE`].
pub const DORMANCY_CLOSE_REASON: &str = "Maximum dormancy time exceeded";

/// Close code sent to sessions whose outbound queue is full.
pub const STALLED_CLOSE_CODE: u16 = 1008;

/// Close reason sent with [`STALLED_CLOSE_CODE`].
pub const STALLED_CLOSE_REASON: &str = "Client stopped reading";

/// Messages queued for a connection task before its session counts as
/// stalled.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Unique session identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Close frame a connection task should send before ending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

/// Reactor ends of one connection's channels.
#[derive(Debug)]
pub struct Outlet {
    messages: mpsc::Sender<ServerMessage>,
    close: oneshot::Sender<CloseRequest>,
}

/// Connection-task ends of one connection's channels.
#[derive(Debug)]
pub struct Inbox {
    /// Protocol messages to send, in order.
    pub messages: mpsc::Receiver<ServerMessage>,
    /// Fires once when the session asks for the socket to close.
    pub close: oneshot::Receiver<CloseRequest>,
}

/// Channels for a new connection, holding up to [`OUTBOUND_CAPACITY`]
/// queued messages.
pub fn outlet() -> (Outlet, Inbox) {
    outlet_with_capacity(OUTBOUND_CAPACITY)
}

pub(crate) fn outlet_with_capacity(capacity: usize) -> (Outlet, Inbox) {
    let (messages_tx, messages_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = oneshot::channel();
    let outlet = Outlet {
        messages: messages_tx,
        close: close_tx,
    };
    let inbox = Inbox {
        messages: messages_rx,
        close: close_rx,
    };
    (outlet, inbox)
}

/// Server-side state of one connected client.
pub struct Session {
    id: SessionId,
    remote_address: SocketAddr,
    outbound: mpsc::Sender<ServerMessage>,
    close: Option<oneshot::Sender<CloseRequest>>,
    connected_at: Instant,
    last_activity: Instant,
    channel: Option<ChannelId>,
    router: Option<RouterId>,
    /// Gameplay placeholder waiting for promotion.
    player: Option<Box<dyn PlayingRouter>>,
    name: Option<String>,
}

impl Session {
    /// Create a session accepted at `now`.
    pub fn new(
        id: SessionId,
        remote_address: SocketAddr,
        outlet: Outlet,
        now: Instant,
    ) -> Self {
        Self {
            id,
            remote_address,
            outbound: outlet.messages,
            close: Some(outlet.close),
            connected_at: now,
            last_activity: now,
            channel: None,
            router: None,
            player: None,
            name: None,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// When the session was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Last inbound frame.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Chat channel the session belongs to.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub(crate) fn set_channel(&mut self, channel: Option<ChannelId>) {
        self.channel = channel;
    }

    /// Playing router driving this session, once promoted.
    pub fn router(&self) -> Option<RouterId> {
        self.router
    }

    pub(crate) fn set_router(&mut self, router: Option<RouterId>) {
        self.router = router;
    }

    /// Display name chosen on spawn.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Name shown in chat.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    /// Record inbound activity.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time since the last inbound frame.
    pub fn dormancy(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Attach the gameplay placeholder.
    pub fn create_player(&mut self, player: Box<dyn PlayingRouter>) {
        self.player = Some(player);
    }

    /// Is a placeholder waiting for promotion.
    pub fn has_player(&self) -> bool {
        self.player.is_some()
    }

    pub(crate) fn take_player(&mut self) -> Option<Box<dyn PlayingRouter>> {
        self.player.take()
    }

    /// A sender for the connection task, for routers acting on this session.
    pub fn outbound(&self) -> mpsc::Sender<ServerMessage> {
        self.outbound.clone()
    }

    /// Queue a message. Returns `false` if the connection task is gone or
    /// its queue is full; a full queue drops the message.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// The outbound queue is full: the client is not reading.
    pub fn is_stalled(&self) -> bool {
        !self.outbound.is_closed() && self.outbound.capacity() == 0
    }

    /// Has a close been requested.
    pub fn is_closing(&self) -> bool {
        self.close.is_none()
    }

    /// Ask the connection task to close the socket. Only the first request
    /// per session is forwarded.
    pub fn close_socket(&mut self, code: u16, reason: &str) -> bool {
        let Some(close) = self.close.take() else {
            return false;
        };
        let _ = close.send(CloseRequest {
            code,
            reason: reason.to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session_with_capacity(capacity: usize) -> (Session, Inbox, Instant) {
        let (outlet, inbox) = outlet_with_capacity(capacity);
        let now = Instant::now();
        let session = Session::new(SessionId::new(7), "127.0.0.1:40000".parse().unwrap(), outlet, now);
        (session, inbox, now)
    }

    fn test_session() -> (Session, Inbox, Instant) {
        test_session_with_capacity(OUTBOUND_CAPACITY)
    }

    #[test]
    fn test_touch_resets_dormancy() {
        let (mut session, _inbox, start) = test_session();
        let later = start + Duration::from_secs(5);
        assert_eq!(session.dormancy(later), Duration::from_secs(5));

        session.touch(later);
        assert_eq!(session.dormancy(later), Duration::ZERO);
        assert_eq!(session.dormancy(start), Duration::ZERO);
    }

    #[test]
    fn test_close_forwarded_once() {
        let (mut session, mut inbox, _) = test_session();

        assert!(session.close_socket(DORMANCY_CLOSE_CODE, DORMANCY_CLOSE_REASON));
        assert!(!session.close_socket(DORMANCY_CLOSE_CODE, DORMANCY_CLOSE_REASON));
        assert!(session.is_closing());

        assert_eq!(
            inbox.close.try_recv().unwrap(),
            CloseRequest {
                code: 1003,
                reason: DORMANCY_CLOSE_REASON.into()
            }
        );
        assert!(inbox.messages.try_recv().is_err());
    }

    #[test]
    fn test_label_prefers_name() {
        let (mut session, _inbox, _) = test_session();
        assert_eq!(session.label(), "#7");
        session.set_name("ogar");
        assert_eq!(session.label(), "ogar");
    }

    #[test]
    fn test_send_after_task_gone() {
        let (session, inbox, _) = test_session();
        drop(inbox);
        assert!(!session.send(ServerMessage::Tick { tick: 1 }));
        assert!(!session.is_stalled());
    }

    #[test]
    fn test_full_queue_marks_stalled() {
        let (session, mut inbox, _) = test_session_with_capacity(2);

        assert!(session.send(ServerMessage::Tick { tick: 1 }));
        assert!(!session.is_stalled());
        assert!(session.send(ServerMessage::Tick { tick: 2 }));
        assert!(session.is_stalled());
        assert!(!session.send(ServerMessage::Tick { tick: 3 }));

        assert_eq!(inbox.messages.try_recv().unwrap(), ServerMessage::Tick { tick: 1 });
        assert!(!session.is_stalled());
    }

    #[test]
    fn test_close_not_queued_behind_messages() {
        let (mut session, mut inbox, _) = test_session_with_capacity(1);
        assert!(session.send(ServerMessage::Tick { tick: 1 }));
        assert!(session.is_stalled());

        assert!(session.close_socket(STALLED_CLOSE_CODE, STALLED_CLOSE_REASON));
        assert_eq!(inbox.close.try_recv().unwrap().code, STALLED_CLOSE_CODE);
    }
}
