//! Playing Routers
//!
//! A playing router is one active gameplay participant, ticked once per
//! listener update. The listener only relies on `update()` and the
//! disconnected flag.

use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::network::protocol::ServerMessage;
use crate::network::session::SessionId;

/// Unique router identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterId(u64);

impl RouterId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "router {}", self.0)
    }
}

/// Gameplay participant driven by the listener's update loop.
pub trait PlayingRouter: Send {
    /// Router identity; unique within a listener.
    fn id(&self) -> RouterId;

    /// Session this router plays for, if any.
    fn session(&self) -> Option<SessionId> {
        None
    }

    /// Advance one tick. May raise the disconnected flag.
    fn update(&mut self);

    /// Once set, the listener drops the router at the end of its update.
    fn is_disconnected(&self) -> bool;

    /// Raise the disconnected flag.
    fn disconnect(&mut self);
}

/// Placeholder player created for every connection.
pub struct PlayerRouter {
    id: RouterId,
    session: SessionId,
    outbound: mpsc::Sender<ServerMessage>,
    tick: u64,
    disconnected: bool,
}

impl PlayerRouter {
    /// Create a router playing for `session`.
    pub fn new(id: RouterId, session: SessionId, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            session,
            outbound,
            tick: 0,
            disconnected: false,
        }
    }

    /// Ticks played so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }
}

impl PlayingRouter for PlayerRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn session(&self) -> Option<SessionId> {
        Some(self.session)
    }

    fn update(&mut self) {
        if self.disconnected {
            return;
        }
        if self.outbound.is_closed() {
            self.disconnected = true;
            return;
        }

        self.tick += 1;
        // A full queue skips this frame; the listener evicts stalled sessions.
        let message = ServerMessage::Tick { tick: self.tick };
        if let Err(TrySendError::Closed(_)) = self.outbound.try_send(message) {
            self.disconnected = true;
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }
}
