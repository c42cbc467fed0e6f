//! Connection Listener
//!
//! Owns the accept socket and every roster: sessions, playing routers and
//! the global chat channel. All mutation happens on the reactor task, so
//! nothing here is locked; the only state shared with connection tasks is
//! the session count read by [`Admission`] during the handshake.
//!
//! Lifecycle of a client:
//!
//! ```text
//! verify ──► on_connection ──► chat only (queuing) ──spawn──► matchmaker ──► playing router
//!                   │                                              ▲
//!                   └──────────────── no queuing ──────────────────┘
//! any state ──close / dormancy──► on_disconnection
//! ```

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::game::chat::{ChannelId, ChatChannel};
use crate::game::matchmaker::Matchmaker;
use crate::game::router::{PlayerRouter, PlayingRouter, RouterId};
use crate::log::Logger;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::session::{
    Outlet, Session, SessionId, DORMANCY_CLOSE_CODE, DORMANCY_CLOSE_REASON, STALLED_CLOSE_CODE,
    STALLED_CLOSE_REASON,
};

/// Channel every session joins on connect.
pub const GLOBAL_CHANNEL: ChannelId = ChannelId::new(0);

/// Sent to new sessions when play requires explicit queuing.
pub const QUEUING_DIRECTIVES: [&str; 2] = [
    "This server requires players to be queued.",
    "Try spawning to enqueue.",
];

/// Close code sent to sessions closed by an operator.
pub const KICK_CLOSE_CODE: u16 = 1000;

/// What the handshake knows about a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer address.
    pub remote_address: SocketAddr,
    /// Arrived over TLS.
    pub secure: bool,
    /// Declared `Origin` header.
    pub origin: Option<String>,
}

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Origin not in the allow-list.
    #[error("origin not accepted")]
    OriginRejected,
    /// Session count above the configured maximum.
    #[error("too many connections")]
    Overloaded,
}

impl AdmissionError {
    /// HTTP status returned to the client.
    pub fn status(self) -> u16 {
        match self {
            AdmissionError::OriginRejected => 403,
            AdmissionError::Overloaded => 503,
        }
    }

    /// HTTP reason returned to the client.
    pub fn reason(self) -> &'static str {
        match self {
            AdmissionError::OriginRejected => "Forbidden",
            AdmissionError::Overloaded => "Service Unavailable",
        }
    }
}

/// Handshake-time verification, cloneable into connection tasks.
#[derive(Clone)]
pub struct Admission {
    settings: Arc<Settings>,
    logger: Logger,
    connections: Arc<AtomicUsize>,
}

impl Admission {
    /// Create a verifier with no sessions counted.
    pub fn new(settings: Arc<Settings>, logger: Logger) -> Self {
        Self {
            settings,
            logger,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sessions currently registered with the listener.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn publish(&self, count: usize) {
        self.connections.store(count, Ordering::Release);
    }

    /// Decide whether an attempt may upgrade. The origin is checked before
    /// capacity, so refused origins never count against it.
    pub fn verify(&self, info: &ConnectionInfo) -> Result<(), AdmissionError> {
        let origin = info.origin.as_deref().unwrap_or("none");
        self.logger.access(format!(
            "REQUEST FROM {}, {}secure, Origin: {}",
            info.remote_address,
            if info.secure { "" } else { "not " },
            origin
        ));

        if let Some(accepted) = self.settings.accepted_origins() {
            let matches = info
                .origin
                .as_deref()
                .is_some_and(|declared| accepted.contains(&declared));
            self.logger.debug(format!(
                "accepted origins are defined; did {origin} pass: {matches}"
            ));
            if !matches {
                return Err(AdmissionError::OriginRejected);
            }
        }

        // Strictly greater: one attempt past the maximum still gets in.
        if self.connections() > self.settings.listener_max_connections {
            self.logger.debug("too many connections, drop new ones!");
            return Err(AdmissionError::Overloaded);
        }

        self.logger.debug("client verification passed");
        Ok(())
    }
}

/// Connection lifecycle and the fixed-cadence update scan.
pub struct Listener {
    settings: Arc<Settings>,
    logger: Logger,
    admission: Admission,
    socket: Option<Arc<TcpListener>>,
    sessions: BTreeMap<SessionId, Session>,
    routers: Vec<Box<dyn PlayingRouter>>,
    global_chat: ChatChannel,
    matchmaker: Box<dyn Matchmaker>,
    next_session: u64,
    next_router: u64,
}

impl Listener {
    /// Create a closed listener.
    pub fn new(settings: Arc<Settings>, logger: Logger, matchmaker: Box<dyn Matchmaker>) -> Self {
        Self {
            admission: Admission::new(settings.clone(), logger.clone()),
            settings,
            logger,
            socket: None,
            sessions: BTreeMap::new(),
            routers: Vec::new(),
            global_chat: ChatChannel::new(GLOBAL_CHANNEL),
            matchmaker,
            next_session: 1,
            next_router: 1,
        }
    }

    /// Listener settings.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Logger connection events go to.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    // =========================================================================
    // ACCEPT SOCKET
    // =========================================================================

    /// Bind the accept socket. Returns `false` if already open.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&mut self) -> io::Result<bool> {
        if self.socket.is_some() {
            return Ok(false);
        }
        let port = self.settings.listening_port;
        self.logger.debug(format!("listener opening at {port}"));

        let std_listener = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_listener.set_nonblocking(true)?;
        let socket = TcpListener::from_std(std_listener)?;
        let local_addr = socket.local_addr()?;

        self.socket = Some(Arc::new(socket));
        self.on_open(local_addr);
        Ok(true)
    }

    /// Drop the accept socket. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.socket.is_none() {
            return false;
        }
        self.logger.debug("listener closing");
        self.socket = None;
        true
    }

    fn on_open(&self, local_addr: SocketAddr) {
        self.logger.inform(format!("listener open at {local_addr}"));
    }

    /// Is the accept socket bound.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Accept socket, while open.
    pub fn socket(&self) -> Option<Arc<TcpListener>> {
        self.socket.clone()
    }

    /// Bound address, while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    // =========================================================================
    // VERIFICATION
    // =========================================================================

    /// Verifier to install on each handshake.
    pub fn admission(&self) -> Admission {
        self.admission.clone()
    }

    /// Verify one connection attempt.
    pub fn verify_client(&self, info: &ConnectionInfo) -> Result<(), AdmissionError> {
        self.admission.verify(info)
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Register an upgraded connection and route it.
    pub fn on_connection(
        &mut self,
        remote_address: SocketAddr,
        outlet: Outlet,
    ) -> SessionId {
        let id = SessionId::new(self.next_session);
        self.next_session += 1;

        let mut session = Session::new(id, remote_address, outlet, Instant::now());
        self.logger.access(format!("CONNECTION FROM {remote_address}"));

        let router_id = self.next_router_id();
        session.create_player(Box::new(PlayerRouter::new(router_id, id, session.outbound())));
        self.global_chat.add(&mut session);
        self.sessions.insert(id, session);
        self.admission.publish(self.sessions.len());

        if self.settings.matchmaker_needs_queuing {
            if let Some(session) = self.sessions.get(&id) {
                for directive in QUEUING_DIRECTIVES {
                    self.global_chat.direct_message(None, session, directive);
                }
            }
        } else {
            self.enqueue(id);
        }

        id
    }

    /// Handle one inbound frame. `None` is a frame that is not a protocol
    /// message; it still counts as activity.
    pub fn on_message(&mut self, id: SessionId, message: Option<ClientMessage>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.touch(Instant::now());

        match message {
            Some(ClientMessage::Chat { text }) => {
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                if let Some(session) = self.sessions.get(&id) {
                    self.global_chat.broadcast(Some(session), text, &self.sessions);
                }
            }
            Some(ClientMessage::Spawn { name }) => {
                if let Some(name) = name.filter(|name| !name.trim().is_empty()) {
                    session.set_name(name.trim());
                }
                self.enqueue(id);
            }
            Some(ClientMessage::Ping { timestamp }) => {
                session.send(ServerMessage::Pong {
                    timestamp,
                    server_time: unix_millis(),
                });
            }
            None => {}
        }
    }

    /// Unregister a closed connection. Unknown sessions are ignored.
    pub fn on_disconnection(&mut self, id: SessionId, code: u16, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            self.logger
                .debug(format!("disconnection from unknown session {id} ignored"));
            return false;
        };
        self.logger.access(format!(
            "DISCONNECTION FROM {} ({} '{}')",
            session.remote_address(),
            code,
            reason
        ));

        self.global_chat.remove(&mut session);
        self.admission.publish(self.sessions.len());
        self.matchmaker.dequeue(id);

        if let Some(router_id) = session.router() {
            if let Some(router) = self.routers.iter_mut().find(|router| router.id() == router_id) {
                router.disconnect();
            }
        }
        true
    }

    /// Hand a waiting session to the matchmaker. Returns `false` if the
    /// session is unknown or already playing.
    pub fn enqueue(&mut self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(session) if session.router().is_none() => {}
            _ => return false,
        }
        for promoted in self.matchmaker.enqueue(id) {
            self.promote(promoted);
        }
        true
    }

    fn promote(&mut self, id: SessionId) {
        let Some(player) = self.sessions.get_mut(&id).and_then(Session::take_player) else {
            return;
        };
        let router_id = player.id();
        if !self.add_playing_router(player) {
            return;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_router(Some(router_id));
        }
        self.logger.debug(format!("session {id} entered play as {router_id}"));
    }

    /// Close a session on the operator's request.
    pub fn kick(&mut self, id: SessionId, reason: &str) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => session.close_socket(KICK_CLOSE_CODE, reason),
            None => false,
        }
    }

    /// Send a server notice to the global channel.
    pub fn announce(&self, text: &str) -> usize {
        self.global_chat.broadcast(None, text, &self.sessions)
    }

    /// Registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a session.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Sessions in id order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// The channel every session joins.
    pub fn global_chat(&self) -> &ChatChannel {
        &self.global_chat
    }

    /// Sessions waiting in the matchmaker.
    pub fn queued_count(&self) -> usize {
        self.matchmaker.queued()
    }

    // =========================================================================
    // PLAYING ROUTERS
    // =========================================================================

    /// Fresh router identifier.
    pub fn next_router_id(&mut self) -> RouterId {
        let id = RouterId::new(self.next_router);
        self.next_router += 1;
        id
    }

    /// Register a router. Returns `false` if its id is already registered.
    pub fn add_playing_router(&mut self, router: Box<dyn PlayingRouter>) -> bool {
        if self.routers.iter().any(|known| known.id() == router.id()) {
            return false;
        }
        self.routers.push(router);
        true
    }

    /// Unregister a router. Absent ids leave the roster untouched.
    pub fn remove_playing_router(&mut self, id: RouterId) -> Option<Box<dyn PlayingRouter>> {
        let index = self.routers.iter().position(|router| router.id() == id)?;
        Some(self.routers.remove(index))
    }

    /// Registered routers.
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    /// Router ids in tick order.
    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.iter().map(|router| router.id()).collect()
    }

    // =========================================================================
    // UPDATE LOOP
    // =========================================================================

    /// One tick.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// One tick, measuring dormancy against `now`.
    pub fn update_at(&mut self, now: Instant) {
        // Every router is visited exactly once; disconnected ones are
        // dropped in place without disturbing the order of the rest.
        let mut retired = Vec::new();
        self.routers.retain_mut(|router| {
            router.update();
            if router.is_disconnected() {
                retired.push((router.id(), router.session()));
                false
            } else {
                true
            }
        });

        for (router_id, session_id) in retired {
            self.logger.debug(format!("{router_id} disconnected"));
            let Some(session) = session_id.and_then(|id| self.sessions.get_mut(&id)) else {
                continue;
            };
            if session.router() == Some(router_id) {
                session.set_router(None);
            }
        }

        // Removal happens in `on_disconnection` once the socket closes.
        let max_dormancy = self.settings.max_client_dormancy();
        for session in self.sessions.values_mut() {
            if session.is_closing() {
                continue;
            }
            if session.dormancy(now) > max_dormancy {
                session.close_socket(DORMANCY_CLOSE_CODE, DORMANCY_CLOSE_REASON);
            } else if session.is_stalled() {
                self.logger
                    .debug(format!("session {} stopped reading", session.id()));
                session.close_socket(STALLED_CLOSE_CODE, STALLED_CLOSE_REASON);
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
