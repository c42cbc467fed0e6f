//! WebSocket Game Server
//!
//! The reactor. One task owns the [`Listener`] and selects over accepts,
//! connection events, the fixed-cadence tick, console input and
//! connection-task completions. Connection tasks never touch rosters;
//! they only exchange messages with the reactor.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::commands::{builtin_commands, CommandError, CommandList};
use crate::config::Settings;
use crate::game::matchmaker::QueueMatchmaker;
use crate::handle::ServerHandle;
use crate::log::Logger;
use crate::network::listener::{Admission, AdmissionError, ConnectionInfo, Listener};
use crate::network::protocol::ClientMessage;
use crate::network::session::{outlet, CloseRequest, Inbox, Outlet, SessionId};
use crate::supervisor::panic_message;

/// Close code reported when a connection ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// How long a close frame may take to go out before the stream is dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind or accept.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] io::Error),

    /// A connection task panicked.
    #[error("Connection task {0}")]
    TaskPanicked(String),

    /// Command registration failed.
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// What a connection task reports to the reactor.
#[derive(Debug)]
pub enum ListenerEvent {
    /// Handshake completed; the reactor replies with the session id.
    Connected {
        /// Peer address.
        remote: SocketAddr,
        /// Channels the session writes to.
        outlet: Outlet,
        /// Receives the assigned id.
        reply: oneshot::Sender<SessionId>,
    },
    /// One inbound frame; `None` if it was not a protocol message.
    Message {
        /// Sender.
        session: SessionId,
        /// Parsed message.
        message: Option<ClientMessage>,
    },
    /// The socket closed.
    Disconnected {
        /// Closed session.
        session: SessionId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// The game server.
pub struct GameServer {
    handle: ServerHandle,
    commands: Arc<CommandList<ServerHandle>>,
    events_tx: mpsc::UnboundedSender<ListenerEvent>,
    events_rx: mpsc::UnboundedReceiver<ListenerEvent>,
    tasks: JoinSet<()>,
}

impl GameServer {
    /// Create a server with the built-in commands and a queue matchmaker.
    pub fn new(settings: Arc<Settings>, logger: Logger) -> Result<Self, GameServerError> {
        let matchmaker = Box::new(QueueMatchmaker::new(settings.matchmaker_bulk_size));
        let listener = Listener::new(settings.clone(), logger.clone(), matchmaker);
        let mut handle = ServerHandle::new(settings, logger, listener);

        let commands = builtin_commands()?;
        handle.set_help(commands.help_lines());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            handle,
            commands: Arc::new(commands),
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
        })
    }

    /// Shared state handed to commands.
    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Open the listener if needed and return its bound address.
    pub fn bind(&mut self) -> Result<SocketAddr, GameServerError> {
        self.handle.listener.open()?;
        self.handle.listener.local_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener has no address").into()
        })
    }

    /// Run until `stop` or ctrl-c. Lines from `console` are executed as
    /// operator commands.
    pub async fn run(
        &mut self,
        mut console: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), GameServerError> {
        self.bind()?;

        let mut ticker = interval(self.handle.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;
        let mut console_open = true;

        while self.handle.is_running() {
            tokio::select! {
                accepted = accept(self.handle.listener.socket()) => match accepted {
                    Ok((stream, remote)) => self.spawn_connection(stream, remote),
                    Err(e) => warn!("Accept error: {}", e),
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event),
                _ = ticker.tick() => self.handle.listener.update(),
                line = console.recv(), if console_open => match line {
                    Some(line) => self.execute(&line),
                    None => console_open = false,
                },
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            return Err(GameServerError::TaskPanicked(panic_message(e.into_panic())));
                        }
                    }
                }
                result = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if let Err(e) = result {
                        error!("Failed to listen for ctrl-c: {}", e);
                        continue;
                    }
                    info!("Shutdown signal received");
                    self.handle.stop();
                }
            }
        }

        self.handle.listener.close();
        self.tasks.shutdown().await;
        Ok(())
    }

    fn dispatch(&mut self, event: ListenerEvent) {
        let listener = &mut self.handle.listener;
        match event {
            ListenerEvent::Connected {
                remote,
                outlet,
                reply,
            } => {
                let id = listener.on_connection(remote, outlet);
                if reply.send(id).is_err() {
                    listener.on_disconnection(id, ABNORMAL_CLOSE_CODE, "");
                }
            }
            ListenerEvent::Message { session, message } => listener.on_message(session, message),
            ListenerEvent::Disconnected {
                session,
                code,
                reason,
            } => {
                listener.on_disconnection(session, code, &reason);
            }
        }
    }

    fn execute(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if !self.commands.execute(&mut self.handle, line) {
            self.handle
                .logger
                .print(format!("unknown command '{line}', try help"));
        }
    }

    fn spawn_connection(&mut self, stream: TcpStream, remote: SocketAddr) {
        debug!("New connection from {}", remote);
        let admission = self.handle.listener.admission();
        let events = self.events_tx.clone();
        self.tasks
            .spawn(handle_connection(stream, remote, admission, events));
    }
}

/// Next connection on `socket`. Never resolves once the listener is closed.
async fn accept(socket: Option<Arc<TcpListener>>) -> io::Result<(TcpStream, SocketAddr)> {
    match socket {
        Some(socket) => socket.accept().await,
        None => future::pending().await,
    }
}

fn rejection_response(rejection: AdmissionError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.reason().to_string()));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::FORBIDDEN);
    response
}

/// Handshake, then relay frames until either side closes.
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    admission: Admission,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    let verify = |request: &Request, response: Response| {
        let info = ConnectionInfo {
            remote_address: remote,
            secure: false,
            origin: request
                .headers()
                .get(header::ORIGIN)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        };
        match admission.verify(&info) {
            Ok(()) => Ok(response),
            Err(rejection) => Err(rejection_response(rejection)),
        }
    };

    let socket = match accept_hdr_async(stream, verify).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", remote, e);
            return;
        }
    };

    let (outlet, inbox) = outlet();
    let (reply_tx, reply_rx) = oneshot::channel();
    let connected = ListenerEvent::Connected {
        remote,
        outlet,
        reply: reply_tx,
    };
    if events.send(connected).is_err() {
        return;
    }
    let Ok(session) = reply_rx.await else {
        return;
    };

    let Inbox {
        messages: mut outbound_rx,
        close: mut close_rx,
    } = inbox;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut closed_with: Option<(u16, String)> = None;

    // A close request wins over everything, including a send the peer is
    // not draining. A dropped request means the session is gone.
    loop {
        tokio::select! {
            biased;
            request = &mut close_rx => {
                if let Ok(request) = request {
                    closed_with = Some(send_close(&mut ws_sender, request).await);
                }
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = match ClientMessage::from_json(&text) {
                        Ok(message) => Some(message),
                        Err(e) => {
                            debug!("Invalid message from {}: {}", remote, e);
                            None
                        }
                    };
                    let _ = events.send(ListenerEvent::Message { session, message });
                }
                Some(Ok(Message::Close(frame))) => {
                    closed_with = frame.map(|frame| (u16::from(frame.code), frame.reason.into_owned()));
                    break;
                }
                Some(Ok(_)) => {
                    let _ = events.send(ListenerEvent::Message { session, message: None });
                }
                Some(Err(e)) => {
                    debug!("WebSocket error for {}: {}", remote, e);
                    break;
                }
                None => break,
            },
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                tokio::select! {
                    biased;
                    request = &mut close_rx => {
                        if let Ok(request) = request {
                            closed_with = Some(send_close(&mut ws_sender, request).await);
                        }
                        break;
                    }
                    sent = ws_sender.send(Message::Text(text)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    let (code, reason) = closed_with.unwrap_or((ABNORMAL_CLOSE_CODE, String::new()));
    let _ = events.send(ListenerEvent::Disconnected {
        session,
        code,
        reason,
    });
}

/// Send the close frame, giving up after [`CLOSE_TIMEOUT`]. Returns the
/// code and reason to report.
async fn send_close(
    sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    request: CloseRequest,
) -> (u16, String) {
    let frame = CloseFrame {
        code: CloseCode::from(request.code),
        reason: request.reason.clone().into(),
    };
    match timeout(CLOSE_TIMEOUT, sender.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close frame not sent: {}", e),
        Err(_) => debug!("Close frame not sent within {:?}, dropping the stream", CLOSE_TIMEOUT),
    }
    (request.code, request.reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::logger::memory_logger;
    use crate::log::{LogSink, MemoryTarget};
    use crate::network::listener::QUEUING_DIRECTIVES;
    use crate::network::protocol::ServerMessage;
    use std::time::Instant;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{client_async, connect_async};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn test_settings() -> Settings {
        Settings {
            listening_port: 0,
            listener_accepted_origins: Some("http://arcade.test".into()),
            matchmaker_needs_queuing: true,
            ..Default::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        console: mpsc::UnboundedSender<String>,
        task: JoinHandle<Result<(), GameServerError>>,
        sink: Arc<LogSink>,
        log: MemoryTarget,
    }

    fn run_server(settings: Settings) -> Running {
        let (logger, sink, log) = memory_logger();
        let mut server = GameServer::new(Arc::new(settings), logger).unwrap();
        let bound = server.bind().unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], bound.port()));

        let (console, console_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { server.run(console_rx).await });
        Running {
            addr,
            console,
            task,
            sink,
            log,
        }
    }

    fn start(
        settings: Settings,
    ) -> (
        SocketAddr,
        mpsc::UnboundedSender<String>,
        JoinHandle<Result<(), GameServerError>>,
    ) {
        let running = run_server(settings);
        (running.addr, running.console, running.task)
    }

    fn request(addr: SocketAddr, origin: &'static str) -> Request {
        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_static(origin));
        request
    }

    async fn next_server_message<S>(stream: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return ServerMessage::from_json(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejection_response_status() {
        let forbidden = rejection_response(AdmissionError::OriginRejected);
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(forbidden.body().as_deref(), Some("Forbidden"));

        let overloaded = rejection_response(AdmissionError::Overloaded);
        assert_eq!(overloaded.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_foreign_origin_rejected_over_socket() {
        let (addr, console, task) = start(test_settings());

        match connect_async(request(addr, "http://elsewhere.test")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            Err(other) => panic!("expected 403, got {other}"),
            Ok(_) => panic!("expected 403, connection was accepted"),
        }

        console.send("stop".into()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_receives_directives_and_pong() {
        let (addr, console, task) = start(test_settings());

        let (mut socket, _) = connect_async(request(addr, "http://arcade.test")).await.unwrap();
        for directive in QUEUING_DIRECTIVES {
            match next_server_message(&mut socket).await {
                ServerMessage::Chat { source, text } => {
                    assert_eq!(source, "SERVER");
                    assert_eq!(text, directive);
                }
                other => panic!("expected directive, got {other:?}"),
            }
        }

        let ping = r#"{"type":"ping","timestamp":42}"#;
        socket.send(Message::Text(ping.into())).await.unwrap();
        match next_server_message(&mut socket).await {
            ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, 42),
            other => panic!("expected pong, got {other:?}"),
        }

        console.send("stop".into()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawned_session_is_ticked() {
        let settings = Settings {
            server_frequency: 50,
            ..test_settings()
        };
        let (addr, console, task) = start(settings);

        let (mut socket, _) = connect_async(request(addr, "http://arcade.test")).await.unwrap();
        let spawn = r#"{"type":"spawn","name":"ogar"}"#;
        socket.send(Message::Text(spawn.into())).await.unwrap();

        loop {
            if let ServerMessage::Tick { tick } = next_server_message(&mut socket).await {
                assert_eq!(tick, 1);
                break;
            }
        }

        console.send("stop".into()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_is_dropped() {
        let settings = Settings {
            listener_max_client_dormancy: 200,
            ..test_settings()
        };
        let running = run_server(settings);

        // Upgrade, then never poll the socket again.
        let stream = TcpStream::connect(running.addr).await.unwrap();
        let (_socket, _) = client_async(request(running.addr, "http://arcade.test"), stream)
            .await
            .unwrap();

        let notice = "x".repeat(64 * 1024);
        for _ in 0..400 {
            running.console.send(format!("say {notice}")).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            running.sink.flush();
            if running.log.contents().contains("[ACCESS] DISCONNECTION FROM") {
                break;
            }
            assert!(Instant::now() < deadline, "unread session was never dropped");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        running.console.send("stop".into()).unwrap();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_idles_without_socket() {
        let idle = timeout(Duration::from_millis(50), accept(None)).await;
        assert!(idle.is_err());

        let socket = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, remote) = accept(Some(socket)).await.unwrap();
        assert_eq!(remote.ip(), addr.ip());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_listener_releases_port() {
        let (logger, _sink, _target) = memory_logger();
        let mut server = GameServer::new(Arc::new(test_settings()), logger).unwrap();
        let addr = server.bind().unwrap();

        server.handle.listener.close();
        assert!(server.handle.listener.socket().is_none());
        std::net::TcpListener::bind(addr).unwrap();
    }
}
