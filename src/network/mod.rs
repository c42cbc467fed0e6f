//! Network Layer
//!
//! WebSocket transport, connection lifecycle and the update loop.
//! Everything that mutates a roster runs on the reactor task.

pub mod listener;
pub mod protocol;
pub mod server;
pub mod session;

pub use listener::{Admission, AdmissionError, ConnectionInfo, Listener};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{GameServer, GameServerError, ListenerEvent};
pub use session::{outlet, CloseRequest, Inbox, Outlet, Session, SessionId};
