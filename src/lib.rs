//! # Arcade Server
//!
//! Runtime core of a real-time multiplayer arcade game server reached over
//! WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ARCADE SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  log/            - Ordered, crash-consistent event log       │
//! │  ├── record.rs   - Levels, visibility masks, line formats    │
//! │  ├── sink.rs     - Serialized writer and terminal flush      │
//! │  ├── logger.rs   - Producer handle                           │
//! │  └── layer.rs    - tracing bridge                            │
//! │                                                              │
//! │  game/           - Collaborators driven by the listener      │
//! │  ├── chat.rs     - Chat channel rosters                      │
//! │  ├── router.rs   - Playing routers                           │
//! │  └── matchmaker.rs - Queue matchmaking                       │
//! │                                                              │
//! │  network/        - Transport and connection lifecycle        │
//! │  ├── listener.rs - Verification, routing, update loop        │
//! │  ├── server.rs   - Reactor and connection tasks              │
//! │  ├── session.rs  - Client sessions                           │
//! │  └── protocol.rs - JSON message types                        │
//! │                                                              │
//! │  config.rs       - Settings file                             │
//! │  commands.rs     - Operator console commands                 │
//! │  supervisor.rs   - Fault boundary and exit code              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantees
//!
//! - Log records reach the file in `write()` call order, with at most one
//!   write in flight.
//! - A fault flushes every accepted record synchronously before exit.
//! - Each update visits every live playing router exactly once, even when
//!   routers disconnect during the scan.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod commands;
pub mod config;
pub mod game;
pub mod handle;
pub mod log;
pub mod network;
pub mod supervisor;

// Re-export commonly used types
pub use commands::{Command, CommandError, CommandList};
pub use config::{ConfigError, Settings};
pub use handle::ServerHandle;
pub use log::{Logger, LogLevel, LogSink, SinkLayer};
pub use network::{GameServer, GameServerError, Listener};
pub use supervisor::{install_panic_hook, supervise};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
