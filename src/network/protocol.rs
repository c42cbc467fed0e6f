//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Say something in the current chat channel.
    Chat {
        /// Message text.
        text: String,
    },

    /// Ask to be queued for play.
    Spawn {
        /// Display name to play under.
        #[serde(default)]
        name: Option<String>,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Chat line, direct or broadcast.
    Chat {
        /// Who said it (`SERVER` for server notices).
        source: String,
        /// Message text.
        text: String,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (unix millis).
        server_time: u64,
    },

    /// Gameplay tick for a playing session.
    Tick {
        /// Ticks since the session entered play.
        tick: u64,
    },
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
