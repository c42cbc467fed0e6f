//! Game Collaborators
//!
//! The pieces the listener drives but does not own the rules of.
//!
//! ## Module Structure
//!
//! - `chat`: Chat channel rosters and messaging
//! - `router`: Playing routers ticked by the update loop
//! - `matchmaker`: Promotion of waiting sessions into play

pub mod chat;
pub mod matchmaker;
pub mod router;

// Re-export key types
pub use chat::{ChannelId, ChatChannel};
pub use matchmaker::{Matchmaker, QueueMatchmaker};
pub use router::{PlayerRouter, PlayingRouter, RouterId};
