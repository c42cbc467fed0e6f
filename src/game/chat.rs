//! Chat Channels
//!
//! A roster of sessions that can be messaged individually or all at once.
//! A session belongs to at most one channel and appears in its roster once.

use std::collections::BTreeMap;

use crate::network::protocol::ServerMessage;
use crate::network::session::{Session, SessionId};

/// Source label for server notices.
pub const SERVER_SOURCE: &str = "SERVER";

/// Channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Wrap a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// Broadcast roster.
pub struct ChatChannel {
    id: ChannelId,
    members: Vec<SessionId>,
}

impl ChatChannel {
    /// Create an empty channel.
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            members: Vec::new(),
        }
    }

    /// Channel identifier.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Members in join order.
    pub fn members(&self) -> &[SessionId] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Is the roster empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Is `session` a member.
    pub fn contains(&self, session: SessionId) -> bool {
        self.members.contains(&session)
    }

    /// Add a session. Refuses sessions already in this or another channel.
    pub fn add(&mut self, session: &mut Session) -> bool {
        if session.channel().is_some() || self.contains(session.id()) {
            return false;
        }
        self.members.push(session.id());
        session.set_channel(Some(self.id));
        true
    }

    /// Remove a session. Does nothing if it is not a member.
    pub fn remove(&mut self, session: &mut Session) -> bool {
        let Some(index) = self.members.iter().position(|id| *id == session.id()) else {
            return false;
        };
        self.members.remove(index);
        if session.channel() == Some(self.id) {
            session.set_channel(None);
        }
        true
    }

    /// Send one line to `to`.
    pub fn direct_message(&self, from: Option<&Session>, to: &Session, text: &str) -> bool {
        to.send(ServerMessage::Chat {
            source: source_label(from),
            text: text.to_string(),
        })
    }

    /// Send one line to every member found in `sessions`. Returns how many
    /// members it reached.
    pub fn broadcast(
        &self,
        from: Option<&Session>,
        text: &str,
        sessions: &BTreeMap<SessionId, Session>,
    ) -> usize {
        let message = ServerMessage::Chat {
            source: source_label(from),
            text: text.to_string(),
        };
        self.members
            .iter()
            .filter_map(|id| sessions.get(id))
            .filter(|member| member.send(message.clone()))
            .count()
    }
}

fn source_label(from: Option<&Session>) -> String {
    from.map(Session::label)
        .unwrap_or_else(|| SERVER_SOURCE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::session::{outlet, Inbox};
    use std::time::Instant;

    fn session(id: u64) -> (Session, Inbox) {
        let (outlet, inbox) = outlet();
        let addr = format!("127.0.0.1:{}", 50000 + id).parse().unwrap();
        (Session::new(SessionId::new(id), addr, outlet, Instant::now()), inbox)
    }

    #[test]
    fn test_add_is_not_duplicated() {
        let mut channel = ChatChannel::new(ChannelId::new(0));
        let (mut a, _rx) = session(1);

        assert!(channel.add(&mut a));
        assert!(!channel.add(&mut a));
        assert_eq!(channel.members(), &[SessionId::new(1)]);
        assert_eq!(a.channel(), Some(ChannelId::new(0)));
    }

    #[test]
    fn test_one_channel_per_session() {
        let mut lobby = ChatChannel::new(ChannelId::new(0));
        let mut arena = ChatChannel::new(ChannelId::new(1));
        let (mut a, _rx) = session(1);

        assert!(lobby.add(&mut a));
        assert!(!arena.add(&mut a));
        assert!(arena.is_empty());

        assert!(lobby.remove(&mut a));
        assert!(arena.add(&mut a));
        assert_eq!(a.channel(), Some(ChannelId::new(1)));
    }

    #[test]
    fn test_remove_absent_leaves_roster_alone() {
        let mut channel = ChatChannel::new(ChannelId::new(0));
        let (mut a, _ra) = session(1);
        let (mut b, _rb) = session(2);
        let (mut c, _rc) = session(3);
        channel.add(&mut a);
        channel.add(&mut b);

        assert!(!channel.remove(&mut c));
        assert_eq!(channel.members(), &[SessionId::new(1), SessionId::new(2)]);

        assert!(channel.remove(&mut a));
        assert!(!channel.remove(&mut a));
        assert_eq!(channel.members(), &[SessionId::new(2)]);
        assert_eq!(a.channel(), None);
    }

    #[test]
    fn test_broadcast_and_direct() {
        let mut channel = ChatChannel::new(ChannelId::new(0));
        let (mut a, mut ra) = session(1);
        let (mut b, mut rb) = session(2);
        channel.add(&mut a);
        channel.add(&mut b);
        a.set_name("alice");

        assert!(channel.direct_message(None, &b, "welcome"));
        assert_eq!(
            rb.messages.try_recv().unwrap(),
            ServerMessage::Chat {
                source: SERVER_SOURCE.into(),
                text: "welcome".into()
            }
        );

        let mut sessions = BTreeMap::new();
        sessions.insert(b.id(), b);
        let reached = channel.broadcast(Some(&a), "hello", &sessions);
        // `a` is not in the map, so only `b` is reached.
        assert_eq!(reached, 1);
        assert!(ra.messages.try_recv().is_err());
        assert_eq!(
            rb.messages.try_recv().unwrap(),
            ServerMessage::Chat {
                source: "alice".into(),
                text: "hello".into()
            }
        );
    }
}
