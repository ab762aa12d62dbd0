//! Rendezvous relay for peer transport negotiation.
//!
//! The relay never looks inside a payload. It only decides who receives
//! `{from, data}`: one named target, or every other member of the room.
//! Anything it cannot route is dropped silently and logged at debug level;
//! the initiating peer retries negotiation on its own.

use log::debug;

use crate::broadcast::Audience;
use crate::protocol::ConnectionId;
use crate::room::Room;

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRoute {
    /// Sender's persistent identity, stamped on the forwarded payload
    pub from: String,
    pub audience: Audience,
}

#[derive(Debug, Clone)]
pub struct SignalingRelay {
    max_payload: usize,
}

impl SignalingRelay {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Route a payload from `sender`. Returns `None` when it must be dropped.
    pub fn route(
        &self,
        room: &Room,
        sender: ConnectionId,
        target: Option<&str>,
        payload_len: usize,
    ) -> Option<SignalRoute> {
        if payload_len == 0 || payload_len > self.max_payload {
            debug!(
                "room {}: dropping signal of {} bytes from {}",
                room.id(),
                payload_len,
                sender
            );
            return None;
        }
        let Some(from) = room.identity_of(sender) else {
            debug!("room {}: signal from non-member {}", room.id(), sender);
            return None;
        };

        let audience = match target {
            None => Audience::AllExcept(sender),
            Some(identity) => match room.connection_of(identity) {
                Some(conn) if conn != sender => Audience::Only(conn),
                _ => {
                    debug!("room {}: signal target {} not connected", room.id(), identity);
                    return None;
                }
            },
        };
        Some(SignalRoute {
            from: from.to_string(),
            audience,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::protocol::{JoinOptions, RoomOptions};

    fn room_with(members: &[&str]) -> (Room, Vec<ConnectionId>) {
        let cfg = RegistryConfig::default();
        let options = RoomOptions {
            max_players: Some(members.len() as u32),
            ..Default::default()
        };
        let mut room = Room::new("r1", options, &cfg);
        let conns = members
            .iter()
            .map(|guid| {
                let request = JoinOptions::player(*guid, *guid);
                let admission = room.admit(&request, &cfg).unwrap();
                let conn = ConnectionId::new();
                room.apply(admission, conn, &request);
                conn
            })
            .collect();
        (room, conns)
    }

    #[test]
    fn test_untargeted_goes_to_others() {
        let (room, conns) = room_with(&["a", "b", "c"]);
        let relay = SignalingRelay::new(1024);
        let route = relay.route(&room, conns[0], None, 10).unwrap();
        assert_eq!(route.from, "a");
        assert_eq!(route.audience, Audience::AllExcept(conns[0]));
    }

    #[test]
    fn test_targeted_goes_to_one() {
        let (room, conns) = room_with(&["a", "b"]);
        let relay = SignalingRelay::new(1024);
        let route = relay.route(&room, conns[0], Some("b"), 10).unwrap();
        assert_eq!(route.audience, Audience::Only(conns[1]));
    }

    #[test]
    fn test_drops_unroutable() {
        let (room, conns) = room_with(&["a", "b"]);
        let relay = SignalingRelay::new(16);
        assert!(relay.route(&room, conns[0], None, 0).is_none());
        assert!(relay.route(&room, conns[0], None, 17).is_none());
        assert!(relay.route(&room, conns[0], Some("zed"), 4).is_none());
        assert!(relay.route(&room, conns[0], Some("a"), 4).is_none());
        assert!(relay.route(&room, ConnectionId::new(), None, 4).is_none());
    }
}
