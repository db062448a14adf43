//! Sessions and broadcast routing — who is connected, where they are on the
//! island grid, and which connections an outbound message fans out to.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::warn;

use reefworld_core::protocol::ServerMessage;
use reefworld_core::types::{GridCell, Lobster, Role};
use reefworld_core::world::WorldState;

/// Ephemeral per-connection state. Never persisted; the durable side of an
/// agent lives in the world aggregate under its persistent id.
#[derive(Debug)]
pub struct Session {
    pub connection_id: String,
    pub role: Option<Role>,
    pub persistent_id: Option<String>,
    pub display_name: String,
    pub verified: bool,
    pub grid_cell: GridCell,
    pub connected_at: i64,
    pub outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    pub fn new(
        connection_id: String,
        connected_at: i64,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            connection_id,
            role: None,
            persistent_id: None,
            display_name: String::new(),
            verified: false,
            grid_cell: GridCell::default(),
            connected_at,
            outbox,
        }
    }

    pub fn is_agent(&self) -> bool {
        self.role == Some(Role::Agent)
    }

    pub fn is_observer(&self) -> bool {
        self.role == Some(Role::Observer)
    }
}

/// Everything behind the server's single state lock: the world aggregate,
/// the session map, and the live entities. Mutations never await while this
/// is held, so they interleave only at message boundaries.
pub struct Shared {
    pub world: WorldState,
    pub sessions: HashMap<String, Session>,
    /// Live lobsters keyed by connection id. Last-known positions live in
    /// the world aggregate keyed by persistent id.
    pub lobsters: HashMap<String, Lobster>,
}

impl Shared {
    pub fn new(world: WorldState) -> Self {
        Self {
            world,
            sessions: HashMap::new(),
            lobsters: HashMap::new(),
        }
    }

    pub fn agents(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.is_agent())
    }

    pub fn agent_count(&self) -> usize {
        self.agents().count()
    }

    pub fn observer_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_observer()).count()
    }

    /// Find a connected agent by connection id or (case-insensitive) name.
    pub fn find_agent(&self, target: &str) -> Option<&Session> {
        if let Some(session) = self.sessions.get(target).filter(|s| s.is_agent()) {
            return Some(session);
        }
        self.agents()
            .find(|s| s.display_name.eq_ignore_ascii_case(target))
    }
}

/// Where an outbound message goes. Resolution happens against the
/// just-mutated state, so there is no stale-read window.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One connection.
    Conn(String),
    /// Every connected session.
    All,
    /// Every observer.
    Observers,
    /// Every agent except the sender, plus every observer. World chat.
    AllAgentsExcept(String),
    /// Agents within the broadcast radius of the origin cell (sender
    /// excluded), plus every observer. Observers always see everything.
    Nearby { origin: GridCell, exclude: String },
    /// Members of a channel, optionally excluding the sender.
    Channel {
        name: String,
        exclude: Option<String>,
    },
}

/// Resolve a target to connection ids against the current session map.
pub fn recipients(shared: &Shared, target: &Target) -> Vec<String> {
    match target {
        Target::Conn(id) => {
            if shared.sessions.contains_key(id) {
                vec![id.clone()]
            } else {
                Vec::new()
            }
        }
        Target::All => shared.sessions.keys().cloned().collect(),
        Target::Observers => shared
            .sessions
            .values()
            .filter(|s| s.is_observer())
            .map(|s| s.connection_id.clone())
            .collect(),
        Target::AllAgentsExcept(sender) => shared
            .sessions
            .values()
            .filter(|s| {
                (s.is_observer()) || (s.is_agent() && s.connection_id != *sender)
            })
            .map(|s| s.connection_id.clone())
            .collect(),
        Target::Nearby { origin, exclude } => shared
            .sessions
            .values()
            .filter(|s| {
                s.is_observer()
                    || (s.is_agent()
                        && s.connection_id != *exclude
                        && s.grid_cell.is_near(origin))
            })
            .map(|s| s.connection_id.clone())
            .collect(),
        Target::Channel { name, exclude } => shared
            .world
            .channels
            .get(name)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| exclude.as_deref() != Some(id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Fan a batch of messages out through the per-session outboxes. Sends are
/// non-blocking; a closed outbox just means that session is tearing down.
pub fn deliver(shared: &Shared, messages: Vec<(Target, ServerMessage)>) {
    for (target, message) in messages {
        for connection_id in recipients(shared, &target) {
            if let Some(session) = shared.sessions.get(&connection_id) {
                if session.outbox.send(message.clone()).is_err() {
                    warn!("Outbox closed for {}", connection_id);
                }
            }
        }
    }
}

/// Random unguessable connection id, `c_` + 13 lowercase alphanumerics.
pub fn generate_connection_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(13)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("c_{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_session(
        shared: &mut Shared,
        id: &str,
        role: Role,
        name: &str,
        cell: (i64, i64),
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Session::new(id.to_string(), 0, tx);
        session.role = Some(role);
        session.display_name = name.to_string();
        session.persistent_id = Some(format!("pid-{}", name));
        session.grid_cell = GridCell {
            x: cell.0,
            z: cell.1,
        };
        shared.sessions.insert(id.to_string(), session);
        rx
    }

    #[test]
    fn test_connection_id_shape() {
        let id = generate_connection_id();
        assert!(id.starts_with("c_"));
        assert_eq!(id.len(), 15);
        assert!(id[2..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_connection_id());
    }

    #[test]
    fn test_find_agent_by_id_or_name() {
        let mut shared = Shared::new(WorldState::default());
        let _rx = add_session(&mut shared, "c_1", Role::Agent, "Pincers", (0, 0));
        let _rx2 = add_session(&mut shared, "c_2", Role::Observer, "Observer_1234", (0, 0));

        assert!(shared.find_agent("c_1").is_some());
        assert!(shared.find_agent("pincers").is_some());
        // Observers are never whisper/friend targets.
        assert!(shared.find_agent("c_2").is_none());
        assert!(shared.find_agent("nobody").is_none());
    }

    #[test]
    fn test_nearby_excludes_sender_and_far_agents() {
        let mut shared = Shared::new(WorldState::default());
        let _a = add_session(&mut shared, "c_a", Role::Agent, "A", (0, 0));
        let _c = add_session(&mut shared, "c_c", Role::Agent, "C", (1, 1));
        let _b = add_session(&mut shared, "c_b", Role::Agent, "B", (5, 5));
        let _o = add_session(&mut shared, "c_o", Role::Observer, "O", (0, 0));

        let mut ids = recipients(
            &shared,
            &Target::Nearby {
                origin: GridCell { x: 0, z: 0 },
                exclude: "c_a".to_string(),
            },
        );
        ids.sort();
        // Adjacent agent and the observer; neither the sender nor the
        // far-away agent.
        assert_eq!(ids, vec!["c_c".to_string(), "c_o".to_string()]);
    }

    #[test]
    fn test_world_chat_reaches_all_but_sender() {
        let mut shared = Shared::new(WorldState::default());
        let _a = add_session(&mut shared, "c_a", Role::Agent, "A", (0, 0));
        let _b = add_session(&mut shared, "c_b", Role::Agent, "B", (9, 9));
        let _o = add_session(&mut shared, "c_o", Role::Observer, "O", (0, 0));

        let mut ids = recipients(&shared, &Target::AllAgentsExcept("c_a".to_string()));
        ids.sort();
        assert_eq!(ids, vec!["c_b".to_string(), "c_o".to_string()]);
    }

    #[test]
    fn test_channel_target_uses_membership() {
        let mut shared = Shared::new(WorldState::default());
        let _a = add_session(&mut shared, "c_a", Role::Agent, "A", (0, 0));
        let _b = add_session(&mut shared, "c_b", Role::Agent, "B", (0, 0));
        shared.world.join_channel("reef", "c_a");
        shared.world.join_channel("reef", "c_b");

        let ids = recipients(
            &shared,
            &Target::Channel {
                name: "reef".to_string(),
                exclude: Some("c_a".to_string()),
            },
        );
        assert_eq!(ids, vec!["c_b".to_string()]);
    }

    #[test]
    fn test_deliver_reaches_outboxes() {
        let mut shared = Shared::new(WorldState::default());
        let mut rx_a = add_session(&mut shared, "c_a", Role::Agent, "A", (0, 0));
        let mut rx_o = add_session(&mut shared, "c_o", Role::Observer, "O", (0, 0));

        deliver(
            &shared,
            vec![(Target::All, ServerMessage::AgentCount { count: 1 })],
        );
        assert!(matches!(
            rx_a.try_recv(),
            Ok(ServerMessage::AgentCount { count: 1 })
        ));
        assert!(matches!(
            rx_o.try_recv(),
            Ok(ServerMessage::AgentCount { count: 1 })
        ));
    }
}
