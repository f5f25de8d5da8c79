//! Board rooms and event fan-out.
//!
//! Each realtime connection registers once and gets an unbounded queue; rooms
//! map a board to the connections that joined it. Publishing assigns the
//! board's next sequence number and pushes the envelope onto every member's
//! queue, so two events on one board reach every member in publish order.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use shared::{
    domain::BoardId,
    protocol::{BoardEnvelope, BoardEvent, ServerMessage},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    rooms: HashMap<BoardId, HashSet<ConnectionId>>,
    next_seq: HashMap<BoardId, u64>,
}

#[derive(Default)]
pub struct BoardHub {
    state: Mutex<HubState>,
}

impl BoardHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection. The receiver yields everything addressed to it.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId(Uuid::new_v4());
        self.state().connections.insert(id, tx);
        (id, rx)
    }

    /// Drops the connection and its room memberships.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.state();
        state.connections.remove(&connection);
        state.rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    /// Returns false if the connection is unknown (already disconnected).
    pub fn join(&self, connection: ConnectionId, board_id: BoardId) -> bool {
        let mut state = self.state();
        if !state.connections.contains_key(&connection) {
            return false;
        }
        state.rooms.entry(board_id).or_default().insert(connection);
        true
    }

    pub fn leave(&self, connection: ConnectionId, board_id: BoardId) -> bool {
        let mut state = self.state();
        let Some(members) = state.rooms.get_mut(&board_id) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            state.rooms.remove(&board_id);
        }
        removed
    }

    /// Sends a control message to one connection.
    pub fn send_to(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        let state = self.state();
        state
            .connections
            .get(&connection)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Publishes `event` to every connection in the board's room and returns
    /// the envelope that was delivered.
    pub fn publish(&self, board_id: BoardId, event: BoardEvent) -> BoardEnvelope {
        let mut state = self.state();
        let seq = {
            let next = state.next_seq.entry(board_id).or_insert(1);
            let seq = *next;
            *next += 1;
            seq
        };
        let envelope = BoardEnvelope {
            board_id,
            seq,
            event,
        };

        let members: Vec<ConnectionId> = state
            .rooms
            .get(&board_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        let mut closed = Vec::new();
        for member in &members {
            let delivered = state
                .connections
                .get(member)
                .is_some_and(|tx| tx.send(ServerMessage::BoardEvent(envelope.clone())).is_ok());
            if !delivered {
                closed.push(*member);
            }
        }
        for member in closed {
            state.connections.remove(&member);
            if let Some(room) = state.rooms.get_mut(&board_id) {
                room.remove(&member);
            }
        }
        debug!(
            board_id = board_id.0,
            seq,
            recipients = members.len(),
            "published board event"
        );
        envelope
    }

    /// Sequence number of the last event published to the board, 0 if none.
    pub fn current_seq(&self, board_id: BoardId) -> u64 {
        self.state()
            .next_seq
            .get(&board_id)
            .map_or(0, |next| next - 1)
    }

    /// Empties the room after its board is gone. Sequence numbering is kept
    /// so late readers never see a counter restart.
    pub fn close_room(&self, board_id: BoardId) {
        self.state().rooms.remove(&board_id);
    }

    pub fn room_size(&self, board_id: BoardId) -> usize {
        self.state().rooms.get(&board_id).map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
