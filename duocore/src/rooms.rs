use crate::types::message::Message;
use crate::types::room::RoomId;
use crate::types::user::{Contact, UserId};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// Per-room ordered message cache plus the active-room pointer.
///
/// Order within a room is arrival order at the registry. Nothing here sorts
/// by timestamp or sender.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Vec<Message>>,
    active: Option<RoomId>,
    history_loaded: HashSet<RoomId>,
    contacts: HashMap<UserId, String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `room_id` the active room, creating it if needed.
    ///
    /// Returns `true` when no authoritative snapshot has been received for the
    /// room yet, meaning history should be requested from the relay. Other
    /// cached rooms are left untouched.
    pub fn join_room(&mut self, room_id: RoomId) -> bool {
        self.rooms.entry(room_id.clone()).or_default();
        let needs_history = !self.history_loaded.contains(&room_id);
        debug!(target: "Rooms", "Joined {room_id} (history needed: {needs_history})");
        self.active = Some(room_id);
        needs_history
    }

    /// Replaces the room's sequence with the relay's snapshot, minus any
    /// malformed entries. Returns how many messages were kept.
    pub fn on_history(&mut self, room_id: RoomId, messages: Vec<Message>) -> usize {
        let received = messages.len();
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| {
                let ok = m.is_well_formed();
                if !ok {
                    warn!(target: "Rooms", "Dropping malformed history entry in {room_id} from {}", m.sender_id);
                }
                ok
            })
            .collect();
        let kept = messages.len();
        debug!(target: "Rooms", "History for {room_id}: {kept} of {received} messages");
        self.history_loaded.insert(room_id.clone());
        self.rooms.insert(room_id, messages);
        kept
    }

    /// Appends a message to its room, whether or not that room is active.
    ///
    /// Returns `false` if the message was dropped, either because it breaks the
    /// text-xor-attachment rule or because a message with the same id is
    /// already in the room.
    pub fn on_message_received(&mut self, room_id: RoomId, message: Message) -> bool {
        if !message.is_well_formed() {
            warn!(target: "Rooms", "Dropping malformed message in {room_id} from {}", message.sender_id);
            return false;
        }
        let seq = self.rooms.entry(room_id.clone()).or_default();
        if let Some(id) = message.id.as_deref()
            && seq.iter().any(|m| m.id.as_deref() == Some(id))
        {
            debug!(target: "Rooms", "Ignoring redelivered message {id} in {room_id}");
            return false;
        }
        seq.push(message);
        true
    }

    pub fn active_room(&self) -> Option<&RoomId> {
        self.active.as_ref()
    }

    /// Snapshot of a room's messages. Empty for unknown rooms.
    pub fn messages(&self, room_id: &RoomId) -> Vec<Message> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub fn message_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, Vec::len)
    }

    pub fn has_room(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn set_contacts(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        self.contacts = contacts
            .into_iter()
            .map(|c| (c.id, c.display_name))
            .collect();
    }

    /// Resolves a sender to its directory name, falling back to the raw id.
    pub fn display_name(&self, user: &UserId) -> String {
        self.contacts
            .get(user)
            .cloned()
            .unwrap_or_else(|| user.to_string())
    }
}
