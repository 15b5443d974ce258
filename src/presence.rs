//! Online roster and per-room typing indicators.
//!
//! Every room owns its own timers: remote typing entries each carry an
//! expiry task, and the local user's debounce state keeps a separate quiet
//! timer per room.

use crate::config::TypingConfig;
use dashmap::DashMap;
use duocore::net::{DeliveryError, EventSink};
use duocore::protocol::OutboundEvent;
use duocore::{CoreEventBus, Event, RoomId, UserId};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

struct TypingEntry {
    deadline: Instant,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct LocalTyping {
    active: bool,
    last_sent: Option<Instant>,
    quiet_timer: Option<JoinHandle<()>>,
    /// Identifies the current quiet timer so a superseded one is a no-op.
    epoch: u64,
}

#[derive(Default)]
struct RoomPresence {
    typing: HashMap<UserId, TypingEntry>,
    local: LocalTyping,
}

impl RoomPresence {
    fn typing_now(&self, now: Instant) -> Vec<UserId> {
        let mut ids: Vec<_> = self
            .typing
            .iter()
            .filter(|(_, entry)| entry.deadline > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

pub struct PresenceTracker {
    self_id: UserId,
    config: TypingConfig,
    sink: Arc<dyn EventSink>,
    event_bus: CoreEventBus,
    online: RwLock<Vec<UserId>>,
    rooms: DashMap<RoomId, RoomPresence>,
}

impl PresenceTracker {
    pub fn new(
        self_id: UserId,
        config: TypingConfig,
        sink: Arc<dyn EventSink>,
        event_bus: CoreEventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            config,
            sink,
            event_bus,
            online: RwLock::new(Vec::new()),
            rooms: DashMap::new(),
        })
    }

    /// Replaces the online set wholesale.
    pub fn on_presence_snapshot(&self, ids: Vec<UserId>) {
        let mut unique = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        *self.online.write().expect("RwLock should not be poisoned") = unique.clone();
        self.event_bus
            .dispatch(&Event::PresenceChanged { online: unique });
    }

    pub fn online(&self) -> Vec<UserId> {
        self.online
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        self.online
            .read()
            .expect("RwLock should not be poisoned")
            .contains(id)
    }

    /// Forgets the roster, e.g. after the connection drops.
    pub fn clear_online(&self) {
        let was_empty = {
            let mut online = self.online.write().expect("RwLock should not be poisoned");
            let was_empty = online.is_empty();
            online.clear();
            was_empty
        };
        if !was_empty {
            self.event_bus
                .dispatch(&Event::PresenceChanged { online: Vec::new() });
        }
    }

    /// Who is typing in `room_id` right now.
    pub fn typing_in(&self, room_id: &RoomId) -> Vec<UserId> {
        self.rooms
            .get(room_id)
            .map(|room| room.typing_now(Instant::now()))
            .unwrap_or_default()
    }

    /// Applies a remote typing signal. `is_typing=true` (re)starts the
    /// entry's expiry timer.
    pub fn on_typing(self: &Arc<Self>, room_id: RoomId, user_id: UserId, is_typing: bool) {
        if user_id == self.self_id {
            return;
        }

        let typing = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            let changed = if is_typing {
                let deadline = Instant::now() + self.config.expiry;
                let expiry = tokio::spawn(expire_after(
                    Arc::downgrade(self),
                    room_id.clone(),
                    user_id.clone(),
                    deadline,
                ));
                match room.typing.insert(user_id.clone(), TypingEntry { deadline, expiry }) {
                    Some(previous) => {
                        previous.expiry.abort();
                        false
                    }
                    None => true,
                }
            } else {
                match room.typing.remove(&user_id) {
                    Some(entry) => {
                        entry.expiry.abort();
                        true
                    }
                    None => false,
                }
            };
            changed.then(|| room.typing_now(Instant::now()))
        };

        if let Some(typing) = typing {
            debug!(target: "Presence", "Typing in {room_id}: {typing:?}");
            self.event_bus
                .dispatch(&Event::TypingChanged { room_id, typing });
        }
    }

    /// A message from `sender` ends their typing indicator in that room.
    pub fn on_message_from(self: &Arc<Self>, room_id: &RoomId, sender: &UserId) {
        let typing = self
            .rooms
            .get(room_id)
            .is_some_and(|room| room.typing.contains_key(sender));
        if typing {
            self.on_typing(room_id.clone(), sender.clone(), false);
        }
    }

    /// Clears the typing set of `room_id`, as on joining it.
    pub fn reset_room(&self, room_id: &RoomId) {
        let had_entries = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                let had_entries = !room.typing.is_empty();
                for (_, entry) in room.typing.drain() {
                    entry.expiry.abort();
                }
                had_entries
            }
            None => false,
        };
        if had_entries {
            self.event_bus.dispatch(&Event::TypingChanged {
                room_id: room_id.clone(),
                typing: Vec::new(),
            });
        }
    }

    fn expire(&self, room_id: &RoomId, user_id: &UserId, deadline: Instant) {
        let typing = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return;
            };
            if room
                .typing
                .get(user_id)
                .is_none_or(|entry| entry.deadline != deadline)
            {
                return;
            }
            room.typing.remove(user_id);
            room.typing_now(Instant::now())
        };
        debug!(target: "Presence", "Typing entry for {user_id} in {room_id} expired");
        self.event_bus.dispatch(&Event::TypingChanged {
            room_id: room_id.clone(),
            typing,
        });
    }

    /// Reports a local keystroke (`true`) or an explicit stop (`false`).
    ///
    /// While typing continues, `isTyping=true` is re-sent only once per
    /// refresh interval. After the quiet period without keystrokes,
    /// `isTyping=false` is sent automatically.
    pub async fn emit_local_typing(
        self: &Arc<Self>,
        room_id: &RoomId,
        is_typing: bool,
    ) -> Result<(), DeliveryError> {
        let now = Instant::now();
        let send = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            let local = &mut room.local;
            if let Some(timer) = local.quiet_timer.take() {
                timer.abort();
            }
            local.epoch += 1;

            if is_typing {
                local.quiet_timer = Some(tokio::spawn(quiet_after(
                    Arc::downgrade(self),
                    room_id.clone(),
                    local.epoch,
                    self.config.quiet_period,
                )));
                let due = !local.active
                    || local
                        .last_sent
                        .is_none_or(|at| now.duration_since(at) >= self.config.refresh_interval);
                if due {
                    local.active = true;
                    local.last_sent = Some(now);
                }
                due
            } else {
                let was_active = local.active;
                local.active = false;
                local.last_sent = None;
                was_active
            }
        };

        if send {
            self.send_typing(room_id, is_typing).await?;
        }
        Ok(())
    }

    async fn quiet_elapsed(&self, room_id: &RoomId, epoch: u64) {
        let stop = match self.rooms.get_mut(room_id) {
            Some(mut room) if room.local.epoch == epoch => {
                room.local.quiet_timer = None;
                let was_active = room.local.active;
                room.local.active = false;
                room.local.last_sent = None;
                was_active
            }
            _ => false,
        };
        if stop {
            if let Err(e) = self.send_typing(room_id, false).await {
                warn!(target: "Presence", "Failed to send typing stop for {room_id}: {e}");
            }
        }
    }

    async fn send_typing(&self, room_id: &RoomId, is_typing: bool) -> Result<(), DeliveryError> {
        self.sink
            .send_event(OutboundEvent::Typing {
                room_id: room_id.clone(),
                user_id: self.self_id.clone(),
                is_typing,
            })
            .await
    }
}

async fn expire_after(
    tracker: Weak<PresenceTracker>,
    room_id: RoomId,
    user_id: UserId,
    deadline: Instant,
) {
    sleep_until(deadline).await;
    if let Some(tracker) = tracker.upgrade() {
        tracker.expire(&room_id, &user_id, deadline);
    }
}

async fn quiet_after(
    tracker: Weak<PresenceTracker>,
    room_id: RoomId,
    epoch: u64,
    quiet_period: std::time::Duration,
) {
    sleep(quiet_period).await;
    if let Some(tracker) = tracker.upgrade() {
        tracker.quiet_elapsed(&room_id, epoch).await;
    }
}
