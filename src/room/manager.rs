//! Registry of active rooms with lazy creation and an inactivity reaper.

use crate::config::Config;
use crate::contents::{ContentsStore, FileIdIndexer};
use crate::events::EventSink;
use crate::room::engine::Room;
use crate::room::{RoomId, GLOBAL_AWARENESS_ROOM_ID};
use crate::ws::protocol::CLOSE_SHUTTING_DOWN;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Creates rooms on demand, tracks inactivity, and restarts rooms to reclaim
/// history memory. One instance per server, owned by the application context.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Room ids that were inactive on the last reaper tick. Two consecutive
    /// inactive ticks restart the room.
    inactive: Mutex<HashSet<String>>,
    contents: Arc<dyn ContentsStore>,
    indexer: Arc<dyn FileIdIndexer>,
    events: EventSink,
    config: Arc<Config>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(
        contents: Arc<dyn ContentsStore>,
        indexer: Arc<dyn FileIdIndexer>,
        events: EventSink,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            inactive: Mutex::new(HashSet::new()),
            contents,
            indexer,
            events,
            config,
            watch_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let interval = manager.config.room_inactivity_interval();
        let watch = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_rooms().await;
            }
        });
        *manager.watch_task.lock() = Some(watch);

        manager
    }

    /// Return the room for an id, creating it when missing. Any lookup also
    /// clears the room's inactivity mark, refreshing its grace period.
    /// Returns `None` when the id is malformed or creation fails.
    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inactive.lock().remove(room_id);

        if let Some(room) = self.rooms.read().get(room_id) {
            return Some(Arc::clone(room));
        }

        let parsed = match RoomId::from_str(room_id) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(room_id, error = %e, "rejecting malformed room id");
                return None;
            }
        };

        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(room_id) {
            return Some(Arc::clone(room));
        }

        tracing::info!(room_id, "initializing room");
        match Room::new(
            parsed,
            Arc::clone(&self.contents),
            Arc::clone(&self.indexer),
            self.events.clone(),
            Arc::clone(&self.config),
        ) {
            Ok(room) => {
                rooms.insert(room_id.to_string(), Arc::clone(&room));
                Some(room)
            }
            Err(e) => {
                tracing::error!(room_id, error = %e, "unable to initialize room");
                None
            }
        }
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Stop and drop a room. Returns `false` when the room was unknown or
    /// failed to stop cleanly.
    pub async fn delete_room(&self, room_id: &str) -> bool {
        let room = { self.rooms.write().remove(room_id) };
        let Some(room) = room else {
            return false;
        };
        self.inactive.lock().remove(room_id);

        tracing::info!(room_id, "stopping room");
        room.stop(CLOSE_SHUTTING_DOWN, false).await;
        true
    }

    /// One reaper pass over all rooms except the global awareness room.
    async fn check_rooms(&self) {
        let rooms: Vec<(String, Arc<Room>)> = {
            self.rooms
                .read()
                .iter()
                .filter(|(id, _)| id.as_str() != GLOBAL_AWARENESS_ROOM_ID)
                .map(|(id, room)| (id.clone(), Arc::clone(room)))
                .collect()
        };

        for (room_id, room) in rooms {
            self.check_room(&room_id, &room).await;
        }
    }

    /// A room is inactive iff it has no clients, its kernel is idle, dead or
    /// absent, and its CRDT holds history worth freeing. The first inactive
    /// tick marks it; the second restarts it.
    async fn check_room(&self, room_id: &str, room: &Arc<Room>) {
        if room.clients().count() != 0 {
            self.inactive.lock().remove(room_id);
            return;
        }

        if let Some(execution_state) = room.kernel_execution_state() {
            if execution_state != "idle" && execution_state != "dead" {
                // The kernel may still be running cells; leave the room be.
                self.inactive.lock().remove(room_id);
                return;
            }
        }

        if !room.updated() {
            // Nothing to free; un-updated rooms are not restarted.
            self.inactive.lock().remove(room_id);
            return;
        }

        let second_strike = { self.inactive.lock().contains(room_id) };
        if second_strike {
            tracing::info!(
                room_id,
                "restarting inactive room to free its document history"
            );
            room.restart(CLOSE_SHUTTING_DOWN, false).await;
            self.inactive.lock().remove(room_id);
        } else {
            self.inactive.lock().insert(room_id.to_string());
        }
    }

    /// Cancel background tasks and delete every room, logging the aggregate
    /// outcome.
    pub async fn stop(&self) {
        if let Some(watch) = self.watch_task.lock().take() {
            watch.abort();
        }

        let room_ids: Vec<String> = { self.rooms.read().keys().cloned().collect() };
        let room_count = room_ids.len();
        if room_count == 0 {
            return;
        }

        tracing::info!(room_count, "stopping room manager and deleting all rooms");
        let mut failures = 0usize;
        for room_id in room_ids {
            if !self.delete_room(&room_id).await {
                failures += 1;
            }
        }

        if failures > 0 {
            tracing::error!(
                failures,
                room_count,
                "exceptions were raised while stopping rooms"
            );
        } else {
            tracing::info!(room_count, "stopped room manager and deleted all rooms");
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        if let Some(watch) = self.watch_task.lock().take() {
            watch.abort();
        }
    }
}
