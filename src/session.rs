//! Session binder: maintains the session → room → kernel-client edges and
//! repairs them on lookup.

use crate::contents::FileIdIndexer;
use crate::error::{Error, Result};
use crate::kernel::KernelRegistry;
use crate::room::{RoomId, RoomManager};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub session_type: String,
    pub kernel_id: Option<String>,
    pub kernel_name: Option<String>,
}

/// The persistent session rows the binder sits on top of. The store outlives
/// the in-memory room/kernel edges, which is exactly why `get_session` has to
/// heal them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: SessionModel) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionModel>>;
    async fn set_kernel(&self, session_id: &str, kernel_id: Option<String>) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionModel>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: SessionModel) -> Result<()> {
        self.sessions.lock().insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionModel>> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn set_kernel(&self, session_id: &str, kernel_id: Option<String>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("unknown session '{session_id}'")))?;
        session.kernel_id = kernel_id;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

/// Binds logical notebook sessions to rooms and kernel clients.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    rooms: Arc<RoomManager>,
    kernels: Arc<KernelRegistry>,
    indexer: Arc<dyn FileIdIndexer>,
    /// Room ids keyed by session id.
    room_ids: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        rooms: Arc<RoomManager>,
        kernels: Arc<KernelRegistry>,
        indexer: Arc<dyn FileIdIndexer>,
    ) -> Self {
        Self {
            store,
            rooms,
            kernels,
            indexer,
            room_ids: Mutex::new(HashMap::new()),
        }
    }

    fn room_id_for_path(&self, path: &str) -> String {
        let file_id = self.indexer.index(path);
        RoomId::notebook(file_id).to_string()
    }

    /// Create a session. For notebooks the room is created and its awareness
    /// kernel state set to "starting" before the kernel is actually started;
    /// the room is then bound to the kernel's client.
    pub async fn create_session(
        &self,
        path: &str,
        name: Option<&str>,
        session_type: &str,
        kernel_name: Option<&str>,
        kernel_id: Option<String>,
    ) -> Result<SessionModel> {
        let is_notebook = session_type == "notebook";

        let room = if is_notebook {
            let room_id = self.room_id_for_path(path);
            let room = self.rooms.get_room(&room_id).ok_or_else(|| {
                Error::NotFound(format!("unable to create room '{room_id}' for '{path}'"))
            })?;
            room.set_awareness_field("kernel", json!({"execution_state": "starting"}));
            Some(room)
        } else {
            tracing::warn!(session_type, "session type has no collaborative room");
            None
        };

        let kernel_id = match kernel_id {
            Some(kernel_id) => kernel_id,
            None => self.kernels.start_kernel(None).await?,
        };

        let session = SessionModel {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            name: name.map(str::to_string),
            session_type: session_type.to_string(),
            kernel_id: Some(kernel_id.clone()),
            kernel_name: kernel_name.map(str::to_string),
        };
        self.store.insert(session.clone()).await?;

        if let Some(room) = room {
            self.room_ids
                .lock()
                .insert(session.id.clone(), room.room_id_str().to_string());
            if let Some(bridge) = self.kernels.get(&kernel_id) {
                bridge.add_room(room);
            } else {
                tracing::warn!(kernel_id = %kernel_id, "no kernel client to bind the room to");
            }
        }

        Ok(session)
    }

    /// Fetch a session and verify the room is still bound to its kernel
    /// client, re-adding it when the in-memory edge was lost (e.g. after a
    /// server restart with persistent sessions).
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionModel>> {
        let Some(session) = self.store.get(session_id).await? else {
            return Ok(None);
        };
        self.ensure_room_connected(&session);
        Ok(Some(session))
    }

    fn ensure_room_connected(&self, session: &SessionModel) {
        if session.session_type != "notebook" {
            return;
        }
        let Some(kernel_id) = &session.kernel_id else {
            return;
        };

        // Repopulate the room id from the session path if the cache is cold.
        let room_id = {
            let mut room_ids = self.room_ids.lock();
            match room_ids.get(&session.id) {
                Some(room_id) => room_id.clone(),
                None => {
                    let room_id = self.room_id_for_path(&session.path);
                    room_ids.insert(session.id.clone(), room_id.clone());
                    room_id
                }
            }
        };

        let Some(bridge) = self.kernels.get(kernel_id) else {
            return;
        };
        if bridge.has_room(&room_id) {
            return;
        }
        let Some(room) = self.rooms.get_room(&room_id) else {
            return;
        };
        tracing::info!(
            session_id = %session.id,
            room_id = %room_id,
            kernel_id = %kernel_id,
            "reconnected room to kernel client"
        );
        bridge.add_room(room);
    }

    /// The room bound to a session, if any.
    pub fn get_room(&self, session_id: &str) -> Result<Arc<crate::room::Room>> {
        let room_id = self
            .room_ids
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no room for session '{session_id}'")))?;
        self.rooms
            .get_room(&room_id)
            .ok_or_else(|| Error::NotFound(format!("no room for session '{session_id}'")))
    }

    /// Move the session to a different kernel, rebinding the room.
    pub async fn update_session_kernel(&self, session_id: &str, kernel_id: Option<String>) -> Result<()> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown session '{session_id}'")))?;

        if session.kernel_id == kernel_id {
            return Ok(());
        }
        tracing::info!(
            session_id,
            old_kernel = ?session.kernel_id,
            new_kernel = ?kernel_id,
            "moving session between kernels"
        );

        if let Ok(room) = self.get_room(session_id) {
            if let Some(old_kernel_id) = &session.kernel_id {
                if let Some(bridge) = self.kernels.get(old_kernel_id) {
                    bridge.remove_room(room.room_id_str());
                }
            }
            if let Some(new_kernel_id) = &kernel_id {
                if let Some(bridge) = self.kernels.get(new_kernel_id) {
                    bridge.add_room(room);
                }
            }
        }

        self.store.set_kernel(session_id, kernel_id).await
    }

    /// Delete the session and drop its bindings.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session = self.store.get(session_id).await?;

        if let Some(session) = &session {
            if let (Ok(room), Some(kernel_id)) = (self.get_room(session_id), &session.kernel_id) {
                if let Some(bridge) = self.kernels.get(kernel_id) {
                    bridge.remove_room(room.room_id_str());
                }
            }
        }

        self.room_ids.lock().remove(session_id);
        self.store.delete(session_id).await
    }
}
