//! The per-document room engine.
//!
//! A room owns one CRDT document, one awareness replica, one client group,
//! and (for document rooms) one file API. All document and awareness
//! mutations happen on the room's dispatch task, which drains a FIFO queue of
//! client frames and command closures. Observers broadcast to clients but
//! never re-enter the document.

use crate::config::Config;
use crate::contents::{ContentsStore, FileContent, FileFormat, FileIdIndexer, FileType};
use crate::crdt::{
    self,
    awareness::{Awareness, AwarenessOrigin, AwarenessUpdate},
    notebook::{NotebookView, TextView},
};
use crate::error::Result;
use crate::events::{EventSink, RoomAction};
use crate::room::file::{FileApi, FileApiHooks};
use crate::room::RoomId;
use crate::ws::client::ClientGroup;
use crate::ws::protocol::{self, WsMessage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Lifecycle of a room generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Initializing,
    Loading,
    Ready,
    Stopping,
    Stopped,
}

/// Structured view over the room's document.
pub enum DocView {
    Notebook(NotebookView),
    Text(TextView),
}

/// The CRDT-side state owned exclusively by the dispatch task.
pub struct RoomDocs {
    pub doc: yrs::Doc,
    pub awareness: Awareness,
    pub view: Option<DocView>,
    format: FileFormat,
    subscriptions: Vec<yrs::Subscription>,
}

impl RoomDocs {
    pub fn notebook(&self) -> Option<&NotebookView> {
        match &self.view {
            Some(DocView::Notebook(view)) => Some(view),
            _ => None,
        }
    }

    fn apply_content(&mut self, content: &FileContent) {
        match (&self.view, content) {
            (Some(DocView::Notebook(view)), FileContent::Notebook(notebook)) => {
                view.set_source(notebook);
            }
            (Some(DocView::Text(view)), FileContent::Text(text)) => view.set_source(text),
            (Some(DocView::Text(view)), FileContent::Base64(encoded)) => view.set_source(encoded),
            _ => {
                tracing::warn!("content representation does not match the room's view");
            }
        }
    }

    fn extract_content(&self) -> Option<FileContent> {
        match &self.view {
            Some(DocView::Notebook(view)) => Some(FileContent::Notebook(view.to_source())),
            Some(DocView::Text(view)) => match self.format {
                FileFormat::Base64 => Some(FileContent::Base64(view.to_source())),
                _ => Some(FileContent::Text(view.to_source())),
            },
            None => None,
        }
    }
}

type DocCommand = Box<dyn FnOnce(&mut RoomDocs) + Send>;

enum RoomMsg {
    /// A binary frame from a client.
    Client(String, Vec<u8>),
    /// A mutation request from outside the room (kernel bridge, binder).
    WithDoc(DocCommand),
    /// Content snapshot request from the save ticker.
    Snapshot(oneshot::Sender<Option<FileContent>>),
    /// Reset the dirty flag after a completed save.
    MarkClean,
    /// Graceful stop: processed after every earlier message has drained.
    Stop { done: Option<oneshot::Sender<()>> },
}

struct Generation {
    tx: mpsc::UnboundedSender<RoomMsg>,
    abort_tx: watch::Sender<bool>,
    loaded_rx: watch::Receiver<bool>,
    dispatch: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
    file_api: Option<Arc<FileApi>>,
}

/// A room coordinating one document's replicas.
pub struct Room {
    room_id: RoomId,
    room_id_str: String,
    clients: Arc<ClientGroup>,
    contents: Arc<dyn ContentsStore>,
    indexer: Arc<dyn FileIdIndexer>,
    events: EventSink,
    config: Arc<Config>,
    /// Whether the CRDT received any mutation since the last (re)start.
    updated: Arc<AtomicBool>,
    /// Mirror of the awareness `kernel.execution_state`, readable without
    /// going through the dispatch task.
    kernel_state: Mutex<Option<String>>,
    state: Arc<Mutex<RoomState>>,
    generation: Mutex<Option<Generation>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    /// Create the room and start its dispatch task. For document rooms the
    /// file id must resolve to a path; an unresolved id fails construction so
    /// no partially-initialized room is left behind.
    pub fn new(
        room_id: RoomId,
        contents: Arc<dyn ContentsStore>,
        indexer: Arc<dyn FileIdIndexer>,
        events: EventSink,
        config: Arc<Config>,
    ) -> Result<Arc<Self>> {
        if let Some(file_id) = room_id.file_id() {
            indexer.get_path(file_id).ok_or_else(|| {
                crate::error::Error::NotFound(format!("no path for file id '{file_id}'"))
            })?;
        }

        let room_id_str = room_id.to_string();
        let room = Arc::new(Self {
            clients: Arc::new(ClientGroup::new(room_id_str.clone())),
            room_id,
            room_id_str: room_id_str.clone(),
            contents,
            indexer,
            events,
            config,
            updated: Arc::new(AtomicBool::new(false)),
            kernel_state: Mutex::new(None),
            state: Arc::new(Mutex::new(RoomState::Initializing)),
            generation: Mutex::new(None),
            reaper: Mutex::new(None),
        });

        let reaper = room.clients.spawn_reaper(
            room.config.client_poll_interval(),
            room.config.desynced_timeout(),
        );
        *room.reaper.lock() = Some(reaper);

        room.start_generation();
        room.events.emit_room(RoomAction::Initialize, &room_id_str);
        Ok(room)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn room_id_str(&self) -> &str {
        &self.room_id_str
    }

    pub fn clients(&self) -> &Arc<ClientGroup> {
        &self.clients
    }

    pub fn state(&self) -> RoomState {
        *self.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.generation.lock().is_none()
    }

    /// Whether the CRDT received any mutation since the last (re)start.
    pub fn updated(&self) -> bool {
        self.updated.load(Ordering::SeqCst)
    }

    /// The awareness-reported kernel execution state, if any.
    pub fn kernel_execution_state(&self) -> Option<String> {
        self.kernel_state.lock().clone()
    }

    /// Enqueue a client frame for dispatch.
    pub fn add_message(&self, client_id: &str, frame: Vec<u8>) {
        let tx = self.generation.lock().as_ref().map(|g| g.tx.clone());
        match tx {
            Some(tx) => {
                if tx
                    .send(RoomMsg::Client(client_id.to_string(), frame))
                    .is_err()
                {
                    tracing::debug!(room_id = %self.room_id_str, "dropping frame for stopped room");
                }
            }
            None => {
                tracing::debug!(room_id = %self.room_id_str, "dropping frame for stopped room");
            }
        }
    }

    /// Run a closure against the room's documents on the dispatch task. This
    /// is the only way external components mutate the CRDT or awareness.
    pub fn with_docs<F>(&self, f: F)
    where
        F: FnOnce(&mut RoomDocs) + Send + 'static,
    {
        let tx = self.generation.lock().as_ref().map(|g| g.tx.clone());
        if let Some(tx) = tx {
            if tx.send(RoomMsg::WithDoc(Box::new(f))).is_err() {
                tracing::debug!(room_id = %self.room_id_str, "dropping command for stopped room");
            }
        }
    }

    /// Read from the room's documents on the dispatch task. Resolves `None`
    /// when the room stopped before answering.
    pub async fn query<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&RoomDocs) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.with_docs(move |docs| {
            let _ = tx.send(f(docs));
        });
        rx.await.ok()
    }

    /// Resolves once the initial content load finished.
    pub async fn content_loaded(&self) {
        let rx = self.generation.lock().as_ref().map(|g| g.loaded_rx.clone());
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|loaded| *loaded).await;
        }
    }

    /// Set one field of the room's local awareness state (e.g. `kernel`).
    pub fn set_awareness_field(&self, key: &str, value: Value) {
        if key == "kernel" {
            *self.kernel_state.lock() = value
                .get("execution_state")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        let key = key.to_string();
        self.with_docs(move |docs| docs.awareness.set_local_state_field(&key, value));
    }

    /// Publish a cell's execution state into awareness `cell_states`.
    pub fn set_cell_awareness_state(&self, cell_id: &str, state: &str) {
        let cell_id = cell_id.to_string();
        let state = state.to_string();
        self.with_docs(move |docs| {
            let mut cell_states = docs
                .awareness
                .local_state_field("cell_states")
                .cloned()
                .unwrap_or_else(|| json!({}));
            if !cell_states.is_object() {
                cell_states = json!({});
            }
            cell_states[cell_id.as_str()] = Value::String(state);
            docs.awareness.set_local_state_field("cell_states", cell_states);
        });
    }

    /// Stop the room: close clients, detach observers, drain or discard the
    /// queue, perform the final save (graceful only), and join the dispatch
    /// task. The client-group reaper stays alive for a later restart.
    async fn stop_generation(&self, close_code: u16, immediately: bool) {
        let generation = { self.generation.lock().take() };
        let Some(generation) = generation else {
            return;
        };

        self.clients.stop(close_code);

        // No tick may race the final save below.
        if let Some(ticker) = generation.ticker {
            ticker.abort();
        }

        if immediately {
            let _ = generation.abort_tx.send(true);
        } else {
            let (done_tx, done_rx) = oneshot::channel();
            if generation
                .tx
                .send(RoomMsg::Stop {
                    done: Some(done_tx),
                })
                .is_ok()
            {
                let _ = done_rx.await;
            }
        }

        let _ = generation.dispatch.await;
    }

    /// Permanently stop the room.
    pub async fn stop(&self, close_code: u16, immediately: bool) {
        self.stop_generation(close_code, immediately).await;
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }

    /// Stop and re-initialize in place, preserving the room id. Frees the
    /// document history accumulated since the last start.
    pub async fn restart(self: &Arc<Self>, close_code: u16, immediately: bool) {
        self.stop_generation(close_code, immediately).await;
        self.updated.store(false, Ordering::SeqCst);
        *self.kernel_state.lock() = None;
        self.clients.restart(close_code);
        self.start_generation();
        self.events
            .emit_room(RoomAction::Initialize, &self.room_id_str);
    }

    /// The backing file changed out-of-band: drop state, tell clients to
    /// reconnect, reload from the content store.
    pub async fn handle_out_of_band_change(self: &Arc<Self>) {
        self.events
            .emit_room(RoomAction::Overwrite, &self.room_id_str);
        self.restart(protocol::CLOSE_OUT_OF_BAND_CHANGE, true).await;
    }

    /// The backing file was moved or deleted out-of-band.
    pub async fn handle_out_of_band_move(&self) {
        self.stop(protocol::CLOSE_OUT_OF_BAND_MOVE, true).await;
    }

    /// The backing file was deleted through the server.
    pub async fn handle_in_band_deletion(&self) {
        self.stop(protocol::CLOSE_IN_BAND_DELETE, true).await;
    }

    fn start_generation(self: &Arc<Self>) {
        let doc = crdt::new_doc();
        let mut awareness = Awareness::new();
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let (view, file_api, format) = match &self.room_id {
            RoomId::GlobalAwareness => (None, None, FileFormat::Text),
            RoomId::Document {
                format,
                file_type,
                file_id,
            } => {
                let view = match file_type {
                    FileType::Notebook => DocView::Notebook(NotebookView::new(&doc)),
                    FileType::File => DocView::Text(TextView::new(&doc)),
                };
                let api = Arc::new(FileApi::new(
                    self.room_id_str.clone(),
                    file_id.clone(),
                    *format,
                    *file_type,
                    Arc::clone(&self.contents),
                    Arc::clone(&self.indexer),
                    self.events.clone(),
                ));
                (Some(view), Some(api), *format)
            }
        };

        let mut subscriptions = Vec::new();

        // CRDT update observer: broadcast a SyncUpdate to every synced client.
        let group = Arc::clone(&self.clients);
        let updated = Arc::clone(&self.updated);
        match doc.observe_update_v1(move |_txn, event| {
            updated.store(true, Ordering::SeqCst);
            let frame = protocol::encode_update(&event.update);
            group.broadcast(&frame);
        }) {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => {
                tracing::error!(room_id = %self.room_id_str, error = %e, "failed to observe doc");
            }
        }

        // View observer: schedule a save on every effective change once the
        // content is loaded.
        if let (Some(view), Some(api)) = (&view, &file_api) {
            let api_obs = Arc::clone(api);
            let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                if api_obs.is_loaded() {
                    api_obs.schedule_save();
                }
            });
            let view_subs = match view {
                DocView::Notebook(v) => v.observe_changes(on_change),
                DocView::Text(v) => v.observe_changes(on_change),
            };
            subscriptions.extend(view_subs);
        }

        // Awareness observer: broadcast locally-originated updates.
        let group = Arc::clone(&self.clients);
        let events = self.events.clone();
        let room_id = self.room_id_str.clone();
        awareness.observe(move |change| {
            if change.origin == AwarenessOrigin::Local && !change.is_empty() {
                let frame = protocol::encode_awareness(&change.update.encode());
                group.broadcast(&frame);
                events.emit_awareness(&room_id, "local awareness update");
            }
        });

        let ticker = file_api.as_ref().map(|api| {
            let weak = Arc::downgrade(self);
            let snapshot_tx = tx.clone();
            let clean_tx = tx.clone();
            let hooks = FileApiHooks {
                request_snapshot: Arc::new(move || {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let _ = snapshot_tx.send(RoomMsg::Snapshot(reply_tx));
                    reply_rx
                }),
                on_out_of_band: Arc::new(move || {
                    if let Some(room) = weak.upgrade() {
                        tokio::spawn(async move {
                            room.handle_out_of_band_change().await;
                        });
                    }
                }),
                on_saved: Arc::new(move || {
                    let _ = clean_tx.send(RoomMsg::MarkClean);
                }),
            };
            api.spawn_ticker(self.config.save_debounce(), hooks)
        });

        let docs = RoomDocs {
            doc,
            awareness,
            view,
            format,
            subscriptions,
        };

        *self.state.lock() = RoomState::Initializing;
        let dispatch = tokio::spawn(dispatch_loop(
            self.room_id_str.clone(),
            docs,
            rx,
            abort_rx,
            Arc::clone(&self.clients),
            file_api.clone(),
            self.events.clone(),
            loaded_tx,
            Arc::clone(&self.state),
            Arc::clone(&self.updated),
        ));

        *self.generation.lock() = Some(Generation {
            tx,
            abort_tx,
            loaded_rx,
            dispatch,
            ticker,
            file_api,
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    room_id: String,
    mut docs: RoomDocs,
    mut rx: mpsc::UnboundedReceiver<RoomMsg>,
    mut abort_rx: watch::Receiver<bool>,
    group: Arc<ClientGroup>,
    file_api: Option<Arc<FileApi>>,
    events: EventSink,
    loaded_tx: watch::Sender<bool>,
    state: Arc<Mutex<RoomState>>,
    updated: Arc<AtomicBool>,
) {
    // Load phase: nothing is dispatched until the content is in the CRDT.
    if let Some(api) = &file_api {
        *state.lock() = RoomState::Loading;
        match api.load_content().await {
            Ok(content) => docs.apply_content(&content),
            Err(e) => {
                tracing::error!(
                    room_id = %room_id,
                    error = %e,
                    "failed to load content; starting from an empty document"
                );
            }
        }
        api.mark_loaded();
        events.emit_room(RoomAction::Load, &room_id);
        // The load transaction itself is not client history worth freeing.
        updated.store(false, Ordering::SeqCst);
    }
    let _ = loaded_tx.send(true);
    *state.lock() = RoomState::Ready;

    let mut done_tx: Option<oneshot::Sender<()>> = None;
    let immediately = loop {
        tokio::select! {
            biased;
            changed = abort_rx.changed() => {
                if changed.is_err() || *abort_rx.borrow() {
                    break true;
                }
            }
            msg = rx.recv() => {
                match msg {
                    None => break true,
                    Some(RoomMsg::Stop { done }) => {
                        done_tx = done;
                        break false;
                    }
                    Some(msg) => handle_room_msg(&room_id, &mut docs, &group, msg),
                }
            }
        }
    };

    *state.lock() = RoomState::Stopping;
    // Detach observers: no broadcast fires during or after the final save.
    docs.subscriptions.clear();

    if !immediately {
        if let (Some(api), Some(content)) = (&file_api, docs.extract_content()) {
            if let Err(e) = api.save_now(content).await {
                tracing::error!(room_id = %room_id, error = %e, "final save failed");
            }
        }
    }

    events.emit_room(RoomAction::Clean, &room_id);
    *state.lock() = RoomState::Stopped;
    if let Some(done) = done_tx {
        let _ = done.send(());
    }
    tracing::info!(room_id = %room_id, "dispatch task stopped");
}

fn handle_room_msg(room_id: &str, docs: &mut RoomDocs, group: &ClientGroup, msg: RoomMsg) {
    match msg {
        RoomMsg::Client(client_id, frame) => {
            handle_client_frame(room_id, docs, group, &client_id, &frame);
        }
        RoomMsg::WithDoc(command) => command(docs),
        RoomMsg::Snapshot(reply) => {
            let _ = reply.send(docs.extract_content());
        }
        RoomMsg::MarkClean => {
            if let Some(DocView::Notebook(view)) = &docs.view {
                view.set_dirty(false);
            }
        }
        RoomMsg::Stop { .. } => unreachable!("Stop is handled by the dispatch loop"),
    }
}

fn handle_client_frame(
    room_id: &str,
    docs: &mut RoomDocs,
    group: &ClientGroup,
    client_id: &str,
    frame: &[u8],
) {
    let message = match protocol::decode_message(frame) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                room_id,
                client_id,
                header = %protocol::describe_header(frame),
                error = %e,
                "ignoring unrecognized message"
            );
            return;
        }
    };

    match message {
        WsMessage::SyncStep1 { state_vector } => {
            handle_sync_step1(room_id, docs, group, client_id, &state_vector);
        }
        WsMessage::SyncStep2 { update } => {
            if let Err(e) = crdt::apply_update(&docs.doc, &update) {
                tracing::error!(room_id, client_id, error = %e, "failed to apply SyncStep2");
            }
        }
        WsMessage::Update { update } => {
            // SyncUpdate before the handshake completes is a protocol
            // violation; the offending client is disconnected.
            if !group.is_synced(client_id).unwrap_or(false) {
                tracing::warn!(
                    room_id,
                    client_id,
                    "closing desynced client that sent a SyncUpdate"
                );
                group.remove(client_id, protocol::CLOSE_PROTOCOL_VIOLATION);
                return;
            }
            if let Err(e) = crdt::apply_update(&docs.doc, &update) {
                tracing::error!(room_id, client_id, error = %e, "failed to apply SyncUpdate");
            }
        }
        WsMessage::Awareness { data } => {
            let update = match AwarenessUpdate::decode(&data) {
                Ok(update) => update,
                Err(e) => {
                    tracing::error!(room_id, client_id, error = %e, "bad awareness update");
                    return;
                }
            };
            docs.awareness.apply_update(update);
            // Relay the raw frame to the other clients.
            group.broadcast_except(client_id, &protocol::encode_awareness(&data));
        }
    }
}

/// The server half of the two-way handshake: reply with SyncStep2, then send
/// our own SyncStep1. Each send is independently fault-tolerant.
fn handle_sync_step1(
    room_id: &str,
    docs: &mut RoomDocs,
    group: &ClientGroup,
    client_id: &str,
    state_vector: &[u8],
) {
    group.mark_desynced(client_id);

    let reply = match crdt::handle_sync_step1(&docs.doc, state_vector) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(room_id, client_id, error = %e, "failed to compute SyncStep2 reply");
            return;
        }
    };

    if let Err(e) = group.send_to(client_id, protocol::encode_sync_step2(&reply)) {
        tracing::error!(room_id, client_id, error = %e, "failed to send SyncStep2 reply");
        return;
    }
    group.mark_synced(client_id);

    let own_step1 = protocol::encode_sync_step1(&crdt::state_vector(&docs.doc));
    if let Err(e) = group.send_to(client_id, own_step1) {
        tracing::error!(room_id, client_id, error = %e, "failed to send our SyncStep1");
    }
}
