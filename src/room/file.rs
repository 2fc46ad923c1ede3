//! File API: load-once, coalesced-save loop with out-of-band detection.
//!
//! Saves coalesce through a flag, not a queue: any number of
//! `schedule_save()` calls between ticks produce one save. The flag is
//! cleared before the save I/O starts so edits arriving mid-save re-arm it.
//! Each tick also probes the content store's `last_modified` timestamp; a
//! mismatch with the cached value reports an out-of-band change.

use crate::contents::{ContentsStore, FileContent, FileFormat, FileIdIndexer, FileType};
use crate::error::{Error, Result};
use crate::events::{EventSink, RoomAction};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Callbacks the room wires into the save ticker.
///
/// All hooks are cheap and non-blocking: they enqueue work on the room's
/// message queue so only the dispatch task ever touches the document.
pub struct FileApiHooks {
    /// Request a content snapshot from the dispatch task.
    pub request_snapshot: Arc<dyn Fn() -> oneshot::Receiver<Option<FileContent>> + Send + Sync>,
    /// Invoked when the backing file changed out-of-band.
    pub on_out_of_band: Arc<dyn Fn() + Send + Sync>,
    /// Invoked after a successful save (clears the dirty flag).
    pub on_saved: Arc<dyn Fn() + Send + Sync>,
}

pub struct FileApi {
    room_id: String,
    file_id: String,
    format: FileFormat,
    file_type: FileType,
    contents: Arc<dyn ContentsStore>,
    indexer: Arc<dyn FileIdIndexer>,
    events: EventSink,
    last_modified: Mutex<Option<DateTime<Utc>>>,
    save_scheduled: AtomicBool,
    loaded_tx: watch::Sender<bool>,
    loaded_rx: watch::Receiver<bool>,
}

impl FileApi {
    pub fn new(
        room_id: String,
        file_id: String,
        format: FileFormat,
        file_type: FileType,
        contents: Arc<dyn ContentsStore>,
        indexer: Arc<dyn FileIdIndexer>,
        events: EventSink,
    ) -> Self {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        Self {
            room_id,
            file_id,
            format,
            file_type,
            contents,
            indexer,
            events,
            last_modified: Mutex::new(None),
            save_scheduled: AtomicBool::new(false),
            loaded_tx,
            loaded_rx,
        }
    }

    /// Resolve the file path through the indexer. Fails with *no-such-file*
    /// when the id is unresolved.
    pub fn get_path(&self) -> Result<String> {
        self.indexer
            .get_path(&self.file_id)
            .ok_or_else(|| Error::NotFound(format!("no path for file id '{}'", self.file_id)))
    }

    /// A receiver that resolves `true` once the initial content is loaded.
    pub fn content_loaded(&self) -> watch::Receiver<bool> {
        self.loaded_rx.clone()
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded_rx.borrow()
    }

    /// Mark a save as wanted; the next tick performs it.
    pub fn schedule_save(&self) {
        self.save_scheduled.store(true, Ordering::SeqCst);
    }

    fn take_save_scheduled(&self) -> bool {
        self.save_scheduled.swap(false, Ordering::SeqCst)
    }

    /// Fetch the backing file's content and cache its timestamp. Called once
    /// by the dispatch task before it processes any message.
    pub async fn load_content(&self) -> Result<FileContent> {
        let path = self.get_path()?;
        let model = self
            .contents
            .get(&path, self.format, self.file_type, true)
            .await?;
        *self.last_modified.lock() = Some(model.last_modified);
        model
            .content
            .ok_or_else(|| Error::NotFound(format!("empty content for '{path}'")))
    }

    pub fn mark_loaded(&self) {
        let _ = self.loaded_tx.send(true);
    }

    /// Probe the content store for an out-of-band mutation. Only metadata is
    /// fetched. Fails with `Conflict` when the timestamp moved under us.
    pub async fn check_out_of_band(&self) -> Result<()> {
        let path = self.get_path()?;
        let model = self
            .contents
            .get(&path, self.format, self.file_type, false)
            .await?;
        let cached = *self.last_modified.lock();
        match cached {
            Some(cached) if cached != model.last_modified => {
                tracing::warn!(
                    room_id = %self.room_id,
                    cached = %cached,
                    observed = %model.last_modified,
                    "out-of-band file change detected"
                );
                Err(Error::Conflict(path))
            }
            _ => Ok(()),
        }
    }

    /// Save content immediately and cache the new timestamp.
    pub async fn save_now(&self, content: FileContent) -> Result<()> {
        let path = self.get_path()?;
        let model = self.contents.save(&path, &content).await?;
        *self.last_modified.lock() = Some(model.last_modified);
        self.events.emit_room(RoomAction::Save, &self.room_id);
        Ok(())
    }

    /// Spawn the background ticker. Every `debounce` interval it checks for
    /// out-of-band changes, then performs at most one coalesced save. The
    /// save itself runs on a spawned task so cancelling the ticker cannot
    /// sever a write mid-flight; the task never exits on save failure.
    pub fn spawn_ticker(self: &Arc<Self>, debounce: Duration, hooks: FileApiHooks) -> JoinHandle<()> {
        let api = Arc::clone(self);
        tokio::spawn(async move {
            // No saves can be scheduled before content is loaded.
            let mut loaded = api.content_loaded();
            if loaded.wait_for(|v| *v).await.is_err() {
                return;
            }

            loop {
                tokio::time::sleep(debounce).await;

                match api.check_out_of_band().await {
                    Ok(()) => {}
                    Err(Error::Conflict(_)) => {
                        (hooks.on_out_of_band)();
                        // The room restarts and replaces this file API.
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            room_id = %api.room_id,
                            error = %e,
                            "out-of-band probe failed"
                        );
                    }
                }

                if !api.take_save_scheduled() {
                    continue;
                }

                let snapshot = (hooks.request_snapshot)();
                let content = match snapshot.await {
                    Ok(Some(content)) => content,
                    // Room is stopping or has no content; drop this tick.
                    _ => continue,
                };

                let save_api = Arc::clone(&api);
                let save = tokio::spawn(async move { save_api.save_now(content).await });
                match save.await {
                    Ok(Ok(())) => (hooks.on_saved)(),
                    Ok(Err(e)) => {
                        tracing::error!(
                            room_id = %api.room_id,
                            error = %e,
                            "failed to save document"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            room_id = %api.room_id,
                            error = %e,
                            "save task panicked"
                        );
                    }
                }
            }
        })
    }
}
