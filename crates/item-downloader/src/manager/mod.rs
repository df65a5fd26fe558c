//! # Download queue manager
//!
//! Owns the FIFO item queue and the set of in-flight parts, admits parts up to
//! the concurrency ceiling, and drives every part to a terminal outcome.
//!
//! All state lives behind one mutex. Admission, the watch loop, commands,
//! fetcher callbacks and relocation/scan completions serialize through it.
//! Events and persistence are gathered while the lock is held and delivered
//! after it is released, batch by batch in lock order.
//!
//! Internal parts report through fetcher callbacks; external parts are polled
//! by a single watch loop that runs only while something is in flight.

mod state;

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use self::state::{Effects, InFlight, PartKey, PendingRelocation, QueueState};
use crate::backend::{
    BackendKind, ExternalServiceBackend, ExternalTransferService, StreamingBackend,
    TransferBackend, TransferCheck, TransferHandle,
};
use crate::config::QueueConfig;
use crate::events::{CompletionPayload, QueueEvent};
use crate::fetcher::{FetchCallback, FetchEvent, StreamingFetcher};
use crate::fs;
use crate::model::{DownloadItem, ItemStatus, percent_of};
use crate::relocation::{
    RelocatedFile, RelocationError, RelocationRequest, RelocationService, relocate_and_reconcile,
};
use crate::scanner::{ItemScanner, NoopScanner, ScanResult};
use crate::store::{ItemStore, MemoryItemStore};
use crate::{Error, Result};

const STOPPED_MESSAGE: &str = "Download stopped";

/// Builder for [`DownloadQueueManager`].
pub struct DownloadQueueManagerBuilder {
    config: QueueConfig,
    external: Arc<dyn ExternalTransferService>,
    relocation: Arc<dyn RelocationService>,
    store: Option<Arc<dyn ItemStore>>,
    scanner: Option<Arc<dyn ItemScanner>>,
    fetcher: Option<Arc<StreamingFetcher>>,
}

impl DownloadQueueManagerBuilder {
    /// Persist items through `store` instead of keeping them in memory.
    pub fn with_store(mut self, store: Arc<dyn ItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn ItemScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Use a pre-built fetcher for internal parts.
    pub fn with_fetcher(mut self, fetcher: Arc<StreamingFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> Result<DownloadQueueManager> {
        self.config.validate()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(StreamingFetcher::with_config(self.config.fetch.clone())?),
        };
        let (event_tx, _) = broadcast::channel(self.config.event_capacity);

        let inner = Inner {
            state: Mutex::new(QueueState::default()),
            apply_order: Mutex::new(()),
            streaming: Arc::new(StreamingBackend::new(fetcher)),
            external: Arc::new(ExternalServiceBackend::new(self.external)),
            relocation: self.relocation,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryItemStore::new())),
            scanner: self.scanner.unwrap_or_else(|| Arc::new(NoopScanner)),
            event_tx,
            config: self.config,
        };

        Ok(DownloadQueueManager {
            inner: Arc::new(inner),
        })
    }
}

/// Download queue manager.
///
/// Must be used from within a tokio runtime: admission spawns transfers and
/// the watch loop.
pub struct DownloadQueueManager {
    inner: Arc<Inner>,
}

impl DownloadQueueManager {
    pub fn builder(
        config: QueueConfig,
        external: Arc<dyn ExternalTransferService>,
        relocation: Arc<dyn RelocationService>,
    ) -> DownloadQueueManagerBuilder {
        DownloadQueueManagerBuilder {
            config,
            external,
            relocation,
            store: None,
            scanner: None,
            fetcher: None,
        }
    }

    /// Create a manager with an in-memory store and no scanner.
    pub fn new(
        config: QueueConfig,
        external: Arc<dyn ExternalTransferService>,
        relocation: Arc<dyn RelocationService>,
    ) -> Result<Self> {
        Self::builder(config, external, relocation).build()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Append an item to the queue and admit what fits.
    pub fn enqueue(&self, mut item: DownloadItem) -> Result<()> {
        if item.parts.is_empty() {
            return Err(Error::validation(format!(
                "download item {} has no parts",
                item.id
            )));
        }
        for (i, part) in item.parts.iter().enumerate() {
            if item.parts[..i].iter().any(|p| p.id == part.id) {
                return Err(Error::validation(format!(
                    "download item {} has duplicate part {}",
                    item.id, part.id
                )));
            }
        }

        let mut effects = Effects::default();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.item_index(&item.id).is_some() {
            return Err(Error::DuplicateItem(item.id));
        }

        let item_id = item.id.clone();
        for part in &mut item.parts {
            part.item_id = item_id.clone();
        }
        item.set_status(ItemStatus::Active, None);
        info!(
            item_id = %item.id,
            title = %item.title,
            parts = item.parts.len(),
            "Download item queued"
        );

        effects.save(&item);
        effects.emit(QueueEvent::ItemAdded { item: item.clone() });
        state.items.push(item);
        self.inner.admit(state, &mut effects);
        self.inner.apply(guard, effects);
        Ok(())
    }

    /// Restart every failed or paused part of an item.
    ///
    /// Returns `false` without emitting anything when the item is not queued or
    /// has nothing to restart.
    pub fn retry(&self, item_id: &str) -> bool {
        let mut effects = Effects::default();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(idx) = state.item_index(item_id) else {
            debug!(item_id, "Retry requested for unknown item");
            return false;
        };

        let item = &mut state.items[idx];
        let mut restarted = 0usize;
        for part in item.parts.iter_mut().filter(|p| p.failed || p.paused) {
            fs::remove_artifacts(&part.artifact_paths());
            part.reset_transfer();
            part.failed = false;
            part.paused = false;
            part.error_message = None;
            effects.emit(QueueEvent::PartUpdated { part: part.clone() });
            restarted += 1;
        }
        if restarted == 0 {
            debug!(item_id, "Nothing to retry");
            return false;
        }

        item.set_status(ItemStatus::Active, None);
        effects.save(item);
        info!(item_id, parts = restarted, "Download item restarted");
        self.inner.admit(state, &mut effects);
        self.inner.apply(guard, effects);
        true
    }

    /// Same as [`retry`](Self::retry); paused and failed parts restart alike.
    pub fn resume(&self, item_id: &str) -> bool {
        self.retry(item_id)
    }

    /// Stop every transfer of an item and drop it from the queue and store.
    pub fn cancel(&self, item_id: &str, delete_files: bool) -> bool {
        let mut effects = Effects::default();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(idx) = state.item_index(item_id) else {
            debug!(item_id, "Cancel requested for unknown item");
            return false;
        };

        for key in state.in_flight_keys_for(item_id) {
            if let Some(entry) = state.in_flight.remove(&key) {
                self.inner.cancel_handle(&entry.handle);
            }
        }

        let mut item = state.items.remove(idx);
        for part in &mut item.parts {
            if delete_files {
                fs::remove_artifacts(&[&part.staging_path, &part.final_destination_path]);
            }
            part.reset_transfer();
            part.paused = true;
        }
        state.completing.remove(item_id);

        info!(item_id, delete_files, "Download item cancelled");
        effects.remove(item_id);
        effects.emit(QueueEvent::ItemCancelled {
            item_id: item_id.to_string(),
        });
        self.inner.admit(state, &mut effects);
        self.inner.apply(guard, effects);
        true
    }

    /// Re-adopt an item loaded from durable storage after a restart.
    ///
    /// Failed parts keep their failure until retried; transfers that were
    /// running when the process stopped are started again from scratch.
    pub fn restore(&self, mut item: DownloadItem) -> bool {
        if item.parts.is_empty() {
            warn!(item_id = %item.id, "Not restoring download item without parts");
            return false;
        }

        let mut effects = Effects::default();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.item_index(&item.id).is_some() {
            debug!(item_id = %item.id, "Download item already queued");
            return false;
        }

        let item_id = item.id.clone();
        for part in &mut item.parts {
            part.item_id = item_id.clone();
            part.moving = false;
            if part.failed {
                fs::remove_artifacts(&part.artifact_paths());
                part.reset_transfer();
                part.paused = true;
            } else if !part.completed || (!part.moved && !part.is_internal_storage) {
                part.reset_transfer();
            }
        }

        if item.parts.iter().any(|p| p.failed) {
            let message = item.status_message.clone();
            item.set_status(ItemStatus::Failed, message);
        } else if item.parts.iter().any(|p| p.paused) {
            let message = item
                .status_message
                .clone()
                .or_else(|| Some(STOPPED_MESSAGE.to_string()));
            item.set_status(ItemStatus::Stopped, message);
        } else {
            item.set_status(ItemStatus::Active, None);
        }

        info!(item_id = %item.id, status = %item.status, "Download item restored");
        effects.save(&item);
        effects.emit(QueueEvent::ItemAdded { item: item.clone() });
        state.items.push(item);
        let idx = state.items.len() - 1;
        self.inner.check_completion(state, idx, &mut effects);
        self.inner.admit(state, &mut effects);
        self.inner.apply(guard, effects);
        true
    }

    /// Restore every item the store holds. Returns how many were adopted.
    pub fn restore_from_store(&self) -> Result<usize> {
        let items = self.inner.store.load_items()?;
        Ok(items
            .into_iter()
            .map(|item| self.restore(item))
            .filter(|adopted| *adopted)
            .count())
    }

    /// Stop all transfers and the watch loop.
    ///
    /// Items stay queued, marked stopped with their unfinished parts paused,
    /// until resumed.
    pub fn shutdown(&self) {
        let mut effects = Effects::default();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.watch_epoch += 1;
        state.watching = false;
        if let Some(task) = state.watch_task.take() {
            task.abort();
        }

        for (_, entry) in state.in_flight.drain() {
            self.inner.cancel_handle(&entry.handle);
        }

        let mut stopped = 0usize;
        for item in &mut state.items {
            if item.status != ItemStatus::Active || state.completing.contains(&item.id) {
                continue;
            }
            for part in item.parts.iter_mut().filter(|p| !p.is_succeeded() || p.moving) {
                let was_running = part.download_id.is_some();
                part.reset_transfer();
                part.paused = true;
                if was_running {
                    effects.emit(QueueEvent::PartUpdated { part: part.clone() });
                }
            }
            item.set_status(ItemStatus::Stopped, Some(STOPPED_MESSAGE.to_string()));
            effects.save(item);
            stopped += 1;
        }
        info!(stopped, "Download queue shut down");
        self.inner.apply(guard, effects);
    }

    /// Snapshot of the queued items in FIFO order.
    pub fn items(&self) -> Vec<DownloadItem> {
        self.inner.state.lock().items.clone()
    }

    pub fn item(&self, item_id: &str) -> Option<DownloadItem> {
        let state = self.inner.state.lock();
        state.items.iter().find(|i| i.id == item_id).cloned()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Whether the watch loop is running.
    pub fn is_watching(&self) -> bool {
        self.inner.state.lock().watching
    }
}

struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Held while effects are applied; taken before `state` is released.
    apply_order: Mutex<()>,
    streaming: Arc<dyn TransferBackend>,
    external: Arc<dyn TransferBackend>,
    relocation: Arc<dyn RelocationService>,
    store: Arc<dyn ItemStore>,
    scanner: Arc<dyn ItemScanner>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl Inner {
    fn backend(&self, kind: BackendKind) -> &dyn TransferBackend {
        match kind {
            BackendKind::Streaming => self.streaming.as_ref(),
            BackendKind::External => self.external.as_ref(),
        }
    }

    fn cancel_handle(&self, handle: &TransferHandle) {
        debug!(download_id = handle.id(), backend = %handle.kind(), "Cancelling transfer");
        self.backend(handle.kind()).cancel(handle);
    }

    /// Start eligible parts, FIFO across items, until the ceiling is reached.
    fn admit(self: &Arc<Self>, state: &mut QueueState, effects: &mut Effects) {
        let max = self.config.max_concurrent;
        let mut item_idx = 0;
        while item_idx < state.items.len() && state.in_flight.len() < max {
            if !state.completing.contains(&state.items[item_idx].id) {
                let capacity = max - state.in_flight.len();
                let next: Vec<String> = state.items[item_idx]
                    .next_parts(capacity)
                    .into_iter()
                    .map(|p| p.id.clone())
                    .collect();
                for part_id in next {
                    let Some(part_idx) = state.items[item_idx]
                        .parts
                        .iter()
                        .position(|p| p.id == part_id)
                    else {
                        continue;
                    };
                    if !self.dispatch(state, item_idx, part_idx, effects) {
                        break;
                    }
                }
            }
            item_idx += 1;
        }
        self.ensure_watching(state);
    }

    /// Returns `false` when the part failed to start.
    fn dispatch(
        self: &Arc<Self>,
        state: &mut QueueState,
        item_idx: usize,
        part_idx: usize,
        effects: &mut Effects,
    ) -> bool {
        let generation = state.next_generation();
        let item = &state.items[item_idx];
        let part = &item.parts[part_idx];
        let key: PartKey = (item.id.clone(), part.id.clone());
        let kind = BackendKind::for_part(part);

        fs::remove_artifacts(&part.artifact_paths());
        let callback = self.fetch_callback(key.clone(), generation);

        match self.backend(kind).start(item, part, callback) {
            Ok(handle) => {
                let part = &mut state.items[item_idx].parts[part_idx];
                part.download_id = Some(handle.id());
                part.error_message = None;
                info!(
                    item_id = %key.0,
                    part_id = %key.1,
                    download_id = handle.id(),
                    backend = %kind,
                    "Download part started"
                );
                effects.emit(QueueEvent::PartUpdated { part: part.clone() });
                state.in_flight.insert(
                    key,
                    InFlight {
                        generation,
                        handle,
                        pushed: None,
                    },
                );
                true
            }
            Err(e) => {
                warn!(item_id = %key.0, part_id = %key.1, error = %e, "Failed to start download part");
                self.fail_part(state, &key, e.to_string(), effects);
                false
            }
        }
    }

    fn fetch_callback(self: &Arc<Self>, key: PartKey, generation: u64) -> FetchCallback {
        let inner: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.on_fetch_event(&key, generation, event);
            }
        })
    }

    fn on_fetch_event(&self, key: &PartKey, generation: u64, event: FetchEvent) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state
            .in_flight
            .get_mut(key)
            .filter(|e| e.generation == generation)
        else {
            return;
        };

        match event {
            FetchEvent::Progress {
                bytes_written,
                percent,
                total,
            } => {
                let part = state
                    .items
                    .iter_mut()
                    .find(|i| i.id == key.0)
                    .and_then(|i| i.part_mut(&key.1));
                if let Some(part) = part {
                    part.bytes_downloaded = bytes_written;
                    part.progress = percent;
                    if total > 0 {
                        part.file_size = total;
                    }
                }
            }
            FetchEvent::Completed { bytes_written } => {
                entry.pushed = Some(TransferCheck::Successful {
                    bytes_so_far: bytes_written,
                    total_bytes: bytes_written,
                });
            }
            FetchEvent::Failed { message } => {
                entry.pushed = Some(TransferCheck::Failed { message });
            }
        }
    }

    fn ensure_watching(self: &Arc<Self>, state: &mut QueueState) {
        if state.watching || state.in_flight.is_empty() {
            return;
        }
        state.watching = true;
        state.watch_epoch += 1;
        let epoch = state.watch_epoch;
        let inner = Arc::clone(self);
        state.watch_task = Some(tokio::spawn(inner.watch_loop(epoch)));
        debug!(epoch, "Watch loop started");
    }

    async fn watch_loop(self: Arc<Self>, epoch: u64) {
        let interval = self.config.poll_interval();
        loop {
            tokio::time::sleep(interval).await;

            let snapshot: Vec<(PartKey, u64, TransferHandle)> = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.watch_epoch != epoch {
                    return;
                }
                if state.in_flight.is_empty() {
                    state.watching = false;
                    state.watch_task = None;
                    debug!(epoch, "Watch loop stopped");
                    return;
                }
                state
                    .in_flight
                    .iter()
                    .filter(|(key, _)| !state.is_moving(key))
                    .map(|(key, entry)| (key.clone(), entry.generation, entry.handle.clone()))
                    .collect()
            };

            // External queries run without the lock.
            let polled: Vec<_> = snapshot
                .into_iter()
                .map(|(key, generation, handle)| {
                    let check = self.backend(handle.kind()).poll(&handle);
                    (key, generation, check)
                })
                .collect();

            {
                let mut effects = Effects::default();
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.watch_epoch != epoch {
                    return;
                }
                for (key, generation, check) in polled {
                    self.apply_check(state, &key, generation, check, &mut effects);
                }
                self.admit(state, &mut effects);
                self.apply(guard, effects);
            }
        }
    }

    fn apply_check(
        self: &Arc<Self>,
        state: &mut QueueState,
        key: &PartKey,
        generation: u64,
        polled: Option<TransferCheck>,
        effects: &mut Effects,
    ) {
        let (check, download_id, kind) = match state.in_flight.get_mut(key) {
            Some(entry) if entry.generation == generation => (
                entry.pushed.take().or(polled),
                entry.handle.id(),
                entry.handle.kind(),
            ),
            _ => return,
        };

        let Some(item_idx) = state.item_index(&key.0) else {
            state.in_flight.remove(key);
            return;
        };
        let Some(part_idx) = state.items[item_idx].parts.iter().position(|p| p.id == key.1) else {
            state.in_flight.remove(key);
            return;
        };

        let part = &mut state.items[item_idx].parts[part_idx];
        if part.moving {
            return;
        }

        match check {
            None => effects.emit(QueueEvent::PartUpdated { part: part.clone() }),
            Some(TransferCheck::InProgress {
                bytes_so_far,
                total_bytes,
            }) => {
                part.bytes_downloaded = bytes_so_far;
                if total_bytes > 0 {
                    part.file_size = total_bytes;
                }
                part.progress = percent_of(bytes_so_far, total_bytes);
                effects.emit(QueueEvent::PartUpdated { part: part.clone() });
            }
            Some(TransferCheck::Successful {
                bytes_so_far,
                total_bytes,
            }) => {
                part.bytes_downloaded = bytes_so_far;
                if total_bytes > 0 {
                    part.file_size = total_bytes;
                }
                part.completed = true;
                part.progress = 100;
                self.part_succeeded(state, key, generation, kind, effects);
            }
            Some(TransferCheck::Failed { message }) => {
                self.fail_part(state, key, message, effects);
            }
            Some(TransferCheck::Missing) => {
                let message = Error::BackendMissing { download_id }.to_string();
                self.fail_part(state, key, message, effects);
            }
        }
    }

    fn part_succeeded(
        &self,
        state: &mut QueueState,
        key: &PartKey,
        generation: u64,
        kind: BackendKind,
        effects: &mut Effects,
    ) {
        let Some(item_idx) = state.item_index(&key.0) else {
            return;
        };
        let item = &mut state.items[item_idx];
        let Some(part_idx) = item.parts.iter().position(|p| p.id == key.1) else {
            return;
        };

        match kind {
            BackendKind::Streaming => {
                info!(
                    item_id = %key.0,
                    part_id = %key.1,
                    bytes = item.parts[part_idx].bytes_downloaded,
                    "Download part finished"
                );
                effects.emit(QueueEvent::PartUpdated {
                    part: item.parts[part_idx].clone(),
                });
                item.touch();
                effects.save(item);
                state.in_flight.remove(key);
                self.check_completion(state, item_idx, effects);
            }
            BackendKind::External => {
                item.parts[part_idx].moving = true;
                info!(item_id = %key.0, part_id = %key.1, "Download part finished, relocating");
                effects.emit(QueueEvent::PartUpdated {
                    part: item.parts[part_idx].clone(),
                });
                item.touch();
                effects.save(item);
                effects.relocations.push(PendingRelocation {
                    key: key.clone(),
                    generation,
                    request: RelocationRequest::for_part(item, &item.parts[part_idx]),
                });
            }
        }
    }

    fn finish_relocation(
        self: &Arc<Self>,
        key: &PartKey,
        generation: u64,
        result: std::result::Result<RelocatedFile, RelocationError>,
    ) {
        let mut effects = Effects::default();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight.get(key).map(|e| e.generation) != Some(generation) {
            debug!(item_id = %key.0, part_id = %key.1, "Ignoring stale relocation result");
            return;
        }
        let Some(item_idx) = state.item_index(&key.0) else {
            state.in_flight.remove(key);
            return;
        };

        match result {
            Ok(file) => {
                let item = &mut state.items[item_idx];
                if let Some(part) = item.part_mut(&key.1) {
                    part.moving = false;
                    part.moved = true;
                    part.final_destination_path = file.path;
                    info!(
                        item_id = %key.0,
                        part_id = %key.1,
                        path = %part.final_destination_path.display(),
                        "Download part relocated"
                    );
                    effects.emit(QueueEvent::PartUpdated { part: part.clone() });
                }
                item.touch();
                effects.save(item);
                state.in_flight.remove(key);
            }
            Err(e) => {
                if let Some(part) = state.items[item_idx].part_mut(&key.1) {
                    part.moving = false;
                }
                let message = Error::RelocationFailed(e.to_string()).to_string();
                self.fail_part(state, key, message, &mut effects);
            }
        }
        self.check_completion(state, item_idx, &mut effects);
        self.admit(state, &mut effects);
        self.apply(guard, effects);
    }

    /// Mark the item completed and schedule its scan once every part succeeded.
    fn check_completion(&self, state: &mut QueueState, item_idx: usize, effects: &mut Effects) {
        let item_id = state.items[item_idx].id.clone();
        if state.completing.contains(&item_id) || state.has_in_flight(&item_id) {
            return;
        }
        let item = &mut state.items[item_idx];
        if !item.is_finished() {
            return;
        }

        item.set_status(ItemStatus::Completed, None);
        info!(item_id = %item.id, title = %item.title, "Download item finished");
        effects.save(item);
        effects.scans.push(item.clone());
        state.completing.insert(item_id);
    }

    fn finish_completion(self: &Arc<Self>, item: &DownloadItem, scan: Option<ScanResult>) {
        let mut effects = Effects::default();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.completing.remove(&item.id) {
            debug!(item_id = %item.id, "Item cancelled while scanning");
            return;
        }
        let Some(idx) = state.item_index(&item.id) else {
            return;
        };
        state.items.remove(idx);

        info!(item_id = %item.id, scanned = scan.is_some(), "Download item completed");
        effects.remove(item.id.clone());
        effects.emit(QueueEvent::ItemCompleted(CompletionPayload {
            item_id: item.id.clone(),
            local_folder_id: item.local_folder.id.clone(),
            scan,
        }));
        self.admit(state, &mut effects);
        self.apply(guard, effects);
    }

    /// Fail one part: cancel and clean it, pause its siblings, fail the item.
    fn fail_part(&self, state: &mut QueueState, key: &PartKey, message: String, effects: &mut Effects) {
        let (item_id, part_id) = key;
        if let Some(entry) = state.in_flight.remove(key) {
            self.cancel_handle(&entry.handle);
        }

        let mut siblings = Vec::new();
        for sibling in state.in_flight_keys_for(item_id) {
            if let Some(entry) = state.in_flight.remove(&sibling) {
                self.cancel_handle(&entry.handle);
            }
            siblings.push(sibling.1);
        }

        let Some(item) = state.items.iter_mut().find(|i| &i.id == item_id) else {
            return;
        };
        warn!(
            item_id = %item_id,
            part_id = %part_id,
            paused_siblings = siblings.len(),
            error = %message,
            "Download part failed"
        );

        let mut failed = None;
        for part in &mut item.parts {
            if &part.id == part_id {
                fs::remove_artifacts(&part.artifact_paths());
                part.reset_transfer();
                part.failed = true;
                part.paused = true;
                part.error_message = Some(message.clone());
                effects.emit(QueueEvent::PartUpdated { part: part.clone() });
                failed = Some(part.clone());
            } else if siblings.contains(&part.id) {
                fs::remove_artifacts(&part.artifact_paths());
                part.reset_transfer();
                part.paused = true;
                effects.emit(QueueEvent::PartUpdated { part: part.clone() });
            } else if !part.completed {
                part.paused = true;
            }
        }

        let Some(part) = failed else {
            return;
        };
        item.set_status(ItemStatus::Failed, Some(message.clone()));
        effects.save(item);
        effects.emit(QueueEvent::ItemFailed {
            item: item.clone(),
            part,
            message,
        });
    }

    /// Release the state lock, then persist, notify and start deferred work.
    ///
    /// The ordering lock is taken before `state` is released, so batches reach
    /// the store and subscribers in the order their state changes were made.
    fn apply(self: &Arc<Self>, state: MutexGuard<'_, QueueState>, effects: Effects) {
        let _order = self.apply_order.lock();
        drop(state);

        for item in &effects.saves {
            if let Err(e) = self.store.save_item(item) {
                error!(item_id = %item.id, error = %e, "Failed to persist download item");
            }
        }
        for item_id in &effects.removals {
            if let Err(e) = self.store.remove_item(item_id) {
                error!(item_id = %item_id, error = %e, "Failed to remove download item");
            }
        }
        for event in effects.events {
            // No subscribers is fine.
            let _ = self.event_tx.send(event);
        }

        for pending in effects.relocations {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let result = relocate_and_reconcile(inner.relocation.as_ref(), pending.request).await;
                inner.finish_relocation(&pending.key, pending.generation, result);
            });
        }

        for item in effects.scans {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let scan = inner.scanner.scan_completed_item(&item).await;
                inner.finish_completion(&item, scan);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TransferQuery, TransferRequest, TransferStatus};
    use crate::model::{DownloadItemPart, LocalFolder};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Transfers that never finish.
    #[derive(Default)]
    struct EndlessService {
        next_id: AtomicI64,
    }

    impl ExternalTransferService for EndlessService {
        fn submit(&self, _request: &TransferRequest) -> Result<i64> {
            Ok(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
        }

        fn query(&self, _download_id: i64) -> Option<TransferQuery> {
            Some(TransferQuery {
                status: TransferStatus::Running,
                bytes_so_far: 0,
                total_bytes: 0,
                failure_reason: None,
            })
        }

        fn cancel(&self, _download_id: i64) {}
    }

    struct NoRelocation;

    #[async_trait]
    impl RelocationService for NoRelocation {
        async fn relocate(
            &self,
            _request: RelocationRequest,
        ) -> std::result::Result<RelocatedFile, RelocationError> {
            Err(RelocationError::new(0, "unused"))
        }

        async fn rename(
            &self,
            _file: &RelocatedFile,
            _name: &str,
        ) -> std::result::Result<RelocatedFile, RelocationError> {
            Err(RelocationError::new(0, "unused"))
        }
    }

    fn manager(max_concurrent: usize) -> DownloadQueueManager {
        DownloadQueueManager::new(
            QueueConfig::default().with_max_concurrent(max_concurrent),
            Arc::new(EndlessService::default()),
            Arc::new(NoRelocation),
        )
        .unwrap()
    }

    fn item(id: &str, parts: usize) -> DownloadItem {
        let parts = (0..parts)
            .map(|n| {
                DownloadItemPart::new(
                    format!("{id}-p{n}"),
                    id,
                    format!("{n}.mp3"),
                    format!("http://server/{id}/{n}"),
                    format!("/nonexistent/itemdl/staging/{id}-{n}"),
                    format!("/nonexistent/itemdl/final/{id}/{n}.mp3"),
                )
            })
            .collect();
        DownloadItem::new(id, id, LocalFolder::new("folder", "/nonexistent/itemdl/final"), parts)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates_and_empty_items() {
        let manager = manager(3);
        manager.enqueue(item("a", 1)).unwrap();

        let err = manager.enqueue(item("a", 2)).unwrap_err();
        assert!(matches!(err, Error::DuplicateItem(id) if id == "a"));

        let err = manager.enqueue(item("b", 0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut dup_parts = item("c", 1);
        dup_parts.parts.push(dup_parts.parts[0].clone());
        assert!(matches!(
            manager.enqueue(dup_parts).unwrap_err(),
            Error::Validation(_)
        ));

        assert_eq!(manager.items().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_loop_starts_with_work_and_stops_on_shutdown() {
        let manager = manager(2);
        assert!(!manager.is_watching());

        manager.enqueue(item("a", 3)).unwrap();
        assert!(manager.is_watching());
        assert_eq!(manager.in_flight_count(), 2);

        manager.shutdown();
        assert!(!manager.is_watching());
        assert_eq!(manager.in_flight_count(), 0);

        let stopped = manager.item("a").unwrap();
        assert_eq!(stopped.status, ItemStatus::Stopped);
        assert!(stopped.parts.iter().all(|p| p.paused && p.download_id.is_none()));

        assert!(manager.resume("a"));
        assert_eq!(manager.in_flight_count(), 2);
        assert_eq!(manager.item("a").unwrap().status, ItemStatus::Active);
    }

    #[tokio::test]
    async fn test_late_fetch_events_from_replaced_transfer_are_ignored() {
        let manager = manager(2);
        let mut internal = item("a", 1);
        internal.parts[0] = internal.parts[0].clone().internal();
        manager.enqueue(internal).unwrap();

        let key: PartKey = ("a".into(), "a-p0".into());
        let generation = |m: &DownloadQueueManager| {
            m.inner.state.lock().in_flight.get(&key).map(|e| e.generation)
        };
        let stale = generation(&manager).unwrap();

        manager.shutdown();
        assert!(manager.retry("a"));
        let current = generation(&manager).unwrap();
        assert_ne!(stale, current);

        manager.inner.on_fetch_event(
            &key,
            stale,
            FetchEvent::Progress {
                bytes_written: 512,
                percent: 50,
                total: 1024,
            },
        );
        manager.inner.on_fetch_event(
            &key,
            stale,
            FetchEvent::Failed {
                message: "connection reset".into(),
            },
        );

        {
            let state = manager.inner.state.lock();
            let entry = state.in_flight.get(&key).unwrap();
            assert_eq!(entry.generation, current);
            assert!(entry.pushed.is_none());
        }
        let part = manager.item("a").unwrap().parts[0].clone();
        assert_eq!(part.bytes_downloaded, 0);
        assert_eq!(part.progress, 0);
        assert!(!part.failed && !part.paused);

        manager.inner.on_fetch_event(
            &key,
            current,
            FetchEvent::Progress {
                bytes_written: 256,
                percent: 25,
                total: 1024,
            },
        );
        let part = manager.item("a").unwrap().parts[0].clone();
        assert_eq!(part.bytes_downloaded, 256);
        assert_eq!(part.progress, 25);

        manager.shutdown();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_in_flight_never_exceeds_ceiling(
            max_concurrent in 1usize..5,
            part_counts in prop::collection::vec(1usize..5, 1..6),
            cancels in prop::collection::vec(any::<prop::sample::Index>(), 0..4),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let manager = manager(max_concurrent);
                let mut queued_parts = 0usize;

                for (n, count) in part_counts.iter().enumerate() {
                    manager.enqueue(item(&format!("item-{n}"), *count)).unwrap();
                    queued_parts += count;
                    assert!(manager.in_flight_count() <= max_concurrent);
                    assert_eq!(manager.in_flight_count(), queued_parts.min(max_concurrent));
                }

                for index in cancels {
                    let items = manager.items();
                    if items.is_empty() {
                        break;
                    }
                    let target = &items[index.index(items.len())];
                    queued_parts -= target.parts.len();
                    assert!(manager.cancel(&target.id, false));
                    assert_eq!(manager.in_flight_count(), queued_parts.min(max_concurrent));
                }
            });
        }
    }
}
