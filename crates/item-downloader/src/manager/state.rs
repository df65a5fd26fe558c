//! State guarded by the queue monitor, and the side effects collected while
//! holding it.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;

use crate::backend::{TransferCheck, TransferHandle};
use crate::events::QueueEvent;
use crate::model::DownloadItem;
use crate::relocation::RelocationRequest;

/// `(item_id, part_id)`.
pub(crate) type PartKey = (String, String);

/// A part whose transfer or relocation is active.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Admission generation. Late callbacks carrying an older one are ignored.
    pub generation: u64,
    pub handle: TransferHandle,
    /// Terminal disposition pushed by a streaming transfer, applied by the
    /// next watch pass.
    pub pushed: Option<TransferCheck>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// FIFO item queue.
    pub items: Vec<DownloadItem>,
    pub in_flight: HashMap<PartKey, InFlight>,
    /// Items whose completion scan is running.
    pub completing: HashSet<String>,
    pub next_generation: u64,
    pub watching: bool,
    /// Bumped whenever a watch loop is started or stopped from outside.
    pub watch_epoch: u64,
    pub watch_task: Option<JoinHandle<()>>,
}

impl QueueState {
    pub fn item_index(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == item_id)
    }

    pub fn in_flight_keys_for(&self, item_id: &str) -> Vec<PartKey> {
        self.in_flight
            .keys()
            .filter(|(id, _)| id == item_id)
            .cloned()
            .collect()
    }

    pub fn has_in_flight(&self, item_id: &str) -> bool {
        self.in_flight.keys().any(|(id, _)| id == item_id)
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn is_moving(&self, key: &PartKey) -> bool {
        self.items
            .iter()
            .find(|i| i.id == key.0)
            .and_then(|i| i.part(&key.1))
            .is_some_and(|p| p.moving)
    }
}

/// Relocation to start once the lock is released.
#[derive(Debug)]
pub(crate) struct PendingRelocation {
    pub key: PartKey,
    pub generation: u64,
    pub request: RelocationRequest,
}

/// Work gathered under the lock and performed after it is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub events: Vec<QueueEvent>,
    pub saves: Vec<DownloadItem>,
    pub removals: Vec<String>,
    pub relocations: Vec<PendingRelocation>,
    pub scans: Vec<DownloadItem>,
}

impl Effects {
    pub fn emit(&mut self, event: QueueEvent) {
        self.events.push(event);
    }

    pub fn save(&mut self, item: &DownloadItem) {
        self.saves.push(item.clone());
    }

    pub fn remove(&mut self, item_id: impl Into<String>) {
        self.removals.push(item_id.into());
    }
}
