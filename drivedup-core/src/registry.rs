//! The single shared map from device identity to its job and watcher.
//!
//! Every mutation and every status query that the monitor relies on goes
//! through one mutex, so no thread can observe a device as both formatting
//! and absent. Lock order is registry first, then a job's own state.

use crate::device::DeviceId;
use crate::job::{Job, JobStatus};
use crate::util::lock;
use crate::watcher::WatcherHandle;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A device's job together with the watcher waiting for its removal.
#[derive(Debug)]
pub struct Registration {
    pub job: Arc<Job>,
    pub watcher: WatcherHandle,
}

/// Registry contents as seen from a single critical section.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    pub tracked: HashSet<DeviceId>,
    pub formatting: HashSet<DeviceId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<DeviceId, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `id`, returning the one it replaced.
    pub fn upsert(&self, id: DeviceId, registration: Registration) -> Option<Registration> {
        lock(&self.entries).insert(id, registration)
    }

    /// Inserts the entry only if `id` is not registered yet. On conflict the
    /// rejected registration is handed back so the caller can tear it down.
    pub fn insert_if_absent(
        &self,
        id: DeviceId,
        registration: Registration,
    ) -> Result<(), Registration> {
        self.insert_if_absent_then(id, registration, || {})
    }

    /// Like [`Registry::insert_if_absent`], running `on_inserted` before the
    /// lock is released. Nothing else can observe the new entry until it returns,
    /// so `on_inserted` must not call back into the registry.
    pub fn insert_if_absent_then(
        &self,
        id: DeviceId,
        registration: Registration,
        on_inserted: impl FnOnce(),
    ) -> Result<(), Registration> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&id) {
            return Err(registration);
        }
        entries.insert(id, registration);
        on_inserted();
        Ok(())
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Registration> {
        lock(&self.entries).remove(id)
    }

    /// Removes the entry for `id` only if it still holds `job`, so a watcher
    /// can never evict a newer registration for the same device.
    pub fn remove_job(&self, id: &DeviceId, job: &Arc<Job>) -> Option<Registration> {
        self.remove_job_then(id, job, || {})
    }

    /// Like [`Registry::remove_job`], running `on_removed` before the lock is
    /// released so that a re-registration of the same device is only seen after it.
    pub fn remove_job_then(
        &self,
        id: &DeviceId,
        job: &Arc<Job>,
        on_removed: impl FnOnce(),
    ) -> Option<Registration> {
        let mut entries = lock(&self.entries);
        let owned = entries
            .get(id)
            .is_some_and(|registration| Arc::ptr_eq(&registration.job, job));
        if !owned {
            return None;
        }
        let removed = entries.remove(id);
        on_removed();
        removed
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Job>> {
        lock(&self.entries).get(id).map(|r| Arc::clone(&r.job))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Devices whose job is currently in `status`.
    pub fn filter(&self, status: JobStatus) -> HashSet<DeviceId> {
        lock(&self.entries)
            .iter()
            .filter(|(_, r)| r.job.status() == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = lock(&self.entries);
        RegistrySnapshot {
            tracked: entries.keys().cloned().collect(),
            formatting: entries
                .iter()
                .filter(|(_, r)| r.job.status() == JobStatus::Formatting)
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }

    /// Registered devices, sorted.
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = lock(&self.entries).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Empties the registry, handing every entry to the caller for teardown.
    pub fn drain(&self) -> Vec<(DeviceId, Registration)> {
        lock(&self.entries).drain().collect()
    }
}
