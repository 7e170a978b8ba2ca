//! Fan-out of device and job events to any number of observers.
//!
//! Each subscriber gets its own bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the event is dropped for that subscriber only,
//! so a slow observer can never stall a copy.

use crate::device::{Device, DeviceId};
use crate::error::JobError;
use crate::job::JobStatus;
use crate::progress::ProgressSample;
use crate::util::lock;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Capacity of each subscriber queue unless configured otherwise.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something an observer may want to render.
#[derive(Clone, Debug)]
pub enum Event {
    /// A new device was registered and given a job.
    DeviceAttached(Device),
    /// A device was confirmed gone and its job removed.
    DeviceDetached(DeviceId),
    /// A job moved to a new state. `error` is set for `Failed`, and for a
    /// `Canceled` job that could not start.
    Status {
        device: DeviceId,
        status: JobStatus,
        error: Option<Arc<JobError>>,
    },
    /// A job finished another file. `progress` never decreases within a run.
    Progress {
        device: DeviceId,
        progress: f64,
        sample: ProgressSample,
    },
}

impl Event {
    pub fn device(&self) -> &DeviceId {
        match self {
            Event::DeviceAttached(device) => &device.id,
            Event::DeviceDetached(id) => id,
            Event::Status { device, .. } | Event::Progress { device, .. } => device,
        }
    }
}

/// Broadcasts [`Event`]s to every live subscriber.
///
/// Cloning the bus is cheap; all clones share the same subscriber list.
#[derive(Clone, Debug)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new observer. It sees events published from now on.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Delivers `event` to every subscriber that has room for it.
    ///
    /// Subscribers whose receiver was dropped are forgotten.
    pub fn publish(&self, event: Event) {
        lock(&self.subscribers).retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(device = %event.device(), "subscriber queue full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
