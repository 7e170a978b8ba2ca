//! Per-device removal detection.
//!
//! Each registered device gets a watcher thread that polls the device's
//! readiness. Once the device stops being ready, the watcher retires the job,
//! waits for it, and takes the device out of the registry. A device that
//! drops out while its job is formatting is expected to come back, so the
//! watcher holds off until formatting has ended.

use crate::device::{DeviceId, DeviceSource};
use crate::event::{Event, EventBus};
use crate::job::{Job, JobStatus};
use crate::registry::Registry;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner side of a watcher thread.
///
/// Dropping the handle stops the watcher at its next wake-up without waiting
/// for it.
#[derive(Debug, Default)]
pub struct WatcherHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// A handle with no thread behind it.
    pub fn inert() -> Self {
        Self::default()
    }

    /// Signals the watcher to exit without waiting for it.
    pub fn stop(&mut self) {
        self.stop.take();
    }

    /// Stops the watcher and waits for its thread to exit.
    ///
    /// Called from the watcher's own thread this only stops it.
    pub fn join(&mut self) {
        self.stop();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("watcher thread panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Watches one device for removal on behalf of one job.
pub struct DisconnectWatcher {
    pub device: DeviceId,
    pub job: Arc<Job>,
    pub devices: Arc<dyn DeviceSource>,
    pub registry: Arc<Registry>,
    pub events: EventBus,
    pub interval: Duration,
}

impl DisconnectWatcher {
    /// Starts the watcher thread.
    ///
    /// The job need not be registered yet: the watcher keeps waiting until it
    /// first sees its job in the registry, and exits once it no longer does.
    pub fn spawn(self) -> io::Result<WatcherHandle> {
        let (stop, stopped) = crossbeam_channel::bounded(0);
        let thread = thread::Builder::new()
            .name(format!("drivedup-watch {}", self.device))
            .spawn(move || self.run(stopped))?;
        Ok(WatcherHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn run(self, stopped: Receiver<()>) {
        debug!(device = %self.device, "watcher started");
        let mut registered = false;
        loop {
            match stopped.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            if !self.is_registered() {
                if registered {
                    break;
                }
                continue;
            }
            registered = true;

            match self.devices.is_ready(&self.device) {
                Ok(true) => {}
                Ok(false) if self.job.status() == JobStatus::Formatting => {
                    debug!(device = %self.device, "device offline while formatting, waiting");
                }
                Ok(false) => {
                    self.reconcile();
                    break;
                }
                Err(err) => {
                    debug!(device = %self.device, error = %format!("{err:#}"), "readiness check failed");
                }
            }
        }
        debug!(device = %self.device, "watcher stopped");
    }

    fn is_registered(&self) -> bool {
        self.registry
            .get(&self.device)
            .is_some_and(|job| Arc::ptr_eq(&job, &self.job))
    }

    fn reconcile(&self) {
        info!(device = %self.device, "device removed");
        self.job.retire();
        self.job.join();
        self.registry.remove_job_then(&self.device, &self.job, || {
            self.events.publish(Event::DeviceDetached(self.device.clone()));
        });
    }
}
