//! The top-level service tying discovery, jobs and removal detection together.
//!
//! A [`Duplicator`] runs one monitor thread for its whole lifetime. Every
//! device the monitor reports gets a [`Job`] and a [`DisconnectWatcher`],
//! registered together in the [`Registry`]; the watcher removes both once the
//! device is pulled out.

use crate::copy::PACING_DELAY;
use crate::device::{Device, DeviceId, DeviceSource};
use crate::event::{DEFAULT_EVENT_CAPACITY, Event, EventBus};
use crate::job::{Job, JobSnapshot, JobStatus, JobTemplate};
use crate::monitor::DeviceMonitor;
use crate::registry::{Registration, Registry};
use crate::util::lock;
use crate::volume::{FileSystemKind, VolumeService};
use crate::watcher::DisconnectWatcher;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the device list and each device's readiness are polled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Clone, Debug)]
pub struct DuplicatorConfig {
    pub poll_interval: Duration,
    /// Delay after each copied file.
    pub pace: Duration,
    /// Queue length of each event subscriber.
    pub event_capacity: usize,
    /// Start a job as soon as its device is attached.
    pub auto_start: bool,
}

impl Default for DuplicatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            pace: PACING_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auto_start: true,
        }
    }
}

struct Shared {
    config: DuplicatorConfig,
    registry: Arc<Registry>,
    devices: Arc<dyn DeviceSource>,
    volumes: Arc<dyn VolumeService>,
    events: EventBus,
    template: Mutex<JobTemplate>,
}

impl Shared {
    fn run_monitor(&self, stopped: Receiver<()>) {
        let mut monitor = DeviceMonitor::new(Arc::clone(&self.devices), Arc::clone(&self.registry));
        loop {
            for device in monitor.poll().attached {
                self.attach(device);
            }
            match stopped.recv_timeout(self.config.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("monitor stopped");
    }

    fn attach(&self, device: Device) {
        let id = device.id.clone();
        let job = Arc::new(Job::new(
            id.clone(),
            Arc::clone(&self.volumes),
            self.events.clone(),
            self.config.pace,
        ));

        let watcher = DisconnectWatcher {
            device: id.clone(),
            job: Arc::clone(&job),
            devices: Arc::clone(&self.devices),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            interval: self.config.poll_interval,
        };
        let watcher = match watcher.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                // Not registered, so the next poll tries again.
                warn!(device = %id, error = %err, "could not start watcher");
                return;
            }
        };

        let registration = Registration {
            job: Arc::clone(&job),
            watcher,
        };
        // Published under the registry lock so the watcher, which cannot see
        // the entry before then, never reports the removal first.
        let inserted = self
            .registry
            .insert_if_absent_then(id.clone(), registration, || {
                info!(device = %id, node = %device.node.display(), "device attached");
                self.events.publish(Event::DeviceAttached(device.clone()));
            });
        if let Err(mut rejected) = inserted {
            debug!(device = %id, "device already registered");
            rejected.watcher.join();
            return;
        }

        if self.config.auto_start {
            job.start(self.template());
        }
    }

    fn template(&self) -> JobTemplate {
        lock(&self.template).clone()
    }
}

/// Duplicates a source tree onto every removable device that is plugged in.
///
/// Dropping the duplicator shuts it down; see [`Duplicator::shutdown`].
pub struct Duplicator {
    shared: Arc<Shared>,
    stop: Option<Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Duplicator {
    /// Starts watching for devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor thread cannot be spawned.
    pub fn spawn(
        config: DuplicatorConfig,
        template: JobTemplate,
        devices: Arc<dyn DeviceSource>,
        volumes: Arc<dyn VolumeService>,
    ) -> io::Result<Self> {
        let events = EventBus::new(config.event_capacity);
        Self::spawn_with_events(config, template, devices, volumes, events)
    }

    /// Like [`Duplicator::spawn`], publishing on an existing bus so that
    /// subscribers registered beforehand see the very first attach.
    pub fn spawn_with_events(
        config: DuplicatorConfig,
        template: JobTemplate,
        devices: Arc<dyn DeviceSource>,
        volumes: Arc<dyn VolumeService>,
        events: EventBus,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            config,
            registry: Arc::new(Registry::new()),
            devices,
            volumes,
            events,
            template: Mutex::new(template),
        });

        let (stop, stopped) = crossbeam_channel::bounded(0);
        let worker = Arc::clone(&shared);
        let monitor = thread::Builder::new()
            .name("drivedup-monitor".to_string())
            .spawn(move || worker.run_monitor(stopped))?;

        info!(
            source = %shared.template().source.display(),
            poll_ms = shared.config.poll_interval.as_millis() as u64,
            "duplicator started"
        );
        Ok(Self {
            shared,
            stop: Some(stop),
            monitor: Some(monitor),
        })
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &DuplicatorConfig {
        &self.shared.config
    }

    /// Starts (or restarts) the job for `id` with the current template.
    /// Returns `false` if the device is unknown or its job is already running.
    pub fn start(&self, id: &DeviceId) -> bool {
        match self.shared.registry.get(id) {
            Some(job) => job.start(self.shared.template()),
            None => false,
        }
    }

    /// Returns `false` if the device is unknown or its job is not running.
    pub fn cancel(&self, id: &DeviceId) -> bool {
        self.shared
            .registry
            .get(id)
            .is_some_and(|job| job.cancel())
    }

    pub fn status(&self, id: &DeviceId) -> Option<JobStatus> {
        self.shared.registry.get(id).map(|job| job.status())
    }

    pub fn progress(&self, id: &DeviceId) -> Option<f64> {
        self.shared.registry.get(id).map(|job| job.progress())
    }

    pub fn snapshot(&self, id: &DeviceId) -> Option<JobSnapshot> {
        self.shared.registry.get(id).map(|job| job.snapshot())
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> HashSet<DeviceId> {
        self.shared.registry.filter(status)
    }

    /// Devices that currently have a job, sorted.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.shared.registry.ids()
    }

    /// Replaces the template used by every job started from now on.
    pub fn set_template(&self, template: JobTemplate) {
        info!(source = %template.source.display(), format = template.format.is_some(), "template updated");
        *lock(&self.shared.template) = template;
    }

    pub fn template(&self) -> JobTemplate {
        self.shared.template()
    }

    pub fn available_filesystems(&self) -> anyhow::Result<Vec<FileSystemKind>> {
        self.shared.volumes.available_filesystems()
    }

    /// Stops the monitor, retires every job and waits for every thread.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.stop.take();
        let Some(monitor) = self.monitor.take() else {
            return;
        };
        if monitor.join().is_err() {
            warn!("monitor thread panicked");
        }

        let entries = self.shared.registry.drain();
        for (_, registration) in &entries {
            registration.job.retire();
        }
        for (id, mut registration) in entries {
            registration.watcher.join();
            registration.job.join();
            debug!(device = %id, "device released");
        }
        info!("duplicator stopped");
    }
}

impl Drop for Duplicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
