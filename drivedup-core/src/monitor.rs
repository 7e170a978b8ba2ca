use crate::device::{Device, DeviceId, DeviceKind, DeviceSource};
use crate::registry::Registry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// What changed between two polls.
#[derive(Clone, Debug, Default)]
pub struct DeviceDelta {
    /// Ready removable devices that have no job yet.
    pub attached: Vec<Device>,
    /// Devices listed by the previous poll that are gone now.
    pub detached: Vec<DeviceId>,
}

impl DeviceDelta {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Diffs the system's removable devices against the registry.
///
/// A device counts as newly attached when it is listed, ready and not
/// registered. A device whose job is formatting is never reported, since the
/// format takes it offline and brings it back under the same identity.
pub struct DeviceMonitor {
    devices: Arc<dyn DeviceSource>,
    registry: Arc<Registry>,
    previous: HashSet<DeviceId>,
}

impl DeviceMonitor {
    pub fn new(devices: Arc<dyn DeviceSource>, registry: Arc<Registry>) -> Self {
        Self {
            devices,
            registry,
            previous: HashSet::new(),
        }
    }

    pub fn poll(&mut self) -> DeviceDelta {
        let current: Vec<Device> = match self.devices.removable_devices() {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| d.ready && d.kind == DeviceKind::Removable)
                .collect(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "device enumeration failed");
                return DeviceDelta::default();
            }
        };

        let ids: HashSet<DeviceId> = current.iter().map(|d| d.id.clone()).collect();
        let mut detached: Vec<DeviceId> = self.previous.difference(&ids).cloned().collect();
        detached.sort();
        for id in &detached {
            debug!(device = %id, "device no longer listed");
        }

        let registered = self.registry.snapshot();
        let attached: Vec<Device> = current
            .into_iter()
            .filter(|d| !registered.tracked.contains(&d.id))
            .filter(|d| !registered.formatting.contains(&d.id))
            .collect();

        self.previous = ids;
        DeviceDelta { attached, detached }
    }
}
