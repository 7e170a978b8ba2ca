use crate::platform;
use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

/// The stable identity of a volume: the root path it is reachable under.
///
/// Jobs and watchers hold a `DeviceId`, never a live handle, because the
/// volume behind it can disappear at any moment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(PathBuf);

impl DeviceId {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    pub fn root(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for DeviceId {
    fn from(root: PathBuf) -> Self {
        Self(root)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Removable,
    Fixed,
}

/// A mounted volume discovered on the system.
///
/// It is populated by the platform-specific discovery functions in the
/// [`crate::platform`] module.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: DeviceId,
    /// The OS node backing the volume (e.g. `/dev/sdb1` or `E:\`).
    pub node: PathBuf,
    /// The volume label, or an empty string when there is none.
    pub label: String,
    /// The filesystem the volume currently carries (e.g. "vfat").
    pub file_system: String,
    pub kind: DeviceKind,
    /// Whether the root directory could be opened when the device was listed.
    pub ready: bool,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if !self.label.is_empty() {
            format!("[{}]", self.label)
        } else {
            "[No label]".to_string()
        };

        write!(
            f,
            "{:<15} {:.1} GB {} {}",
            self.id,
            self.size_gb(),
            self.file_system,
            label
        )
    }
}

/// Where device lists and readiness come from.
///
/// Both calls may block on the OS. Errors are expected to be transient: the
/// monitor and watchers log them and ask again on their next cycle.
pub trait DeviceSource: Send + Sync {
    /// Removable volumes currently attached, excluding the one this process runs from.
    fn removable_devices(&self) -> Result<Vec<Device>>;

    /// Whether the volume is still attached and its root can be opened.
    fn is_ready(&self, id: &DeviceId) -> Result<bool>;
}

/// Devices as reported by the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDevices;

impl DeviceSource for SystemDevices {
    fn removable_devices(&self) -> Result<Vec<Device>> {
        platform::get_removable_devices()
    }

    fn is_ready(&self, id: &DeviceId) -> Result<bool> {
        platform::is_volume_ready(id.root())
    }
}
