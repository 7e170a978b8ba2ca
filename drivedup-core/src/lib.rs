//! The core, UI-agnostic library for the `drivedup` thumb-drive duplicator.
//!
//! `drivedup-core` watches for removable volumes and, for each one that is
//! plugged in, runs a job that optionally formats the volume and then copies
//! a source tree onto it. It can back any front-end, whether a command-line
//! interface (like `drivedup`) or a graphical one.
//!
//! The library is structured into several key modules:
//! - [`device`]: The cross-platform `Device` struct and the [`device::DeviceSource`] seam.
//! - [`platform`]: Platform-specific device discovery and volume formatting.
//! - [`volume`]: Filesystem kinds, format options and file enumeration.
//! - [`mod@copy`]: The format-then-copy routine, reporting progress via callbacks.
//! - [`job`]: The per-device state machine running that routine on its own thread.
//! - [`registry`], [`monitor`], [`watcher`]: Device bookkeeping and attach/removal detection.
//! - [`duplicator`]: The service that wires all of the above together.
//! - [`event`]: The event bus observers subscribe to.
//!
//! The primary entry point is [`Duplicator::spawn`]. Progress is reported as
//! [`Event`]s, allowing the calling application to display it in any way it
//! chooses.
//!
//! ## Example: Copying a Folder onto Every Attached Drive
//!
//! ```rust,no_run
//! use drivedup_core::{
//!     Duplicator, DuplicatorConfig, Event, JobTemplate, SystemDevices, SystemVolumes,
//! };
//! use std::sync::Arc;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let template = JobTemplate::copy_only("path/to/master");
//!     let mut duplicator = Duplicator::spawn(
//!         DuplicatorConfig::default(),
//!         template,
//!         Arc::new(SystemDevices),
//!         Arc::new(SystemVolumes),
//!     )?;
//!     let events = duplicator.subscribe();
//!
//!     for event in events.iter().take(100) {
//!         match event {
//!             Event::Progress { device, progress, .. } => {
//!                 println!("{}: {:.0}%", device, progress * 100.0);
//!             }
//!             Event::Status { device, status, .. } => println!("{}: {}", device, status),
//!             _ => {}
//!         }
//!     }
//!
//!     duplicator.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod copy;
pub mod device;
pub mod duplicator;
pub mod error;
pub mod event;
pub mod job;
pub mod monitor;
pub mod platform;
pub mod progress;
pub mod registry;
mod util;
pub mod volume;
pub mod watcher;

pub use device::{Device, DeviceId, DeviceKind, DeviceSource, SystemDevices};
pub use duplicator::{Duplicator, DuplicatorConfig};
pub use error::JobError;
pub use event::{Event, EventBus};
pub use job::{Job, JobSnapshot, JobStatus, JobTemplate};
pub use progress::ProgressSample;
pub use volume::{FileSystemKind, FormatOptions, SystemVolumes, VolumeService};
