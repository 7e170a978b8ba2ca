//! Contains the logic for running one format-and-copy pass against a device.
//!
//! A pass has up to two stages:
//! 1.  Optionally formatting (and labelling) the device through a [`VolumeService`].
//! 2.  Copying every file of the source tree onto the device root, overwriting
//!     whatever is already there under the same relative path.
use crate::cancel::CancelToken;
use crate::device::DeviceId;
use crate::error::{JobError, Result};
use crate::job::JobStatus;
use crate::progress::ProgressSample;
use crate::volume::{FormatOptions, VolumeService, enumerate_files, tree_size};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Default pause after each copied file, to bound how often progress is published.
pub const PACING_DELAY: Duration = Duration::from_millis(100);

/// How a pass ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Canceled,
}

/// The inputs of a single pass.
#[derive(Clone, Debug)]
pub struct CopyRequest<'a> {
    pub source: &'a Path,
    pub device: &'a DeviceId,
    pub format: Option<&'a FormatOptions>,
    pub pace: Duration,
}

/// Maps a file under `source` to the path it should get under `device_root`.
fn destination_for(source: &Path, file: &Path, device_root: &Path) -> PathBuf {
    let relative = file.strip_prefix(source).unwrap_or(file);
    // Only the normal components are kept so the result can never escape the device root.
    let relative: PathBuf = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    device_root.join(relative)
}

/// Copies one file in a single read and a single write, replacing any existing
/// file at `to`. Returns the number of bytes written.
fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    let copy_err = |source| JobError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(copy_err)?;
    }
    if to.is_file() {
        fs::remove_file(to).map_err(copy_err)?;
    }
    let contents = fs::read(from).map_err(copy_err)?;
    fs::write(to, &contents).map_err(copy_err)?;
    Ok(contents.len() as u64)
}

/// Formats the device if requested, then copies the source tree onto it.
///
/// This is the body of a job. It reports stage changes and per-file progress
/// via callbacks and leaves bookkeeping to the caller.
///
/// # Arguments
///
/// * `request` - The source directory, target device, format options and pacing delay.
/// * `volumes` - The service used to format and label the device. Never touched
///   when `request.format` is `None`.
/// * `cancel` - Checked before formatting and before each file. When set the pass
///   stops at the next file boundary and returns [`Outcome::Canceled`].
/// * `on_stage` - Closure called with [`JobStatus::Formatting`] and
///   [`JobStatus::Copying`] as those stages begin.
/// * `on_progress` - Closure called after every copied file with the running totals.
///
/// # Errors
///
/// This function will return an error if:
/// - The source directory or the device root does not exist ([`JobError::Precondition`]).
/// - Formatting or labelling fails ([`JobError::VolumeService`]).
/// - The source tree cannot be sized ([`JobError::Scan`]).
/// - Any file cannot be read or written ([`JobError::Copy`]).
pub fn run<F1, F2>(
    request: &CopyRequest<'_>,
    volumes: &dyn VolumeService,
    cancel: &CancelToken,
    mut on_stage: F1,
    mut on_progress: F2,
) -> Result<Outcome>
where
    F1: FnMut(JobStatus),
    F2: FnMut(&ProgressSample),
{
    let source = request.source;
    let device_root = request.device.root();

    if !source.is_dir() {
        return Err(JobError::Precondition(source.to_path_buf()));
    }
    if !device_root.is_dir() {
        return Err(JobError::Precondition(device_root.to_path_buf()));
    }
    if cancel.is_cancelled() {
        return Ok(Outcome::Canceled);
    }

    if let Some(options) = request.format {
        on_stage(JobStatus::Formatting);
        let label = options.sanitized_label();
        volumes
            .format_volume(request.device, options.filesystem, &label)
            .map_err(|e| JobError::volume(device_root, e))?;
        if !label.is_empty() {
            volumes
                .label_volume(request.device, &label)
                .map_err(|e| JobError::volume(device_root, e))?;
        }
        info!(device = %request.device, filesystem = %options.filesystem, "format complete");
    }

    on_stage(JobStatus::Copying);
    let total = tree_size(source).map_err(|e| JobError::Scan {
        path: source.to_path_buf(),
        source: e,
    })?;
    debug!(device = %request.device, total, "source tree sized");

    let mut sample = ProgressSample::new(total);
    for file in enumerate_files(source, "*", true) {
        if cancel.is_cancelled() {
            return Ok(Outcome::Canceled);
        }

        let target = destination_for(source, &file, device_root);
        let written = copy_file(&file, &target)?;
        sample = sample.advance(written, target);
        on_progress(&sample);

        if !request.pace.is_zero() {
            thread::sleep(request.pace);
        }
    }

    Ok(Outcome::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::FileSystemKind;
    use anyhow::anyhow;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingVolumes {
        calls: Mutex<Vec<String>>,
        fail_format: bool,
    }

    impl VolumeService for RecordingVolumes {
        fn format_volume(
            &self,
            volume: &DeviceId,
            filesystem: FileSystemKind,
            label: &str,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("format {volume} {filesystem} {label}"));
            if self.fail_format {
                return Err(anyhow!("Failed to format drive"));
            }
            Ok(())
        }

        fn label_volume(&self, volume: &DeviceId, label: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("label {volume} {label}"));
            Ok(())
        }

        fn available_filesystems(&self) -> anyhow::Result<Vec<FileSystemKind>> {
            Ok(FileSystemKind::ALL.to_vec())
        }
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![b'a'; 100]).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/c"), vec![b'c'; 300]).unwrap();
        dir
    }

    fn request<'a>(
        source: &'a Path,
        device: &'a DeviceId,
        format: Option<&'a FormatOptions>,
    ) -> CopyRequest<'a> {
        CopyRequest {
            source,
            device,
            format,
            pace: Duration::ZERO,
        }
    }

    #[test]
    fn copies_the_tree_and_reaches_full_progress() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let volumes = RecordingVolumes::default();
        let mut stages = Vec::new();
        let mut samples = Vec::new();

        let outcome = run(
            &request(source.path(), &device, None),
            &volumes,
            &CancelToken::new(),
            |s| stages.push(s),
            |p| samples.push(p.clone()),
        )
        .unwrap();

        assert_eq!(outcome, Outcome::Finished);
        assert_eq!(stages, [JobStatus::Copying]);
        assert_eq!(fs::read(dest.path().join("a")).unwrap(), vec![b'a'; 100]);
        assert_eq!(fs::read(dest.path().join("b/c")).unwrap(), vec![b'c'; 300]);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 2);

        let copied: Vec<u64> = samples.iter().map(|s| s.copied_bytes).collect();
        assert_eq!(copied, [100, 400]);
        assert_eq!(samples.last().unwrap().fraction(), 1.0);
        assert!(volumes.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn existing_files_are_overwritten() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        fs::write(dest.path().join("a"), b"stale contents that are longer than nothing").unwrap();
        fs::write(dest.path().join("keep"), b"untouched").unwrap();
        let device = DeviceId::new(dest.path());

        run(
            &request(source.path(), &device, None),
            &RecordingVolumes::default(),
            &CancelToken::new(),
            |_| {},
            |_| {},
        )
        .unwrap();

        assert_eq!(fs::read(dest.path().join("a")).unwrap(), vec![b'a'; 100]);
        assert_eq!(fs::read(dest.path().join("keep")).unwrap(), b"untouched");
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let options = FormatOptions::default();
        let volumes = RecordingVolumes::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = run(
            &request(source.path(), &device, Some(&options)),
            &volumes,
            &cancel,
            |_| {},
            |_| {},
        )
        .unwrap();

        assert_eq!(outcome, Outcome::Canceled);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
        assert!(volumes.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn cancellation_stops_at_the_next_file() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let cancel = CancelToken::new();
        let mut samples = Vec::new();

        let outcome = run(
            &request(source.path(), &device, None),
            &RecordingVolumes::default(),
            &cancel,
            |_| {},
            |p| {
                samples.push(p.clone());
                cancel.cancel();
            },
        )
        .unwrap();

        assert_eq!(outcome, Outcome::Canceled);
        assert_eq!(samples.len(), 1);
        assert!(dest.path().join("a").exists());
        assert!(!dest.path().join("b/c").exists());
    }

    #[test]
    fn formats_and_labels_before_copying() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let options = FormatOptions::new(FileSystemKind::Fat32, "Field Kit");
        let volumes = RecordingVolumes::default();
        let mut stages = Vec::new();

        run(
            &request(source.path(), &device, Some(&options)),
            &volumes,
            &CancelToken::new(),
            |s| stages.push(s),
            |_| {},
        )
        .unwrap();

        assert_eq!(stages, [JobStatus::Formatting, JobStatus::Copying]);
        assert_eq!(
            *volumes.calls.lock().unwrap(),
            [
                format!("format {device} FAT32 FieldKit"),
                format!("label {device} FieldKit"),
            ]
        );
    }

    #[test]
    fn format_failure_skips_the_copy() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let options = FormatOptions::default();
        let volumes = RecordingVolumes {
            fail_format: true,
            ..Default::default()
        };
        let mut stages = Vec::new();

        let err = run(
            &request(source.path(), &device, Some(&options)),
            &volumes,
            &CancelToken::new(),
            |s| stages.push(s),
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, JobError::VolumeService { .. }));
        assert_eq!(stages, [JobStatus::Formatting]);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn a_write_failure_stops_the_pass_after_the_files_already_copied() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        // A directory where `b/c` should go makes the second write fail.
        fs::create_dir_all(dest.path().join("b/c")).unwrap();
        let device = DeviceId::new(dest.path());
        let mut samples = Vec::new();

        let err = run(
            &request(source.path(), &device, None),
            &RecordingVolumes::default(),
            &CancelToken::new(),
            |_| {},
            |p| samples.push(p.clone()),
        )
        .unwrap_err();

        assert!(matches!(&err, JobError::Copy { to, .. } if *to == dest.path().join("b/c")));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].fraction(), 0.25);
        assert_eq!(fs::read(dest.path().join("a")).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn missing_source_is_a_precondition_failure() {
        let dest = tempdir().unwrap();
        let device = DeviceId::new(dest.path());
        let missing = dest.path().join("nowhere");

        let err = run(
            &request(&missing, &device, None),
            &RecordingVolumes::default(),
            &CancelToken::new(),
            |_| {},
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, JobError::Precondition(path) if path == missing));
    }

    #[test]
    fn destinations_stay_under_the_device_root() {
        let root = Path::new("/media/usb");
        assert_eq!(
            destination_for(Path::new("/src"), Path::new("/src/b/c"), root),
            PathBuf::from("/media/usb/b/c")
        );
        assert_eq!(
            destination_for(Path::new("/src"), Path::new("/elsewhere/x"), root),
            PathBuf::from("/media/usb/elsewhere/x")
        );
    }
}
