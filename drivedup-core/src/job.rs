//! The per-device job: an optional format followed by a copy, on its own thread.
//!
//! ```text
//! Ready ──▶ Formatting ──▶ Copying ──▶ Finished
//!   │                         │    ├─▶ Canceled
//!   └─────────────────────────┘    └─▶ Failed
//! ```
//!
//! `Formatting` is skipped when no format was requested. A job in a terminal
//! state stays there until it is started again.

use crate::cancel::CancelToken;
use crate::copy::{self, CopyRequest, Outcome};
use crate::device::DeviceId;
use crate::error::JobError;
use crate::event::{Event, EventBus};
use crate::progress::ProgressSample;
use crate::util::lock;
use crate::volume::{FormatOptions, VolumeService};
use crossbeam_channel::Receiver;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Ready,
    Formatting,
    Copying,
    Finished,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Ready => "Ready",
            JobStatus::Formatting => "Formatting",
            JobStatus::Copying => "Copying",
            JobStatus::Finished => "Finished",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What the operator currently wants done to each new device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobTemplate {
    pub source: PathBuf,
    /// `None` copies onto the device as it is.
    pub format: Option<FormatOptions>,
}

impl JobTemplate {
    pub fn copy_only(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            format: None,
        }
    }

    pub fn with_format(mut self, options: FormatOptions) -> Self {
        self.format = Some(options);
        self
    }
}

/// A point-in-time view of a job.
#[derive(Clone, Debug)]
pub struct JobSnapshot {
    pub device: DeviceId,
    pub status: JobStatus,
    /// Fraction of the current run completed, in `[0.0, 1.0]`.
    pub progress: f64,
    pub sample: ProgressSample,
    pub error: Option<Arc<JobError>>,
    /// The template the current (or last) run was started with.
    pub template: JobTemplate,
}

struct JobState {
    status: JobStatus,
    progress: f64,
    sample: ProgressSample,
    error: Option<Arc<JobError>>,
    template: JobTemplate,
}

struct ActiveRun {
    cancel: CancelToken,
    /// Disconnects once the run thread has finished its work.
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct RunSlot {
    active: Option<ActiveRun>,
    /// Set once the device is gone; no run may start afterwards.
    retired: bool,
}

/// The unit of work bound to one device.
///
/// Only the job's own thread writes its status and progress; everyone else
/// reads snapshots.
pub struct Job {
    device: DeviceId,
    volumes: Arc<dyn VolumeService>,
    events: EventBus,
    pace: Duration,
    state: Mutex<JobState>,
    run: Mutex<RunSlot>,
}

impl Job {
    pub fn new(
        device: DeviceId,
        volumes: Arc<dyn VolumeService>,
        events: EventBus,
        pace: Duration,
    ) -> Self {
        Self {
            device,
            volumes,
            events,
            pace,
            state: Mutex::new(JobState {
                status: JobStatus::Ready,
                progress: 0.0,
                sample: ProgressSample::default(),
                error: None,
                template: JobTemplate::default(),
            }),
            run: Mutex::new(RunSlot::default()),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.state).status
    }

    pub fn progress(&self) -> f64 {
        lock(&self.state).progress
    }

    pub fn progress_sample(&self) -> ProgressSample {
        lock(&self.state).sample.clone()
    }

    pub fn error(&self) -> Option<Arc<JobError>> {
        lock(&self.state).error.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = lock(&self.state);
        JobSnapshot {
            device: self.device.clone(),
            status: state.status,
            progress: state.progress,
            sample: state.sample.clone(),
            error: state.error.clone(),
            template: state.template.clone(),
        }
    }

    /// Whether a run is in progress on the job thread.
    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .active
            .as_ref()
            .is_some_and(|active| !active.thread.is_finished())
    }

    pub fn is_retired(&self) -> bool {
        lock(&self.run).retired
    }

    /// Starts a run with `template`. Does nothing and returns `false` if a run
    /// is already in progress or the job has been retired.
    ///
    /// Starting again after a terminal state resets progress and error.
    pub fn start(self: &Arc<Self>, template: JobTemplate) -> bool {
        let mut run = lock(&self.run);
        if run.retired {
            debug!(device = %self.device, "job retired, not starting");
            return false;
        }
        if let Some(active) = run.active.as_ref() {
            if !active.thread.is_finished() {
                debug!(device = %self.device, "job already running");
                return false;
            }
        }
        if let Some(previous) = run.active.take() {
            let _ = previous.thread.join();
        }

        {
            let mut state = lock(&self.state);
            state.status = JobStatus::Ready;
            state.progress = 0.0;
            state.sample = ProgressSample::default();
            state.error = None;
            state.template = template.clone();
        }

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (finished, done) = crossbeam_channel::bounded::<()>(0);
        let job = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("drivedup-job {}", self.device))
            .spawn(move || {
                let _finished = finished;
                job.execute(&template, &token);
            });

        match spawned {
            Ok(thread) => {
                run.active = Some(ActiveRun {
                    cancel,
                    done,
                    thread,
                });
                true
            }
            Err(err) => {
                self.finish(JobStatus::Failed, Some(JobError::Spawn(err)));
                false
            }
        }
    }

    /// Asks a running job to stop at its next file boundary. Returns `false`
    /// if nothing was running.
    pub fn cancel(&self) -> bool {
        Self::cancel_active(&self.device, &lock(&self.run))
    }

    /// Cancels any run in progress and refuses every later [`Job::start`].
    ///
    /// Used once the device has gone away, so a restart racing with the
    /// removal cannot outlive the job's registration.
    pub fn retire(&self) {
        let mut run = lock(&self.run);
        run.retired = true;
        Self::cancel_active(&self.device, &run);
    }

    fn cancel_active(device: &DeviceId, run: &RunSlot) -> bool {
        match run.active.as_ref() {
            Some(active) if !active.thread.is_finished() => {
                info!(device = %device, "cancelling job");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Blocks until the current run, if any, has ended.
    ///
    /// The `run` lock is not held while waiting, so status queries and
    /// `cancel` stay responsive.
    pub fn join(&self) {
        let waiting = lock(&self.run)
            .active
            .as_ref()
            .map(|active| (active.done.clone(), active.thread.thread().id()));
        let Some((done, thread_id)) = waiting else {
            return;
        };
        let _ = done.recv();

        let ended = {
            let mut run = lock(&self.run);
            let same_run = run
                .active
                .as_ref()
                .is_some_and(|active| active.thread.thread().id() == thread_id);
            if same_run { run.active.take() } else { None }
        };
        if let Some(active) = ended {
            if active.thread.join().is_err() {
                warn!(device = %self.device, "job thread panicked");
            }
        }
    }

    fn execute(&self, template: &JobTemplate, cancel: &CancelToken) {
        info!(device = %self.device, source = %template.source.display(), "job started");
        let request = CopyRequest {
            source: &template.source,
            device: &self.device,
            format: template.format.as_ref(),
            pace: self.pace,
        };

        let result = copy::run(
            &request,
            self.volumes.as_ref(),
            cancel,
            |status| self.set_status(status),
            |sample| self.record_progress(sample),
        );

        match result {
            Ok(Outcome::Finished) => self.finish(JobStatus::Finished, None),
            Ok(Outcome::Canceled) => self.finish(JobStatus::Canceled, None),
            Err(err @ JobError::Precondition(_)) => self.finish(JobStatus::Canceled, Some(err)),
            Err(err) => self.finish(JobStatus::Failed, Some(err)),
        }
    }

    fn set_status(&self, status: JobStatus) {
        lock(&self.state).status = status;
        info!(device = %self.device, %status, "job status changed");
        self.events.publish(Event::Status {
            device: self.device.clone(),
            status,
            error: None,
        });
    }

    fn record_progress(&self, sample: &ProgressSample) {
        let progress = {
            let mut state = lock(&self.state);
            state.progress = state.progress.max(sample.fraction());
            state.sample = sample.clone();
            state.progress
        };
        debug!(
            device = %self.device,
            copied = sample.copied_bytes,
            total = sample.total_bytes,
            "file copied"
        );
        self.events.publish(Event::Progress {
            device: self.device.clone(),
            progress,
            sample: sample.clone(),
        });
    }

    fn finish(&self, status: JobStatus, error: Option<JobError>) {
        let error = error.map(Arc::new);
        let completed = {
            let mut state = lock(&self.state);
            state.status = status;
            state.error = error.clone();
            // A run that finished with nothing left to report still ends at 100%.
            let completed = status == JobStatus::Finished && state.progress < 1.0;
            if completed {
                state.progress = 1.0;
            }
            completed.then(|| state.sample.clone())
        };

        if let Some(sample) = completed {
            self.events.publish(Event::Progress {
                device: self.device.clone(),
                progress: 1.0,
                sample,
            });
        }

        match &error {
            Some(err) => warn!(device = %self.device, %status, error = %err, "job ended"),
            None => info!(device = %self.device, %status, "job ended"),
        }
        self.events.publish(Event::Status {
            device: self.device.clone(),
            status,
            error,
        });
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("device", &self.device)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::FileSystemKind;
    use anyhow::anyhow;
    use crossbeam_channel::Receiver;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::{TempDir, tempdir};

    /// A volume service whose format call blocks until released.
    #[derive(Default)]
    struct GatedVolumes {
        formats: AtomicUsize,
        fail: bool,
        gate: Mutex<Option<Receiver<()>>>,
    }

    impl VolumeService for GatedVolumes {
        fn format_volume(&self, _: &DeviceId, _: FileSystemKind, _: &str) -> anyhow::Result<()> {
            self.formats.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.lock().unwrap().as_ref() {
                let _ = gate.recv();
            }
            if self.fail {
                return Err(anyhow!("Failed to format drive"));
            }
            Ok(())
        }

        fn label_volume(&self, _: &DeviceId, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn available_filesystems(&self) -> anyhow::Result<Vec<FileSystemKind>> {
            Ok(Vec::new())
        }
    }

    fn source_tree() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![1u8; 100]).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/c"), vec![2u8; 300]).unwrap();
        dir
    }

    fn job_for(dest: &TempDir, volumes: Arc<GatedVolumes>, pace: Duration) -> (Arc<Job>, EventBus) {
        let events = EventBus::new(256);
        let job = Arc::new(Job::new(DeviceId::new(dest.path()), volumes, events.clone(), pace));
        (job, events)
    }

    fn wait_for(job: &Job, status: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while job.status() != status {
            assert!(Instant::now() < deadline, "job stuck in {}", job.status());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn a_copy_only_run_finishes_at_full_progress() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let volumes = Arc::new(GatedVolumes::default());
        let (job, events) = job_for(&dest, volumes.clone(), Duration::ZERO);
        let rx = events.subscribe();

        assert!(job.start(JobTemplate::copy_only(source.path())));
        job.join();

        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.progress(), 1.0);
        assert!(job.error().is_none());
        assert_eq!(volumes.formats.load(Ordering::SeqCst), 0);

        let mut last = 0.0;
        let mut statuses = Vec::new();
        for event in rx.try_iter() {
            match event {
                Event::Progress { progress, .. } => {
                    assert!(progress >= last);
                    last = progress;
                }
                Event::Status { status, .. } => statuses.push(status),
                _ => {}
            }
        }
        assert_eq!(last, 1.0);
        assert_eq!(statuses, [JobStatus::Copying, JobStatus::Finished]);
    }

    #[test]
    fn an_empty_source_still_finishes_at_full_progress() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let (job, _events) = job_for(&dest, Arc::new(GatedVolumes::default()), Duration::ZERO);

        job.start(JobTemplate::copy_only(source.path()));
        job.join();

        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.progress(), 1.0);
    }

    #[test]
    fn starting_twice_while_running_is_a_no_op() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(0);
        let volumes = Arc::new(GatedVolumes {
            gate: Mutex::new(Some(rx)),
            ..Default::default()
        });
        let (job, _events) = job_for(&dest, volumes.clone(), Duration::ZERO);
        let template = JobTemplate::copy_only(source.path()).with_format(FormatOptions::default());

        assert!(job.start(template.clone()));
        wait_for(&job, JobStatus::Formatting);
        assert!(!job.start(template));
        assert!(job.is_running());

        drop(tx);
        job.join();
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(volumes.formats.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_leaves_progress_where_it_was() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let (job, events) = job_for(
            &dest,
            Arc::new(GatedVolumes::default()),
            Duration::from_millis(200),
        );
        let rx = events.subscribe();

        job.start(JobTemplate::copy_only(source.path()));
        loop {
            if let Event::Progress { .. } = rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                break;
            }
        }
        assert!(job.cancel());
        job.join();

        assert_eq!(job.status(), JobStatus::Canceled);
        assert_eq!(job.progress(), 0.25);
        assert!(!dest.path().join("b/c").exists());
        assert!(!job.cancel());
    }

    #[test]
    fn a_failed_format_fails_the_job_without_copying() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let volumes = Arc::new(GatedVolumes {
            fail: true,
            ..Default::default()
        });
        let (job, _events) = job_for(&dest, volumes, Duration::ZERO);

        job.start(JobTemplate::copy_only(source.path()).with_format(FormatOptions::default()));
        job.join();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(matches!(
            job.error().as_deref(),
            Some(JobError::VolumeService { .. })
        ));
        assert_eq!(job.progress(), 0.0);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn a_copy_failure_keeps_the_progress_reached_so_far() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        fs::create_dir_all(dest.path().join("b/c")).unwrap();
        let (job, events) = job_for(&dest, Arc::new(GatedVolumes::default()), Duration::ZERO);
        let rx = events.subscribe();

        job.start(JobTemplate::copy_only(source.path()));
        job.join();

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 0.25);
        assert!(matches!(job.error().as_deref(), Some(JobError::Copy { .. })));

        let reported = rx.try_iter().find_map(|event| match event {
            Event::Status {
                status: JobStatus::Failed,
                error,
                ..
            } => error,
            _ => None,
        });
        assert!(matches!(reported.as_deref(), Some(JobError::Copy { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn an_unreadable_source_tree_fails_before_copying() {
        use std::os::unix::fs::PermissionsExt;

        // Permission bits do not stop root.
        if nix::unistd::Uid::effective().is_root() {
            return;
        }

        let source = source_tree();
        let locked = source.path().join("locked");
        fs::create_dir_all(locked.join("inner")).unwrap();
        fs::write(locked.join("inner/file"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let dest = tempdir().unwrap();
        let (job, _events) = job_for(&dest, Arc::new(GatedVolumes::default()), Duration::ZERO);
        job.start(JobTemplate::copy_only(source.path()));
        job.join();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert!(matches!(job.error().as_deref(), Some(JobError::Scan { .. })));
        assert_eq!(job.progress(), 0.0);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn a_retired_job_refuses_to_start() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let (job, _events) = job_for(
            &dest,
            Arc::new(GatedVolumes::default()),
            Duration::from_millis(200),
        );

        assert!(job.start(JobTemplate::copy_only(source.path())));
        wait_for(&job, JobStatus::Copying);
        job.retire();
        assert!(job.is_retired());
        assert!(!job.start(JobTemplate::copy_only(source.path())));

        job.join();
        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(!job.start(JobTemplate::copy_only(source.path())));
        assert!(!job.is_running());
    }

    #[test]
    fn queries_stay_responsive_while_a_join_waits() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let (job, _events) = job_for(
            &dest,
            Arc::new(GatedVolumes::default()),
            Duration::from_millis(300),
        );
        job.start(JobTemplate::copy_only(source.path()));
        wait_for(&job, JobStatus::Copying);

        let joiner = {
            let job = Arc::clone(&job);
            thread::spawn(move || job.join())
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(job.is_running());
        assert!(!job.start(JobTemplate::copy_only(source.path())));
        assert!(job.cancel());
        assert!(started.elapsed() < Duration::from_millis(100));

        joiner.join().unwrap();
        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(!job.is_running());
    }

    #[test]
    fn an_unreachable_source_cannot_start() {
        let dest = tempdir().unwrap();
        let (job, _events) = job_for(&dest, Arc::new(GatedVolumes::default()), Duration::ZERO);

        job.start(JobTemplate::copy_only(dest.path().join("missing")));
        job.join();

        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(matches!(job.error().as_deref(), Some(JobError::Precondition(_))));
    }

    #[test]
    fn a_finished_job_can_be_restarted() {
        let source = source_tree();
        let dest = tempdir().unwrap();
        let (job, _events) = job_for(&dest, Arc::new(GatedVolumes::default()), Duration::ZERO);

        job.start(JobTemplate::copy_only(dest.path().join("missing")));
        job.join();
        assert_eq!(job.status(), JobStatus::Canceled);

        assert!(job.start(JobTemplate::copy_only(source.path())));
        job.join();
        assert_eq!(job.status(), JobStatus::Finished);
        assert!(job.error().is_none());
        assert_eq!(job.snapshot().template.source, source.path());
    }
}
