//! Error types for a device job.
//!
//! Polling failures (device enumeration, readiness checks) never surface here;
//! they are logged and retried by the loops that hit them. Everything in this
//! module ends up attached to a job as its terminal error.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a job could not run to completion.
#[derive(Error, Debug)]
pub enum JobError {
    /// The format or label tool refused, failed, or printed something unexpected.
    #[error("volume service failed on {volume}: {message}")]
    VolumeService { volume: PathBuf, message: String },

    /// The source tree could not be sized before copying.
    #[error("could not scan source tree {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single file could not be read from the source or written to the device.
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The source directory or the device root was not reachable when the job started.
    #[error("{} is not reachable", .0.display())]
    Precondition(PathBuf),

    /// The job thread could not be spawned.
    #[error("could not start job thread: {0}")]
    Spawn(#[source] io::Error),
}

impl JobError {
    pub(crate) fn volume(volume: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        JobError::VolumeService {
            volume: volume.into(),
            message: format!("{err:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn volume_errors_keep_the_whole_context_chain() {
        let err = anyhow!("mkfs.vfat exited with status 1").context("format /dev/sdb1");
        let job_err = JobError::volume("/media/usb", err);
        assert_eq!(
            job_err.to_string(),
            "volume service failed on /media/usb: format /dev/sdb1: mkfs.vfat exited with status 1"
        );
    }

    #[test]
    fn precondition_names_the_missing_path() {
        let err = JobError::Precondition(PathBuf::from("/nope"));
        assert_eq!(err.to_string(), "/nope is not reachable");
    }
}
