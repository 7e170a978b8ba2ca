//! The volume service seam and the source-tree helpers the copy engine needs.
//!
//! Formatting and labelling are delegated to the operating system's own tools
//! through [`VolumeService`]. [`SystemVolumes`] is the real implementation and
//! forwards to [`crate::platform`]; tests substitute their own.

use crate::device::DeviceId;
use crate::platform;
use anyhow::Result;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Label applied when the operator does not choose one.
pub const DEFAULT_VOLUME_LABEL: &str = "MyVolume";

/// Filesystems a device can be formatted with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FileSystemKind {
    #[default]
    Fat,
    Fat32,
    ExFat,
    Ntfs,
    Udf,
}

impl FileSystemKind {
    /// Every kind, in the order they are offered to the operator.
    pub const ALL: [FileSystemKind; 5] = [
        FileSystemKind::Fat,
        FileSystemKind::Fat32,
        FileSystemKind::ExFat,
        FileSystemKind::Ntfs,
        FileSystemKind::Udf,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FileSystemKind::Fat => "FAT",
            FileSystemKind::Fat32 => "FAT32",
            FileSystemKind::ExFat => "exFAT",
            FileSystemKind::Ntfs => "NTFS",
            FileSystemKind::Udf => "UDF",
        }
    }

    /// Parses operator input, falling back to [`FileSystemKind::Fat`].
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileSystemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        FileSystemKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| anyhow::anyhow!("unknown filesystem '{wanted}'"))
    }
}

/// How a device should be formatted before the copy starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    pub filesystem: FileSystemKind,
    pub label: String,
}

impl FormatOptions {
    pub fn new(filesystem: FileSystemKind, label: impl Into<String>) -> Self {
        Self {
            filesystem,
            label: label.into(),
        }
    }

    /// The label with whitespace removed; format tools reject embedded spaces.
    pub fn sanitized_label(&self) -> String {
        self.label.chars().filter(|c| !c.is_whitespace()).collect()
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::new(FileSystemKind::default(), DEFAULT_VOLUME_LABEL)
    }
}

/// Formats and labels volumes.
///
/// Implementations block until the OS tool finishes. A format erases the
/// whole device, so callers must have the operator's confirmation first.
pub trait VolumeService: Send + Sync {
    fn format_volume(&self, volume: &DeviceId, filesystem: FileSystemKind, label: &str)
    -> Result<()>;

    fn label_volume(&self, volume: &DeviceId, label: &str) -> Result<()>;

    /// Kinds the host can actually produce, in [`FileSystemKind::ALL`] order.
    fn available_filesystems(&self) -> Result<Vec<FileSystemKind>>;
}

/// The host's own format and label tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemVolumes;

impl VolumeService for SystemVolumes {
    fn format_volume(
        &self,
        volume: &DeviceId,
        filesystem: FileSystemKind,
        label: &str,
    ) -> Result<()> {
        platform::format_volume(volume.root(), filesystem, label)
    }

    fn label_volume(&self, volume: &DeviceId, label: &str) -> Result<()> {
        platform::label_volume(volume.root(), label)
    }

    fn available_filesystems(&self) -> Result<Vec<FileSystemKind>> {
        platform::available_filesystems()
    }
}

/// Lazily lists the files under `root` whose names match `pattern`.
///
/// `pattern` understands `*` and `?`. Directories that cannot be read are
/// skipped rather than ending the walk. Entries are yielded in file-name order
/// within each directory so repeated runs copy in the same order.
pub fn enumerate_files<'a>(
    root: &Path,
    pattern: &'a str,
    recursive: bool,
) -> impl Iterator<Item = PathBuf> + use<'a> {
    let mut walker = WalkDir::new(root).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| matches_pattern(pattern, name))
        })
        .map(|entry| entry.into_path())
}

/// Sums the sizes of every file under `root`.
///
/// Unlike [`enumerate_files`] this fails on the first unreadable entry: a copy
/// must not start against a total it could not compute.
pub fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    glob(&pattern, &name)
}

/// Wildcard match that only ever backtracks to the most recent `*`, so it
/// runs in `O(pattern * name)` at worst.
fn glob(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    // Pattern index just past the last `*`, and the name index it was matched at.
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p + 1, n));
                p += 1;
            }
            Some('?') => {
                p += 1;
                n += 1;
            }
            Some(c) if *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match star {
                Some((after_star, matched_at)) => {
                    p = after_star;
                    n = matched_at + 1;
                    star = Some((after_star, n));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
