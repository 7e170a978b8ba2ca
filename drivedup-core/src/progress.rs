use std::path::PathBuf;

/// A snapshot of how far a copy has got.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressSample {
    pub copied_bytes: u64,
    pub total_bytes: u64,
    /// The destination path of the file most recently written.
    pub current_file: Option<PathBuf>,
}

impl ProgressSample {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            copied_bytes: 0,
            total_bytes,
            current_file: None,
        }
    }

    /// Fraction copied, in `[0.0, 1.0]`. An empty source counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.copied_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).floor() as u8
    }

    pub(crate) fn advance(&self, bytes: u64, file: PathBuf) -> Self {
        Self {
            copied_bytes: self.copied_bytes + bytes,
            total_bytes: self.total_bytes,
            current_file: Some(file),
        }
    }
}
