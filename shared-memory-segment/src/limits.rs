use std::path::{Path, PathBuf};

use log_derive::logfn;

/// Directory the kernel exposes its shared memory tunables in.
const KERNEL_DIR: &str = "/proc/sys/kernel";

/// Error type for [`Limits::read`].
#[derive(Debug, thiserror::Error)]
pub enum LimitsError {
    /// Failed to read a limit file.
    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    /// A limit file did not hold an unsigned integer.
    #[error("Failed to parse {0}: {1:?}")]
    Parse(PathBuf, String),
}

/// The kernel's System V shared memory limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// `shmmax`, the largest segment in bytes.
    pub max_segment_size: u64,
    /// `shmall`, the total shared memory in pages.
    pub max_total_pages: u64,
    /// `shmmni`, the number of segments system wide.
    pub max_segments: u64,
}

impl Limits {
    /// Reads the limits from `/proc/sys/kernel`.
    ///
    /// # Errors
    ///
    /// When a limit file is missing or malformed.
    #[logfn(ok = "TRACE", err = "WARN")]
    pub fn read() -> Result<Self, LimitsError> {
        Self::read_from(Path::new(KERNEL_DIR))
    }

    /// Reads the limits from `shmmax`, `shmall` and `shmmni` under `dir`.
    ///
    /// # Errors
    ///
    /// When a limit file is missing or malformed.
    pub fn read_from(dir: &Path) -> Result<Self, LimitsError> {
        Ok(Self {
            max_segment_size: read_limit(&dir.join("shmmax"))?,
            max_total_pages: read_limit(&dir.join("shmall"))?,
            max_segments: read_limit(&dir.join("shmmni"))?,
        })
    }

    /// Whether a segment of `size` bytes is larger than `shmmax`.
    #[must_use]
    pub fn exceeds_max_segment_size(&self, size: usize) -> bool {
        u64::try_from(size).map_or(true, |size| size > self.max_segment_size)
    }
}

/// Reads a single unsigned integer limit.
fn read_limit(path: &Path) -> Result<u64, LimitsError> {
    let contents =
        std::fs::read_to_string(path).map_err(|err| LimitsError::Read(path.to_path_buf(), err))?;
    parse_limit(&contents).ok_or_else(|| LimitsError::Parse(path.to_path_buf(), contents))
}

fn parse_limit(contents: &str) -> Option<u64> {
    contents.trim().parse().ok()
}
