//! Task descriptions and status snapshots

use std::fmt;
use std::path::PathBuf;

use super::buffer::MemoryBuffer;

/// Opaque handle to a downloader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Task(pub(crate) u64);

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Content length probe, nothing is written.
    Size,
    /// Whole resource.
    Full,
    /// Byte range of the resource.
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InProgress,
    Finished,
    Cancelled,
}

impl TaskState {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }
}

/// Byte range of a request. Negative values mean "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub offset: i64,
    pub size: i64,
}

impl Range {
    /// The whole resource.
    pub const fn full() -> Self {
        Self { offset: -1, size: -1 }
    }

    pub const fn new(offset: u64, size: u64) -> Self {
        Self {
            offset: offset as i64,
            size: size as i64,
        }
    }

    /// From `offset` to the end of the resource.
    pub const fn from(offset: u64) -> Self {
        Self {
            offset: offset as i64,
            size: -1,
        }
    }

    pub fn is_full(&self) -> bool {
        self.offset < 0 && self.size < 0
    }

    /// Number of requested bytes, if bounded.
    pub fn len(&self) -> Option<u64> {
        (self.size >= 0).then_some(self.size as u64)
    }

    pub fn start(&self) -> u64 {
        self.offset.max(0) as u64
    }

    /// `Range` header value for this range shifted by `skip` already-held bytes.
    pub(crate) fn header(&self, skip: u64) -> Option<String> {
        let start = self.start() + skip;
        match self.len() {
            Some(size) => Some(format!("bytes={}-{}", start, self.start() + size - 1)),
            None if start > 0 || self.offset >= 0 => Some(format!("bytes={}-", start)),
            None => None,
        }
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::full()
    }
}

/// Where downloaded bytes go.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Created or truncated.
    File(PathBuf),
    /// Fixed capacity buffer, written only after a complete transfer.
    Memory(MemoryBuffer),
}

/// Transport level failure classes (numbered like libcurl's codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("couldn't connect")]
    CouldNotConnect = 7,
    #[error("partial file")]
    PartialFile = 18,
    #[error("HTTP returned error")]
    HttpReturnedError = 22,
    #[error("write error")]
    WriteError = 23,
    #[error("operation timed out")]
    Timeout = 28,
    #[error("range error")]
    RangeError = 33,
    #[error("failure receiving data")]
    RecvError = 56,
}

impl TransportError {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskError {
    /// Last HTTP status seen, 0 if no response.
    pub http_code: u16,
    pub transport: Option<TransportError>,
    pub err_str: String,
    /// OS errno of a failed local write, 0 if none.
    pub file_errno: i32,
    pub error_happened: bool,
}

/// Read-only description of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: Task,
    pub task_type: TaskType,
    pub src_url: String,
    /// `None` for memory destinations and size probes.
    pub dst_path: Option<PathBuf>,
    pub range_offset: i64,
    pub range_size: i64,
    pub timeout_sec: u64,
}

/// Snapshot of a task's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub size_downloaded: u64,
    pub size_total: u64,
    pub error: TaskError,
}

impl TaskStatus {
    pub(crate) fn queued() -> Self {
        Self {
            state: TaskState::Queued,
            size_downloaded: 0,
            size_total: 0,
            error: TaskError::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Finished && !self.error.error_happened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_headers() {
        assert_eq!(Range::full().header(0), None);
        assert_eq!(Range::full().header(10), Some("bytes=10-".into()));
        assert_eq!(Range::from(0).header(0), Some("bytes=0-".into()));
        assert_eq!(Range::new(100, 4).header(0), Some("bytes=100-103".into()));
        assert_eq!(Range::new(100, 4).header(2), Some("bytes=102-103".into()));
        assert_eq!(Range::new(0, 1).header(0), Some("bytes=0-0".into()));
    }

    #[test]
    fn test_transport_codes() {
        assert_eq!(TransportError::WriteError.code(), 23);
        assert_eq!(TransportError::Timeout.code(), 28);
    }
}
