use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Persisted lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Started,
    Paused,
    Finished,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Started => "started",
            TaskStatus::Paused => "paused",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One row per url ever enqueued.
///
/// `total_size == 0` means the size has not been negotiated with the server yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Assigned by the store on insert, 0 before that.
    #[serde(default)]
    pub id: u64,
    pub url: String,
    pub dir: PathBuf,
    pub name: String,
    pub curr_size: u64,
    pub total_size: u64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rename: bool,
    pub mimetype: String,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub status: Option<TaskStatus>,
}

impl TaskRecord {
    pub fn new(url: impl Into<String>, path: impl AsRef<Path>, rename: bool) -> Self {
        let path = path.as_ref();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mimetype = mimetype_for(&name).to_string();

        Self {
            id: 0,
            url: url.into(),
            dir,
            name,
            curr_size: 0,
            total_size: 0,
            title: None,
            description: None,
            rename,
            mimetype,
            start_time: None,
            finish_time: None,
            status: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

fn mimetype_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "apk" => "application/vnd.android.package-archive",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Numeric failure codes reported through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Fail = 1,
    RespNull = 2,
    InsufficientSpace = 3,
    FileIncomplete = 4,
    IoException = 5,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl TransferFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}_{}]", self.code.code(), self.message)
    }
}

/// Everything the engine needs to run one GET. Not persisted.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub path: PathBuf,
    pub rename: bool,
}

impl TransferRequest {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            url: record.url.clone(),
            path: record.path(),
            rename: record.rename,
        }
    }
}

/// Lifecycle events produced for a single transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started { size: u64 },
    Restarted { curr: u64, total: u64 },
    Progress { curr: u64, total: u64 },
    Paused { curr: u64 },
    Completed { dir: PathBuf, name: String },
    Canceled,
    Failed(TransferFailure),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Paused { .. }
                | TransferEvent::Completed { .. }
                | TransferEvent::Canceled
                | TransferEvent::Failed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_splits_destination_path() {
        let record = TaskRecord::new("https://example.com/a.zip", "/tmp/dl/a.zip", true);
        assert_eq!(record.dir, PathBuf::from("/tmp/dl"));
        assert_eq!(record.name, "a.zip");
        assert_eq!(record.mimetype, "application/zip");
        assert_eq!(record.path(), PathBuf::from("/tmp/dl/a.zip"));
        assert!(record.rename);
        assert_eq!(record.status, None);
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        let record = TaskRecord::new("https://example.com/blob", "/tmp/blob.xyz", false);
        assert_eq!(record.mimetype, "application/octet-stream");
        let record = TaskRecord::new("https://example.com/blob", "/tmp/blob", false);
        assert_eq!(record.mimetype, "application/octet-stream");
    }

    #[test]
    fn error_codes_match_wire_values() {
        assert_eq!(ErrorCode::Unknown.code(), 0);
        assert_eq!(ErrorCode::Fail.code(), 1);
        assert_eq!(ErrorCode::RespNull.code(), 2);
        assert_eq!(ErrorCode::InsufficientSpace.code(), 3);
        assert_eq!(ErrorCode::FileIncomplete.code(), 4);
        assert_eq!(ErrorCode::IoException.code(), 5);
        let failure = TransferFailure::new(ErrorCode::FileIncomplete, "file is incomplete");
        assert_eq!(failure.to_string(), "[4_file is incomplete]");
    }

    #[test]
    fn only_end_states_are_terminal() {
        assert!(!TransferEvent::Started { size: 1 }.is_terminal());
        assert!(!TransferEvent::Progress { curr: 1, total: 2 }.is_terminal());
        assert!(TransferEvent::Paused { curr: 1 }.is_terminal());
        assert!(TransferEvent::Canceled.is_terminal());
    }
}
