//! Resumable HTTP downloads.
//!
//! A [`DownloadManager`] compares persisted task state with the file on disk
//! and decides whether a url starts fresh, resumes with a `Range` request,
//! completes immediately, or is paused. Progress reaches callers through a
//! [`DownloadListener`] only after the matching state has been persisted.

pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod listener;
pub mod manager;
pub mod models;
pub mod space;
pub mod state;

pub use error::{DownloadError, Result};
pub use listener::DownloadListener;
pub use manager::{DownloadManager, Listener, ManagerConfig};
pub use models::{ErrorCode, TaskRecord, TaskStatus, TransferEvent, TransferFailure};
pub use space::{DiskSpace, SpaceChecker, Storage};
pub use state::{StateManager, TaskStore};
