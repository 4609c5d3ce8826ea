use crate::models::TransferFailure;
use std::path::Path;

/// Caller-facing callbacks for one download task.
///
/// Every method has an empty default body, so implementors only override the
/// callbacks they care about. All calls arrive on the dispatcher thread, after
/// the matching store write has completed, in the order the events were
/// produced.
pub trait DownloadListener: Send + Sync {
    fn on_start(&self, _id: u64, _size: u64) {}

    fn on_progress(&self, _id: u64, _curr: u64, _total: u64) {}

    fn on_restart(&self, _id: u64, _curr: u64, _total: u64) {}

    fn on_pause(&self, _id: u64, _curr: u64) {}

    fn on_complete(&self, _id: u64, _dir: &Path, _name: &str) {}

    fn on_cancel(&self, _id: u64) {}

    fn on_error(&self, _id: u64, _error: &TransferFailure) {}
}
