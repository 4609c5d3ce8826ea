//! Transfer engine: one range-aware GET per url, streamed to disk.

use crate::dispatcher::EventSink;
use crate::models::{ErrorCode, TransferEvent, TransferFailure, TransferRequest};
use crate::space::{SpaceChecker, Storage};
use reqwest::header::{
    ACCEPT_RANGES, CONNECTION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE,
};
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct Downloader {
    client: Client,
    space: Arc<dyn SpaceChecker>,
    internal_root: Option<PathBuf>,
    calls: Arc<Mutex<HashMap<String, InFlight>>>,
    generation: Arc<AtomicU64>,
}

impl Downloader {
    pub fn new(client: Client, space: Arc<dyn SpaceChecker>, internal_root: Option<PathBuf>) -> Self {
        Self {
            client,
            space,
            internal_root,
            calls: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Launches the transfer on a background task. The Range offset is the
    /// length of the destination file at the moment the request is built.
    pub fn start(&self, request: TransferRequest, sink: EventSink) -> JoinHandle<()> {
        let token = CancellationToken::new();
        let generation = self.register(&request.url, token.clone());
        let sink = sink.guarded_by(token.clone());
        let downloader = self.clone();

        tokio::spawn(async move {
            downloader.run(&request, &sink, &token, generation).await;
            downloader.unregister(&request.url, generation);
        })
    }

    /// Aborts the in-flight call for `url`, if any. The transfer stops at its
    /// next await point and emits no further events.
    pub fn abort(&self, url: &str) -> bool {
        match self.calls().remove(url) {
            Some(call) => {
                call.token.cancel();
                debug!("aborted in-flight call for {}", url);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, url: &str) -> bool {
        self.calls().contains_key(url)
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, url: &str, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .calls()
            .insert(url.to_string(), InFlight { generation, token });
        if let Some(previous) = previous {
            warn!("replacing in-flight call for {}", url);
            previous.token.cancel();
        }
        generation
    }

    fn unregister(&self, url: &str, generation: u64) {
        let mut calls = self.calls();
        if calls.get(url).is_some_and(|c| c.generation == generation) {
            calls.remove(url);
        }
    }

    /// Retires the call and emits its final event under the registry lock.
    /// An abort either lands first, and nothing is emitted, or finds no call
    /// left to abort. Returns false when the call was already aborted.
    fn settle<F>(
        &self,
        url: &str,
        generation: u64,
        token: &CancellationToken,
        sink: &EventSink,
        finish: F,
    ) -> bool
    where
        F: FnOnce() -> TransferEvent,
    {
        let mut calls = self.calls();
        if token.is_cancelled() {
            return false;
        }
        if calls.get(url).is_some_and(|c| c.generation == generation) {
            calls.remove(url);
        }
        sink.emit(finish());
        true
    }

    async fn run(
        &self,
        request: &TransferRequest,
        sink: &EventSink,
        token: &CancellationToken,
        generation: u64,
    ) {
        let path = &request.path;
        let local_len = file_len(path).await;

        let mut builder = self
            .client
            .get(&request.url)
            .header(CONNECTION, "Keep-Alive");
        if local_len > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", local_len));
        }

        debug!("GET {} (local length {})", request.url, local_len);
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("request for {} aborted before response", request.url);
                return;
            }
            response = builder.send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                sink.emit(failed(ErrorCode::Fail, e.to_string()));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() && !status.is_redirection() {
            let message = status.canonical_reason().unwrap_or(status.as_str());
            sink.emit(failed(ErrorCode::Fail, message));
            return;
        }

        let headers = response.headers();
        let mut total = content_length(headers);
        let resumable = supports_ranges(headers);
        let disposition = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if local_len == 0 {
            sink.emit(TransferEvent::Started { size: total });
        } else {
            if resumable {
                total += local_len;
            }
            // Without range support the write restarts at 0, but the baseline
            // reported here is still the pre-existing length.
            sink.emit(TransferEvent::Restarted {
                curr: local_len,
                total,
            });
        }

        let storage = Storage::resolve(path, self.internal_root.as_deref());
        let available = self.space.available_bytes(storage, path);
        if !has_room(available, total, local_len) {
            warn!(
                "insufficient space for {}: need {} bytes, have {:?}",
                path.display(),
                total.saturating_sub(local_len),
                available
            );
            sink.emit(failed(
                ErrorCode::InsufficientSpace,
                path.display().to_string(),
            ));
            return;
        }

        let offset = if resumable { local_len } else { 0 };
        let outcome = stream_to_file(response, path, sink, token, offset, local_len, total).await;
        let settled = match outcome {
            Ok(None) => false,
            Err(e) => self.settle(&request.url, generation, token, sink, || {
                warn!("I/O error while downloading {}: {}", request.url, e);
                failed(ErrorCode::IoException, e.to_string())
            }),
            Ok(Some(final_len)) if total == 0 || final_len != total => {
                self.settle(&request.url, generation, token, sink, || {
                    info!(
                        "{} incomplete: {} of {} bytes",
                        request.url, final_len, total
                    );
                    failed(ErrorCode::FileIncomplete, "file is incomplete")
                })
            }
            Ok(Some(_)) => self.settle(&request.url, generation, token, sink, || {
                let result_path = if request.rename {
                    rename_from_disposition(path, disposition.as_deref())
                } else {
                    path.clone()
                };
                info!("{} complete: {}", request.url, result_path.display());
                completed(&result_path)
            }),
        };
        if !settled {
            debug!("transfer for {} aborted", request.url);
        }
    }
}

/// Writes the response body starting at `offset`. Returns `Ok(None)` when the
/// call was aborted, otherwise the final on-disk length.
async fn stream_to_file(
    mut response: Response,
    path: &Path,
    sink: &EventSink,
    token: &CancellationToken,
    offset: u64,
    prior_len: u64,
    total: u64,
) -> io::Result<Option<u64>> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut position = offset;
    let mut file_len = prior_len;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            chunk = response.chunk() => chunk.map_err(io::Error::other)?,
        };
        let Some(chunk) = chunk else {
            break;
        };

        file.write_all(&chunk).await?;
        position += chunk.len() as u64;
        file_len = file_len.max(position);

        if total > 0 {
            sink.emit(TransferEvent::Progress {
                curr: file_len,
                total,
            });
        }
    }

    file.flush().await?;
    file.sync_data().await?;
    drop(file);

    Ok(Some(fs::metadata(path).await?.len()))
}

fn failed(code: ErrorCode, message: impl Into<String>) -> TransferEvent {
    TransferEvent::Failed(TransferFailure::new(code, message))
}

fn completed(path: &Path) -> TransferEvent {
    TransferEvent::Completed {
        dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

pub(crate) async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn has_room(available: Option<u64>, total: u64, local_len: u64) -> bool {
    let needed = i128::from(total) - i128::from(local_len);
    match available {
        Some(available) => i128::from(available) > needed,
        None => false,
    }
}

pub(crate) fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// `Accept-Ranges: bytes`, or failing that a `Content-Range` in bytes.
pub(crate) fn supports_ranges(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    match accept {
        Some(value) => value == "bytes",
        None => headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("bytes")),
    }
}

/// Extracts and percent-decodes the `filename=` parameter.
pub(crate) fn filename_from_disposition(disposition: &str) -> Option<String> {
    const KEY: &str = "filename=";

    let start = disposition.find(KEY)?;
    if start == 0 {
        return None;
    }
    let rest = &disposition[start + KEY.len()..];
    let raw = match rest.find(';') {
        Some(end) => &rest[..end],
        None => rest,
    };
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }

    let name = urlencoding::decode(&raw.replace('+', " ")).ok()?.into_owned();
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

/// Runs under the registry lock, so it sticks to a plain blocking rename.
fn rename_from_disposition(path: &Path, disposition: Option<&str>) -> PathBuf {
    let Some(name) = disposition.and_then(filename_from_disposition) else {
        return path.to_path_buf();
    };
    let target = match path.parent() {
        Some(dir) => dir.join(&name),
        None => PathBuf::from(&name),
    };

    match std::fs::rename(path, &target) {
        Ok(()) => {
            debug!("renamed {} -> {}", path.display(), target.display());
            target
        }
        Err(e) => {
            warn!("keeping {}: rename to {} failed: {}", path.display(), name, e);
            path.to_path_buf()
        }
    }
}
