//! Write-before-notify delivery of transfer events.
//!
//! All events, whichever task produced them, funnel into one channel drained
//! by a single dispatcher thread. For each event the thread first applies it
//! to the persisted [`TaskRecord`] and only then forwards it to the caller's
//! [`DownloadListener`], so a listener never observes a state the store does
//! not hold.

use crate::error::{DownloadError, Result};
use crate::listener::DownloadListener;
use crate::models::{ErrorCode, TaskRecord, TaskStatus, TransferEvent, TransferFailure};
use crate::state::TaskStore;
use chrono::Utc;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Envelope {
    record: TaskRecord,
    event: TransferEvent,
    listener: Option<Arc<dyn DownloadListener>>,
    guard: Option<CancellationToken>,
    ack: Option<oneshot::Sender<()>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Dispatcher {
    /// Starts the dispatcher thread. It exits once every `Dispatcher` and
    /// [`EventSink`] clone has been dropped.
    pub fn spawn(store: Arc<dyn TaskStore>) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        thread::Builder::new()
            .name("resume-dl-dispatch".to_string())
            .spawn(move || {
                while let Some(envelope) = rx.blocking_recv() {
                    deliver(store.as_ref(), envelope);
                }
                debug!("dispatcher channel closed");
            })?;

        Ok(Self { tx })
    }

    /// Binds an event sink to one task record and its listener.
    pub fn sink(
        &self,
        record: TaskRecord,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            record: Arc::new(record),
            listener,
            guard: None,
        }
    }
}

/// Per-task handle through which the engine and coordinator emit events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
    record: Arc<TaskRecord>,
    listener: Option<Arc<dyn DownloadListener>>,
    guard: Option<CancellationToken>,
}

impl EventSink {
    /// Ties the sink to an in-flight call: once `token` is cancelled, events
    /// still queued or sent afterwards are discarded by the dispatcher. Any
    /// Paused/Canceled emitted after the abort therefore stays the last event
    /// the listener sees.
    pub fn guarded_by(mut self, token: CancellationToken) -> Self {
        self.guard = Some(token);
        self
    }

    pub fn emit(&self, event: TransferEvent) {
        if self.send(event, None).is_err() {
            warn!("dispatcher gone, dropping event for {}", self.record.url);
        }
    }

    /// Emits `event` and waits until it has been persisted and delivered.
    pub async fn emit_and_wait(&self, event: TransferEvent) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(event, Some(ack_tx))?;
        ack_rx.await.map_err(|_| DownloadError::DispatcherClosed)
    }

    fn send(&self, event: TransferEvent, ack: Option<oneshot::Sender<()>>) -> Result<()> {
        self.tx
            .send(Envelope {
                record: (*self.record).clone(),
                event,
                listener: self.listener.clone(),
                guard: self.guard.clone(),
                ack,
            })
            .map_err(|_| DownloadError::DispatcherClosed)
    }
}

fn deliver(store: &dyn TaskStore, envelope: Envelope) {
    let Envelope {
        record,
        event,
        listener,
        guard,
        ack,
    } = envelope;

    if guard.is_some_and(|token| token.is_cancelled()) {
        debug!("dropping {:?} for aborted task {}", event, record.id);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        return;
    }

    // Prefer the stored row so fields written by earlier events carry over.
    // A row with a different id belongs to a newer task for the same url.
    let mut record = match store.get_by_url(&record.url) {
        Ok(Some(stored)) if stored.id == record.id => stored,
        Ok(_) => record,
        Err(e) => {
            warn!("failed to load task {} from store: {}", record.id, e);
            record
        }
    };

    // A pause racing a completed transfer finds the row already FINISHED.
    if matches!(event, TransferEvent::Paused { .. }) && record.status == Some(TaskStatus::Finished) {
        debug!("task {} already finished, ignoring pause", record.id);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        return;
    }

    match persist(store, &mut record, &event) {
        Ok(()) => {
            if event.is_terminal() {
                debug!("task {} settled with {:?}", record.id, event);
            }
            if let Some(listener) = listener {
                notify(listener.as_ref(), record.id, &event);
            }
        }
        Err(e) => {
            warn!("failed to persist {:?} for task {}: {}", event, record.id, e);
            // the listener must not see a state the store does not hold
            if let Some(listener) = listener {
                let failure = TransferFailure::new(ErrorCode::Unknown, e.to_string());
                listener.on_error(record.id, &failure);
            }
        }
    }

    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

fn persist(store: &dyn TaskStore, record: &mut TaskRecord, event: &TransferEvent) -> Result<()> {
    match event {
        TransferEvent::Started { size } => {
            debug!("Start->id:{} size:{}", record.id, size);
            record.status = Some(TaskStatus::Started);
            record.start_time = Some(Utc::now());
            record.total_size = *size;
            store.update(record)
        }
        TransferEvent::Restarted { curr, total } => {
            debug!("Restart->id:{} curr:{} total:{}", record.id, curr, total);
            record.status = Some(TaskStatus::Started);
            record.curr_size = *curr;
            record.total_size = *total;
            store.update(record)
        }
        TransferEvent::Progress { curr, total } => {
            debug!("Progress->id:{} curr:{} total:{}", record.id, curr, total);
            Ok(())
        }
        TransferEvent::Paused { curr } => {
            debug!("Pause->id:{} curr:{}", record.id, curr);
            record.status = Some(TaskStatus::Paused);
            record.curr_size = *curr;
            store.update(record)
        }
        TransferEvent::Completed { dir, name } => {
            debug!("Complete->id:{} dir:{} name:{}", record.id, dir.display(), name);
            record.finish_time = Some(Utc::now());
            record.status = Some(TaskStatus::Finished);
            record.curr_size = record.total_size;
            // follow a rename-on-complete so the record keeps pointing at the file
            record.dir = dir.clone();
            record.name = name.clone();
            store.update(record)
        }
        TransferEvent::Canceled => {
            debug!("Cancel->id:{}", record.id);
            store.delete_by_id(record.id)?;
            remove_file(&record.path())
        }
        TransferEvent::Failed(failure) => {
            debug!("Error->id:{} error:{}", record.id, failure);
            record.status = Some(TaskStatus::Failed);
            store.update(record)
        }
    }
}

fn notify(listener: &dyn DownloadListener, id: u64, event: &TransferEvent) {
    match event {
        TransferEvent::Started { size } => listener.on_start(id, *size),
        TransferEvent::Restarted { curr, total } => listener.on_restart(id, *curr, *total),
        TransferEvent::Progress { curr, total } => listener.on_progress(id, *curr, *total),
        TransferEvent::Paused { curr } => listener.on_pause(id, *curr),
        TransferEvent::Completed { dir, name } => listener.on_complete(id, dir, name),
        TransferEvent::Canceled => listener.on_cancel(id),
        TransferEvent::Failed(failure) => listener.on_error(id, failure),
    }
}

/// Removes a local file, treating an already missing file as success.
pub(crate) fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl DownloadListener for Recorder {
        fn on_start(&self, id: u64, size: u64) {
            self.seen.lock().unwrap().push(format!("start {id} {size}"));
        }
        fn on_pause(&self, id: u64, curr: u64) {
            self.seen.lock().unwrap().push(format!("pause {id} {curr}"));
        }
        fn on_complete(&self, id: u64, _dir: &Path, name: &str) {
            self.seen.lock().unwrap().push(format!("complete {id} {name}"));
        }
        fn on_cancel(&self, id: u64) {
            self.seen.lock().unwrap().push(format!("cancel {id}"));
        }
        fn on_error(&self, id: u64, error: &TransferFailure) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("error {id} {}", error.code.code()));
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<StateManager>, TaskRecord) {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateManager::open(dir.path().join("state.json")).unwrap());
        let mut record = TaskRecord::new("https://example.com/f.bin", dir.path().join("f.bin"), false);
        record.id = store.insert(&record).unwrap();
        (dir, store, record)
    }

    #[tokio::test]
    async fn store_is_written_before_listener_is_called() {
        let (_dir, store, record) = setup();
        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink = dispatcher.sink(record.clone(), Some(recorder.clone()));

        sink.emit(TransferEvent::Started { size: 1000 });
        sink.emit_and_wait(TransferEvent::Paused { curr: 400 }).await.unwrap();

        let stored = store.get_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(TaskStatus::Paused));
        assert_eq!(stored.total_size, 1000);
        assert_eq!(stored.curr_size, 400);
        assert!(stored.start_time.is_some());
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![format!("start {} 1000", record.id), format!("pause {} 400", record.id)]
        );
    }

    #[tokio::test]
    async fn failure_marks_record_failed() {
        let (_dir, store, record) = setup();
        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let sink = dispatcher.sink(record.clone(), None);

        sink.emit_and_wait(TransferEvent::Failed(TransferFailure::new(
            ErrorCode::FileIncomplete,
            "file is incomplete",
        )))
        .await
        .unwrap();

        let stored = store.get_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn cancel_removes_record_and_file() {
        let (_dir, store, record) = setup();
        std::fs::write(record.path(), b"partial").unwrap();
        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink = dispatcher.sink(record.clone(), Some(recorder.clone()));

        sink.emit_and_wait(TransferEvent::Canceled).await.unwrap();

        assert!(store.get_by_url(&record.url).unwrap().is_none());
        assert!(!record.path().exists());
        assert_eq!(*recorder.seen.lock().unwrap(), vec![format!("cancel {}", record.id)]);
    }

    #[tokio::test]
    async fn stale_sink_does_not_touch_newer_record_for_same_url() {
        let (_dir, store, old) = setup();
        store.delete_by_id(old.id).unwrap();
        let mut newer = old.clone();
        newer.id = store.insert(&newer).unwrap();

        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let sink = dispatcher.sink(old.clone(), None);
        sink.emit_and_wait(TransferEvent::Paused { curr: 10 }).await.unwrap();

        let stored = store.get_by_url(&old.url).unwrap().unwrap();
        assert_eq!(stored.id, newer.id);
        assert_eq!(stored.status, None);
    }

    #[tokio::test]
    async fn events_from_an_aborted_call_are_discarded() {
        let (_dir, store, record) = setup();
        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let engine = dispatcher
            .sink(record.clone(), Some(recorder.clone()))
            .guarded_by(token.clone());
        let coordinator = dispatcher.sink(record.clone(), Some(recorder.clone()));

        engine.emit_and_wait(TransferEvent::Started { size: 10 }).await.unwrap();
        token.cancel();
        coordinator.emit(TransferEvent::Paused { curr: 4 });
        engine
            .emit_and_wait(TransferEvent::Failed(TransferFailure::new(ErrorCode::IoException, "reset")))
            .await
            .unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![format!("start {} 10", record.id), format!("pause {} 4", record.id)]
        );
        let stored = store.get_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(TaskStatus::Paused));
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore(TaskRecord);

    impl TaskStore for ReadOnlyStore {
        fn get_by_id(&self, id: u64) -> Result<Option<TaskRecord>> {
            Ok(Some(self.0.clone()).filter(|r| r.id == id))
        }
        fn get_by_url(&self, url: &str) -> Result<Option<TaskRecord>> {
            Ok(Some(self.0.clone()).filter(|r| r.url == url))
        }
        fn list_all(&self) -> Result<Vec<TaskRecord>> {
            Ok(vec![self.0.clone()])
        }
        fn insert(&self, _record: &TaskRecord) -> Result<u64> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
        fn update(&self, _record: &TaskRecord) -> Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
        fn delete_by_id(&self, _id: u64) -> Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
        fn delete_by_url(&self, _url: &str) -> Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
        fn update_status(&self, _status: TaskStatus, _url: &str) -> Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
    }

    #[tokio::test]
    async fn failed_write_reports_unknown_error_instead_of_event() {
        let mut record = TaskRecord::new("https://example.com/f.bin", "/tmp/f.bin", false);
        record.id = 7;
        let store = Arc::new(ReadOnlyStore(record.clone()));
        let dispatcher = Dispatcher::spawn(store).unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink = dispatcher.sink(record, Some(recorder.clone()));

        sink.emit_and_wait(TransferEvent::Started { size: 1000 }).await.unwrap();
        sink.emit_and_wait(TransferEvent::Paused { curr: 10 }).await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["error 7 0".to_string(), "error 7 0".to_string()]
        );
    }

    #[tokio::test]
    async fn pause_after_completion_is_ignored() {
        let (_dir, store, record) = setup();
        let dispatcher = Dispatcher::spawn(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink = dispatcher.sink(record.clone(), Some(recorder.clone()));

        sink.emit(TransferEvent::Started { size: 10 });
        sink.emit(TransferEvent::Completed {
            dir: record.dir.clone(),
            name: "renamed.bin".to_string(),
        });
        // built from the row as it looked before Completed landed
        let late = dispatcher.sink(record.clone(), Some(recorder.clone()));
        late.emit_and_wait(TransferEvent::Paused { curr: 0 }).await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                format!("start {} 10", record.id),
                format!("complete {} renamed.bin", record.id),
            ]
        );
        let stored = store.get_by_id(record.id).unwrap().unwrap();
        assert_eq!(stored.status, Some(TaskStatus::Finished));
        assert_eq!(stored.name, "renamed.bin");
    }
}
