//! Task coordinator: decides whether a request starts fresh, resumes,
//! completes immediately or toggles an active transfer into pause.

use crate::dispatcher::{Dispatcher, remove_file};
use crate::downloader::{Downloader, file_len};
use crate::error::Result;
use crate::listener::DownloadListener;
use crate::models::{TaskRecord, TaskStatus, TransferEvent, TransferRequest};
use crate::space::{DiskSpace, SpaceChecker};
use crate::state::{StateManager, TaskStore};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub type Listener = Option<Arc<dyn DownloadListener>>;

/// Settings for a [`DownloadManager`] built with [`DownloadManager::new`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub state_file: PathBuf,
    /// Destinations under this directory count as internal storage.
    pub internal_dir: Option<PathBuf>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

impl ManagerConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            internal_dir: None,
            proxy: None,
            user_agent: None,
        }
    }

    pub fn internal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.internal_dir = Some(dir.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build_client(&self) -> Result<Client> {
        let mut client_builder = Client::builder();

        if let Some(proxy_url) = &self.proxy {
            client_builder = client_builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        if let Some(user_agent) = &self.user_agent {
            client_builder = client_builder.user_agent(user_agent);
        }

        Ok(client_builder.build()?)
    }
}

pub struct DownloadManager {
    store: Arc<dyn TaskStore>,
    downloader: Downloader,
    dispatcher: Dispatcher,
}

impl DownloadManager {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let store = Arc::new(StateManager::open(&config.state_file)?);
        let space = Arc::new(DiskSpace::new(config.internal_dir.clone()));
        let client = config.build_client()?;

        Self::with_parts(store, space, client, config.internal_dir.clone())
    }

    pub fn with_parts(
        store: Arc<dyn TaskStore>,
        space: Arc<dyn SpaceChecker>,
        client: Client,
        internal_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::spawn(store.clone())?;
        let downloader = Downloader::new(client, space, internal_dir);

        Ok(Self {
            store,
            downloader,
            dispatcher,
        })
    }

    /// Unconditional restart from byte 0.
    pub async fn start(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        rename: bool,
        listener: Listener,
    ) -> Result<()> {
        self.start_record(TaskRecord::new(url, path, rename), listener)
            .await
    }

    /// Like [`start`](Self::start) but keeps title and description set on
    /// `record`.
    pub async fn start_record(&self, record: TaskRecord, listener: Listener) -> Result<()> {
        if !is_network_url(&record.url) {
            warn!("ignoring start for invalid url {:?}", record.url);
            return Ok(());
        }

        // The superseded transfer's Canceled clean-up must land before the
        // new transfer touches the same file.
        self.cancel_inner(&record.url, listener.clone(), true)
            .await?;
        remove_file(&record.path())?;
        if self.store.get_by_url(&record.url)?.is_some() {
            self.store.delete_by_url(&record.url)?;
        }

        self.launch_new(record, listener)
    }

    /// Resumption-aware entry point.
    pub async fn enqueue(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        rename: bool,
        listener: Listener,
    ) -> Result<()> {
        self.enqueue_record(TaskRecord::new(url, path, rename), listener)
            .await
    }

    pub async fn enqueue_record(&self, record: TaskRecord, listener: Listener) -> Result<()> {
        if !is_network_url(&record.url) {
            warn!("ignoring enqueue for invalid url {:?}", record.url);
            return Ok(());
        }

        let Some(local) = self.store.get_by_url(&record.url)? else {
            // a stray file without a record cannot be trusted
            remove_file(&record.path())?;
            return self.launch_new(record, listener);
        };

        if local.total_size == 0 {
            debug!("size of {} never negotiated, relaunching", local.url);
            self.relaunch(local, listener);
            return Ok(());
        }

        let len = file_len(&local.path()).await;
        if len >= local.total_size {
            self.complete_now(local, listener);
            return Ok(());
        }

        match local.status {
            Some(TaskStatus::Started) => self.pause(&record.url, listener).await,
            Some(TaskStatus::Finished) => {
                self.complete_now(local, listener);
                Ok(())
            }
            Some(TaskStatus::Paused) | Some(TaskStatus::Failed) | None => {
                self.relaunch(local, listener);
                Ok(())
            }
        }
    }

    /// Aborts the in-flight call and reports the current file length.
    pub async fn pause(&self, url: &str, listener: Listener) -> Result<()> {
        if !is_network_url(url) {
            return Ok(());
        }
        let Some(record) = self.store.get_by_url(url)? else {
            return Ok(());
        };

        self.downloader.abort(url);
        let curr = file_len(&record.path()).await;
        info!("pausing {} at {} bytes", url, curr);
        self.dispatcher
            .sink(record, listener)
            .emit(TransferEvent::Paused { curr });

        Ok(())
    }

    /// Aborts the in-flight call, then removes both the record and the file.
    pub async fn cancel(&self, url: &str, listener: Listener) -> Result<()> {
        self.cancel_inner(url, listener, false).await
    }

    async fn cancel_inner(&self, url: &str, listener: Listener, wait: bool) -> Result<()> {
        if !is_network_url(url) {
            return Ok(());
        }
        let Some(record) = self.store.get_by_url(url)? else {
            return Ok(());
        };

        self.downloader.abort(url);
        info!("canceling {}", url);
        let sink = self.dispatcher.sink(record, listener);
        if wait {
            sink.emit_and_wait(TransferEvent::Canceled).await
        } else {
            sink.emit(TransferEvent::Canceled);
            Ok(())
        }
    }

    pub fn query(&self, id: u64) -> Result<Option<TaskRecord>> {
        self.store.get_by_id(id)
    }

    pub fn query_url(&self, url: &str) -> Result<Option<TaskRecord>> {
        self.store.get_by_url(url)
    }

    pub fn query_all(&self) -> Result<Vec<TaskRecord>> {
        self.store.list_all()
    }

    /// True when the persisted status says the task is running.
    pub fn is_downloading(&self, url: &str) -> Result<bool> {
        Ok(self
            .store
            .get_by_url(url)?
            .is_some_and(|r| r.status == Some(TaskStatus::Started)))
    }

    /// True when this process holds an in-flight call for `url`.
    pub fn is_active(&self, url: &str) -> bool {
        self.downloader.is_active(url)
    }

    pub fn update_status(&self, status: TaskStatus, url: &str) -> Result<()> {
        self.store.update_status(status, url)
    }

    pub fn delete_record(&self, url: &str) -> Result<()> {
        self.store.delete_by_url(url)
    }

    fn launch_new(&self, mut record: TaskRecord, listener: Listener) -> Result<()> {
        record.id = self.store.insert(&record)?;
        info!("new task {} for {}", record.id, record.url);
        self.relaunch(record, listener);
        Ok(())
    }

    fn relaunch(&self, record: TaskRecord, listener: Listener) {
        let request = TransferRequest::from_record(&record);
        let sink = self.dispatcher.sink(record, listener);
        self.downloader.start(request, sink);
    }

    fn complete_now(&self, record: TaskRecord, listener: Listener) {
        debug!("{} already on disk, completing without a request", record.url);
        let event = TransferEvent::Completed {
            dir: record.dir.clone(),
            name: record.name.clone(),
        };
        self.dispatcher.sink(record, listener).emit(event);
    }
}

fn is_network_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}
