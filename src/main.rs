mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Args, Command};
use futures::future::join_all;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use resume_dl::{
    DownloadListener, DownloadManager, ManagerConfig, TaskRecord, TaskStatus, TransferFailure,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{Level, info, warn};

#[derive(Debug)]
enum Outcome {
    Completed(PathBuf),
    Paused(u64),
    Failed(String),
}

/// Drives one progress bar and reports the first terminal callback.
struct ProgressListener {
    pb: ProgressBar,
    done: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl ProgressListener {
    fn new(pb: ProgressBar) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Self {
            pb,
            done: Mutex::new(Some(tx)),
        });
        (listener, rx)
    }

    fn finish(&self, outcome: Outcome) {
        if let Some(tx) = self.done.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(outcome);
        }
    }

    fn show_bytes(&self, curr: u64, total: u64) {
        if total > 0 {
            self.pb.set_length(total);
            self.pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:30} {bar:40} {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
        }
        self.pb.set_position(curr);
    }
}

impl DownloadListener for ProgressListener {
    fn on_start(&self, _id: u64, size: u64) {
        self.show_bytes(0, size);
    }

    fn on_restart(&self, _id: u64, curr: u64, total: u64) {
        self.show_bytes(curr, total);
    }

    fn on_progress(&self, _id: u64, curr: u64, _total: u64) {
        self.pb.set_position(curr);
    }

    fn on_pause(&self, _id: u64, curr: u64) {
        self.pb.abandon_with_message(format!("Paused at {}", HumanBytes(curr)));
        self.finish(Outcome::Paused(curr));
    }

    fn on_complete(&self, _id: u64, dir: &Path, name: &str) {
        self.pb.finish_with_message(format!("Done: {}", name));
        self.finish(Outcome::Completed(dir.join(name)));
    }

    fn on_cancel(&self, id: u64) {
        // only a forced restart discarding task `id` lands here
        self.pb.set_message(format!("Discarded task {}", id));
    }

    fn on_error(&self, _id: u64, error: &TransferFailure) {
        self.pb.abandon_with_message(format!("Failed {}", error));
        self.finish(Outcome::Failed(error.to_string()));
    }
}

struct CancelNotice(Mutex<Option<oneshot::Sender<()>>>);

impl DownloadListener for CancelNotice {
    fn on_cancel(&self, _id: u64) {
        if let Some(tx) = self.0.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url::Url::parse(url)
        .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
}

fn file_name_for(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

#[allow(clippy::too_many_arguments)]
async fn get(
    manager: &DownloadManager,
    urls: Vec<String>,
    dir: PathBuf,
    name: Option<String>,
    rename: bool,
    title: Option<String>,
    description: Option<String>,
    force: bool,
) -> Result<()> {
    let mut seen = HashSet::new();
    let urls: Vec<String> = urls.into_iter().filter(|u| seen.insert(u.clone())).collect();
    if name.is_some() && urls.len() > 1 {
        return Err(anyhow!("--name can only be used with a single url"));
    }
    if let Some(bad) = urls.iter().find(|u| !is_http_url(u)) {
        return Err(anyhow!("Not an http(s) url: {}", bad));
    }
    fs::create_dir_all(&dir).context("Failed to create output directory")?;

    let mp = MultiProgress::new();
    let mut active = Vec::new();
    let mut waits = Vec::new();

    for url in &urls {
        let file_name = name.clone().unwrap_or_else(|| file_name_for(url));
        let mut record = TaskRecord::new(url.as_str(), dir.join(&file_name), rename);
        if let Some(title) = &title {
            record = record.with_title(title.as_str());
        }
        if let Some(description) = &description {
            record = record.with_description(description.as_str());
        }

        // A STARTED record nobody in this process is driving was left behind
        // by an interrupted run; mark it paused so enqueue resumes it.
        if !force && manager.is_downloading(url)? && !manager.is_active(url) {
            info!("recovering interrupted task for {}", url);
            manager.update_status(TaskStatus::Paused, url)?;
        }

        let pb = mp.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg:30} {bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(file_name.clone());

        let (listener, done) = ProgressListener::new(pb);
        let listener: Arc<dyn DownloadListener> = listener;
        if force {
            manager.start_record(record, Some(listener.clone())).await?;
        } else {
            manager.enqueue_record(record, Some(listener.clone())).await?;
        }

        active.push((url.clone(), listener));
        waits.push(done);
    }

    let all = join_all(waits);
    tokio::pin!(all);

    let results = tokio::select! {
        results = &mut all => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing active downloads");
            for (url, listener) in &active {
                if manager.is_active(url) {
                    manager.pause(url, Some(listener.clone())).await?;
                }
            }
            all.await
        }
    };

    let mut success = 0;
    let mut failed = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(Outcome::Completed(path)) => {
                success += 1;
                info!("{} -> {}", url, path.display());
            }
            Ok(Outcome::Paused(curr)) => {
                failed += 1;
                info!("{} paused at {} bytes", url, curr);
            }
            Ok(Outcome::Failed(reason)) => {
                failed += 1;
                warn!("{} failed: {}", url, reason);
            }
            Err(_) => {
                failed += 1;
                warn!("{} finished without a result", url);
            }
        }
    }
    mp.clear().ok();
    println!("\nDone: {} success, {} failed", success, failed);

    Ok(())
}

fn print_record(record: &TaskRecord) {
    let status = record
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "new".to_string());
    println!(
        "{:>4}  {:<9} {:>10} / {:<10} {}",
        record.id,
        status,
        HumanBytes(record.curr_size).to_string(),
        HumanBytes(record.total_size).to_string(),
        record.path().display()
    );
    if let Some(title) = &record.title {
        println!("      title: {}", title);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let mut config = ManagerConfig::new(&args.state_file);
    if let Some(dir) = &args.internal_dir {
        config = config.internal_dir(dir);
    }
    if let Some(proxy) = &args.proxy {
        config = config.proxy(proxy);
    }
    let manager = DownloadManager::new(&config).context("Failed to open download manager")?;

    match args.command {
        Command::Get {
            urls,
            dir,
            name,
            rename,
            title,
            description,
            force,
        } => {
            get(&manager, urls, dir, name, rename, title, description, force).await?;
        }
        Command::List => {
            let records = manager.query_all()?;
            if records.is_empty() {
                println!("No tasks");
            }
            for record in &records {
                print_record(record);
            }
        }
        Command::Show { target } => {
            let record = match target.parse::<u64>() {
                Ok(id) => manager.query(id)?,
                Err(_) => manager.query_url(&target)?,
            };
            let record = record.ok_or_else(|| anyhow!("No task for {}", target))?;
            print_record(&record);
        }
        Command::Cancel { url } => {
            if manager.query_url(&url)?.is_none() {
                return Err(anyhow!("No task for {}", url));
            }
            let (tx, rx) = oneshot::channel();
            let notice = Arc::new(CancelNotice(Mutex::new(Some(tx))));
            manager.cancel(&url, Some(notice)).await?;
            rx.await.context("Cancel was not confirmed")?;
            println!("Canceled {}", url);
        }
        Command::Forget { url } => {
            manager.delete_record(&url)?;
            println!("Forgot {}", url);
        }
        Command::SetStatus { url, status } => {
            manager.update_status(status.into(), &url)?;
            println!("{} -> {}", url, TaskStatus::from(status));
        }
    }

    Ok(())
}
