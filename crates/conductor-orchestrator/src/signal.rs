//! Completion signal channel.
//!
//! A worker signals completion by creating `complete/<task>.<attempt>.done`
//! holding its [`CompletionRecord`]. Creation is exclusive, so a second
//! signal for the same attempt is rejected. Waiters are woken by a filesystem
//! watcher (signals written by external processes) and by an in-process
//! notification (signals written through [`FileSignalChannel::signal`]).

use crate::report::{CompletionRecord, Verdict};
use conductor_core::persist::{create_exclusive, read_json, write_json};
use conductor_core::{AttemptId, ConductorError, ConductorResult, TaskId};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Result of waiting for one attempt.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The worker's record arrived.
    Signaled(CompletionRecord),
    /// The deadline passed first.
    TimedOut,
}

type Waiters = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

/// Completion records as files in a watched directory.
pub struct FileSignalChannel {
    dir: PathBuf,
    waiters: Waiters,
    /// Kept alive for as long as the channel; dropping it stops the watch.
    _watcher: Option<RecommendedWatcher>,
}

fn file_name(task: &TaskId, attempt: AttemptId) -> String {
    format!("{task}.{attempt}.done")
}

impl FileSignalChannel {
    /// Open the channel on `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> ConductorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        let watcher = match Self::watch(&dir, waiters.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                // In-process signals still wake waiters.
                warn!(dir = %dir.display(), error = %e, "Completion watcher unavailable");
                None
            }
        };

        Ok(Self {
            dir,
            waiters,
            _watcher: watcher,
        })
    }

    fn watch(dir: &Path, waiters: Waiters) -> notify::Result<RecommendedWatcher> {
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else {
                    return;
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let waiters = waiters.lock();
                for path in &event.paths {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if let Some(notify) = waiters.get(name) {
                        notify.notify_one();
                    }
                }
            })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the worker for `attempt` must write its record.
    pub fn location(&self, task: &TaskId, attempt: AttemptId) -> PathBuf {
        self.dir.join(file_name(task, attempt))
    }

    fn wake(&self, task: &TaskId, attempt: AttemptId) {
        if let Some(notify) = self.waiters.lock().get(&file_name(task, attempt)) {
            notify.notify_one();
        }
    }

    /// Write the completion record for an attempt. Exactly once per attempt.
    pub async fn signal(&self, record: &CompletionRecord) -> ConductorResult<()> {
        let path = self.location(&record.task_id, record.attempt);
        let json = serde_json::to_vec_pretty(record)?;
        if !create_exclusive(&path, &json).await? {
            return Err(ConductorError::AlreadySignaled {
                task: record.task_id.clone(),
                attempt: record.attempt,
            });
        }
        debug!(task_id = %record.task_id, attempt = %record.attempt, "Completion signaled");
        self.wake(&record.task_id, record.attempt);
        Ok(())
    }

    /// Read the record for an attempt if it has been signaled.
    pub async fn collect(
        &self,
        task: &TaskId,
        attempt: AttemptId,
    ) -> ConductorResult<Option<CompletionRecord>> {
        read_json(&self.location(task, attempt)).await
    }

    /// Suspend until the attempt signals or `timeout` elapses.
    pub async fn wait(
        &self,
        task: &TaskId,
        attempt: AttemptId,
        timeout: Duration,
    ) -> ConductorResult<WaitOutcome> {
        let name = file_name(task, attempt);
        // Registered before the first read so a signal in between is not lost.
        let notify = self
            .waiters
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match self.collect(task, attempt).await {
                    Ok(Some(record)) => return Ok(record),
                    Ok(None) => {}
                    // Written in place by an external worker and not finished yet.
                    Err(ConductorError::Store(detail)) => {
                        debug!(task_id = %task, %detail, "Completion record incomplete");
                    }
                    Err(e) => return Err(e),
                }
                notify.notified().await;
            }
        })
        .await;

        self.waiters.lock().remove(&name);

        match waited {
            Ok(Ok(record)) => Ok(WaitOutcome::Signaled(record)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Attach the verdict to a collected record.
    pub async fn record_verdict(
        &self,
        record: &CompletionRecord,
        verdict: &Verdict,
    ) -> ConductorResult<()> {
        let mut updated = record.clone();
        updated.verdict = Some(verdict.clone());
        write_json(&self.location(&record.task_id, record.attempt), &updated).await
    }
}
