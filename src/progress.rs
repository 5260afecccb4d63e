use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Active,
    Completed,
    /// Every fetch task finished but some chunks were abandoned.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub name: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub active_tasks: usize,
}

impl DownloadState {
    pub fn new(name: impl Into<String>, total_size: u64, active_tasks: usize) -> Self {
        Self {
            name: name.into(),
            total_size,
            bytes_transferred: 0,
            active_tasks,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_size
    }

    pub fn status(&self) -> DownloadStatus {
        if self.is_complete() {
            DownloadStatus::Completed
        } else if self.active_tasks == 0 {
            DownloadStatus::Stalled
        } else {
            DownloadStatus::Active
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        self.bytes_transferred as f64 / self.total_size as f64 * 100.0
    }

    /// One status line, e.g. `[3] a.bin - 1.00 / 2.00 KB (50.0%)`.
    pub fn report(&self, file_id: u64) -> String {
        format!("[{}] {}", file_id, self)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {:.2} / {:.2} KB ({:.1}%)",
            self.name,
            self.bytes_transferred as f64 / 1024.0,
            self.total_size as f64 / 1024.0,
            self.percentage()
        )?;
        match self.status() {
            DownloadStatus::Completed => write!(f, " - COMPLETED"),
            DownloadStatus::Stalled => write!(f, " - STALLED"),
            DownloadStatus::Active => Ok(()),
        }
    }
}

/// Registry of downloads of this node, keyed by file id.
///
/// Every read and write goes through one mutex, so snapshots never observe a
/// half-applied update.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    downloads: Mutex<BTreeMap<u64, DownloadState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, DownloadState>> {
        // Updates are single field writes, a poisoned map is still consistent
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a download that will be driven by `tasks` fetch tasks.
    ///
    /// A finished or stalled entry for the same id is replaced; an active one
    /// is an error.
    pub fn register(&self, file_id: u64, name: &str, total_size: u64, tasks: usize) -> Result<()> {
        let mut downloads = self.lock();
        if let Some(existing) = downloads.get(&file_id) {
            if existing.status() == DownloadStatus::Active {
                return Err(Error::AlreadyDownloading(file_id));
            }
        }
        downloads.insert(file_id, DownloadState::new(name, total_size, tasks));
        Ok(())
    }

    pub fn advance(&self, file_id: u64, byte_count: u64) {
        let mut downloads = self.lock();
        match downloads.get_mut(&file_id) {
            Some(state) => {
                let advanced = state.bytes_transferred.saturating_add(byte_count);
                if advanced > state.total_size {
                    tracing::error!(
                        file_id,
                        advanced,
                        total = state.total_size,
                        "bug: more bytes transferred than the file holds"
                    );
                }
                state.bytes_transferred = advanced.min(state.total_size);
            }
            None => tracing::warn!(file_id, byte_count, "progress for an unknown download"),
        }
    }

    /// Drops the entry of a download that never started.
    pub fn discard(&self, file_id: u64) {
        self.lock().remove(&file_id);
    }

    fn task_finished(&self, file_id: u64) {
        if let Some(state) = self.lock().get_mut(&file_id) {
            state.active_tasks = state.active_tasks.saturating_sub(1);
        }
    }

    /// Decrements the active task count of `file_id` when dropped, including
    /// when the owning task panics.
    pub fn task_guard(self: &Arc<Self>, file_id: u64) -> TaskGuard {
        TaskGuard {
            tracker: Arc::clone(self),
            file_id,
        }
    }

    pub fn get(&self, file_id: u64) -> Option<DownloadState> {
        self.lock().get(&file_id).cloned()
    }

    /// Whether `file_id` has an entry that has not reached its total size.
    pub fn is_unfinished(&self, file_id: u64) -> bool {
        self.lock()
            .get(&file_id)
            .is_some_and(|state| !state.is_complete())
    }

    pub fn snapshot(&self) -> Vec<(u64, DownloadState)> {
        self.lock()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    /// Removes and returns every download that reached its total size.
    pub fn remove_completed(&self) -> Vec<(u64, DownloadState)> {
        let mut downloads = self.lock();
        let completed = downloads
            .iter()
            .filter(|(_, state)| state.is_complete())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        completed
            .into_iter()
            .filter_map(|id| downloads.remove(&id).map(|state| (id, state)))
            .collect()
    }
}

pub struct TaskGuard {
    tracker: Arc<ProgressTracker>,
    file_id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.task_finished(self.file_id);
    }
}
