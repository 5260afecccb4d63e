mod executor;
mod planer;
mod storage;

use std::collections::BTreeMap;
use std::io;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::client::query_catalog;
use crate::error::{Error, Result};
use crate::progress::{DownloadState, ProgressTracker};
use crate::protocol::FileDescriptor;
use crate::server::LocalCatalog;
use crate::utils::limited_spawner::LimitedSpawner;
use crate::utils::multierr::MultiError;

pub use executor::TaskReport;
pub use planer::{Chunk, PeerAssignment, Planer};
pub use storage::OutputFile;

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;
pub const DEFAULT_MAX_QUERIES: usize = 16;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub chunk_size: NonZeroU64,
    /// Pause after every chunk of a fetch task.
    pub chunk_delay: Duration,
    /// Catalog queries in flight at once when polling the swarm.
    pub max_queries: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: NonZeroU64::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroU64::MIN),
            chunk_delay: Duration::ZERO,
            max_queries: DEFAULT_MAX_QUERIES,
        }
    }
}

/// A file advertised by the swarm and the endpoints advertising it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Available {
    #[serde(flatten)]
    pub file: FileDescriptor,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    /// Every task finished and some chunks never arrived.
    Stalled {
        missing_bytes: u64,
        abandoned: Vec<Chunk>,
    },
}

/// Supervises the fetch tasks of one download.
///
/// Dropping the handle detaches the tasks; they still run to completion, keep
/// updating the tracker and move the file into place once it is complete.
pub struct DownloadHandle {
    file: FileDescriptor,
    path: PathBuf,
    peers: usize,
    tracker: Arc<ProgressTracker>,
    supervisor: JoinHandle<Result<DownloadOutcome>>,
}

impl DownloadHandle {
    /// Final location of the file. Until the download completes the data
    /// lives next to it with a `.part` suffix.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    pub fn state(&self) -> Option<DownloadState> {
        self.tracker.get(self.file.id)
    }

    /// Waits for every fetch task and classifies the result.
    pub async fn wait(self) -> Result<DownloadOutcome> {
        self.supervisor.await.map_err(io::Error::other)?
    }
}

/// Joins the fetch tasks of one download, then renames the partial file to
/// its final name if every byte arrived.
async fn finish_download(
    file: FileDescriptor,
    tasks: Vec<JoinHandle<TaskReport>>,
    tracker: Arc<ProgressTracker>,
    partial: PathBuf,
    path: PathBuf,
) -> Result<DownloadOutcome> {
    let mut abandoned = Vec::new();
    for result in join_all(tasks).await {
        match result {
            Ok(report) => abandoned.extend(report.abandoned),
            Err(err) => tracing::error!(file_id = file.id, %err, "fetch task failed"),
        }
    }
    abandoned.sort_by_key(|chunk| chunk.start_offset);

    match tracker.get(file.id) {
        Some(state) if !state.is_complete() => {
            tracing::warn!(
                file_id = file.id,
                missing = state.total_size - state.bytes_transferred,
                "download stalled"
            );
            Ok(DownloadOutcome::Stalled {
                missing_bytes: state.total_size - state.bytes_transferred,
                abandoned,
            })
        }
        // Already collected by a status report means it completed
        _ => {
            tokio::fs::rename(&partial, &path).await?;
            tracing::info!(file_id = file.id, path = ?path, "download completed");
            Ok(DownloadOutcome::Completed)
        }
    }
}

/// Runs downloads of this node against a fixed swarm of endpoints.
pub struct Downloader {
    swarm: Vec<String>,
    catalog: LocalCatalog,
    tracker: Arc<ProgressTracker>,
    config: DownloadConfig,
}

impl Downloader {
    /// `swarm` should not contain the node's own endpoint.
    pub fn new(
        swarm: Vec<String>,
        catalog: LocalCatalog,
        tracker: Arc<ProgressTracker>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            swarm,
            catalog,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Queries every endpoint, at most `max_queries` at once. Answers keep
    /// swarm order; failed endpoints are collected.
    async fn query_swarm(&self) -> (Vec<(String, Vec<FileDescriptor>)>, MultiError<Error>) {
        let mut spawner = LimitedSpawner::new(self.config.max_queries.max(1));
        for (index, peer) in self.swarm.iter().enumerate() {
            let peer = peer.clone();
            let spawned = spawner
                .spawn(async move {
                    let result = query_catalog(&peer).await;
                    (index, peer, result)
                })
                .await;
            if let Err(err) = spawned {
                tracing::error!(%err, "catalog query could not be scheduled");
                break;
            }
        }

        let mut answers = Vec::new();
        let mut errs = MultiError::new();
        for joined in spawner.join_all().await {
            match joined {
                Ok((index, peer, Ok(files))) => answers.push((index, peer, files)),
                Ok((_, peer, Err(err))) => {
                    tracing::debug!(%peer, %err, "peer did not answer");
                    errs.push(err);
                }
                Err(err) => errs.push(Error::Io(io::Error::other(err))),
            }
        }
        answers.sort_by_key(|(index, _, _)| *index);

        let answers = answers
            .into_iter()
            .map(|(_, peer, files)| (peer, files))
            .collect();
        (answers, errs)
    }

    /// Files offered by the swarm that are not already held locally, by id.
    ///
    /// Peers are grouped under an id only when they also agree on the name;
    /// the first advertiser's size is kept.
    #[tracing::instrument(err, skip(self))]
    pub async fn discover(&self) -> Result<Vec<Available>> {
        let (answers, errs) = self.query_swarm().await;
        if answers.is_empty() && !errs.is_empty() {
            return Err(Error::Unreachable(errs));
        }

        let mut available: BTreeMap<u64, Available> = BTreeMap::new();
        for (peer, files) in answers {
            for file in files {
                if self.catalog.holds(file.id, &file.name) {
                    continue;
                }
                match available.get_mut(&file.id) {
                    Some(entry) if entry.file.name == file.name => entry.peers.push(peer.clone()),
                    Some(entry) => tracing::debug!(
                        id = file.id,
                        kept = %entry.file.name,
                        ignored = %file.name,
                        %peer,
                        "conflicting names for one id"
                    ),
                    None => {
                        available.insert(
                            file.id,
                            Available {
                                file,
                                peers: vec![peer.clone()],
                            },
                        );
                    }
                }
            }
        }

        Ok(available.into_values().collect())
    }

    /// Endpoints currently advertising `(file_id, name)`, in swarm order.
    /// Unreachable endpoints simply do not count.
    pub async fn find_sources(&self, file_id: u64, name: &str) -> Vec<String> {
        let (answers, _) = self.query_swarm().await;
        answers
            .into_iter()
            .filter(|(_, files)| files.iter().any(|f| f.id == file_id && f.name == name))
            .map(|(peer, _)| peer)
            .collect()
    }

    /// Starts downloading `file` from every endpoint currently advertising
    /// it and returns once the fetch tasks are running.
    pub async fn start_download(&self, file: &FileDescriptor) -> Result<DownloadHandle> {
        let peers = self.find_sources(file.id, &file.name).await;
        self.start_download_from(file, &peers).await
    }

    /// Starts downloading `file` from `peers` into `<root>/<id>/<name>`.
    ///
    /// Data is written to `<name>.part` and renamed once every byte arrived,
    /// so a stalled download never looks like a stored file.
    #[tracing::instrument(err, skip(self, file), fields(id = file.id, name = %file.name))]
    pub async fn start_download_from(
        &self,
        file: &FileDescriptor,
        peers: &[String],
    ) -> Result<DownloadHandle> {
        let plan = Planer::new(self.config.chunk_size).plan(file, peers)?;

        // Registered before the output exists so our own server hides it
        self.tracker
            .register(file.id, &file.name, file.size, plan.len())?;

        let path = self.catalog.destination(file.id, &file.name);
        let partial = self.catalog.partial_destination(file.id, &file.name);
        let output = match OutputFile::create(&partial, file.size).await {
            Ok(output) => output,
            Err(err) => {
                self.tracker.discard(file.id);
                return Err(err.into());
            }
        };

        tracing::info!(
            chunks = plan.iter().map(|a| a.chunks.len()).sum::<usize>(),
            peers = plan.len(),
            "download started"
        );

        let peers = plan.len();
        let tasks = plan
            .into_iter()
            .map(|assignment| {
                tokio::spawn(executor::execute_assignment(
                    assignment,
                    output.clone(),
                    Arc::clone(&self.tracker),
                    self.config.chunk_delay,
                    self.tracker.task_guard(file.id),
                ))
            })
            .collect();
        let supervisor = tokio::spawn(finish_download(
            file.clone(),
            tasks,
            Arc::clone(&self.tracker),
            partial,
            path.clone(),
        ));

        Ok(DownloadHandle {
            file: file.clone(),
            path,
            peers,
            tracker: Arc::clone(&self.tracker),
            supervisor,
        })
    }
}
