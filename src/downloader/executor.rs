use std::sync::Arc;
use std::time::Duration;

use crate::client::PeerConnection;
use crate::downloader::planer::{Chunk, PeerAssignment};
use crate::downloader::storage::OutputFile;
use crate::error::Result;
use crate::progress::{ProgressTracker, TaskGuard};

/// What one fetch task did with its assignment.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub peer: String,
    pub fetched_bytes: u64,
    pub abandoned: Vec<Chunk>,
}

async fn fetch_chunk(conn: &mut PeerConnection, output: &OutputFile, chunk: &Chunk) -> Result<()> {
    let data = conn
        .fetch(chunk.file_id, chunk.start_offset, chunk.length)
        .await?;
    output.write_at(chunk.start_offset, data).await?;
    Ok(())
}

/// Fetches every chunk of `assignment` in order from its peer.
///
/// A chunk that fails is abandoned and never counted; there is no retry and
/// no timeout, so a peer that stops answering blocks this task.
#[tracing::instrument(skip_all, fields(peer = %assignment.peer, chunks = assignment.chunks.len()))]
pub(super) async fn execute_assignment(
    assignment: PeerAssignment,
    output: OutputFile,
    tracker: Arc<ProgressTracker>,
    chunk_delay: Duration,
    _guard: TaskGuard,
) -> TaskReport {
    let mut conn = PeerConnection::new(assignment.peer.clone());
    let mut report = TaskReport {
        peer: assignment.peer,
        ..Default::default()
    };

    for chunk in assignment.chunks {
        match fetch_chunk(&mut conn, &output, &chunk).await {
            Ok(()) => {
                tracker.advance(chunk.file_id, chunk.length);
                report.fetched_bytes += chunk.length;
                tracing::debug!(offset = chunk.start_offset, length = chunk.length, "chunk written");
            }
            Err(err) => {
                tracing::warn!(
                    offset = chunk.start_offset,
                    length = chunk.length,
                    %err,
                    "abandoning chunk"
                );
                report.abandoned.push(chunk);
            }
        }

        if !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
    }

    tracing::debug!(
        fetched = report.fetched_bytes,
        abandoned = report.abandoned.len(),
        "assignment finished"
    );
    report
}
