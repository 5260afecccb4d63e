use std::num::NonZeroU64;

use crate::error::{Error, Result};
use crate::protocol::FileDescriptor;

/// A contiguous byte range of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_id: u64,
    pub name: String,
    pub start_offset: u64,
    pub length: u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.start_offset + self.length
    }
}

/// Chunks fetched from one peer, in the listed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAssignment {
    pub peer: String,
    pub chunks: Vec<Chunk>,
}

impl PeerAssignment {
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }
}

/// Splits a file into fixed-size chunks and deals them round-robin over the
/// peers holding it. Peer speed is not taken into account.
#[derive(Debug, Clone, Copy)]
pub struct Planer {
    chunk_size: NonZeroU64,
}

impl Planer {
    pub fn new(chunk_size: NonZeroU64) -> Self {
        Planer { chunk_size }
    }

    /// `ceil(size / chunk_size)` chunks covering `[0, size)`, the last one
    /// possibly shorter. An empty file has no chunks.
    pub fn chunks(&self, file: &FileDescriptor) -> Vec<Chunk> {
        let chunk_size = self.chunk_size.get();
        let num_chunks = file.size.div_ceil(chunk_size);

        (0..num_chunks)
            .map(|i| {
                let start_offset = i * chunk_size;
                Chunk {
                    file_id: file.id,
                    name: file.name.clone(),
                    start_offset,
                    length: chunk_size.min(file.size - start_offset),
                }
            })
            .collect()
    }

    /// Assigns chunk `i` to `peers[i % peers.len()]` after dropping repeated
    /// peers. Peers left without chunks get no assignment.
    pub fn plan(&self, file: &FileDescriptor, peers: &[String]) -> Result<Vec<PeerAssignment>> {
        let mut distinct: Vec<&String> = Vec::with_capacity(peers.len());
        for peer in peers {
            if !distinct.contains(&peer) {
                distinct.push(peer);
            }
        }
        if distinct.is_empty() {
            return Err(Error::NoSources {
                file_id: file.id,
                name: file.name.clone(),
            });
        }

        let mut assignments = distinct
            .iter()
            .map(|peer| PeerAssignment {
                peer: (*peer).clone(),
                chunks: Vec::new(),
            })
            .collect::<Vec<_>>();

        let n_peers = assignments.len();
        for (i, chunk) in self.chunks(file).into_iter().enumerate() {
            assignments[i % n_peers].chunks.push(chunk);
        }

        assignments.retain(|a| !a.chunks.is_empty());
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planer(chunk_size: u64) -> Planer {
        Planer::new(NonZeroU64::new(chunk_size).unwrap())
    }

    fn peers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect()
    }

    #[test]
    fn test_chunks_partition_file() {
        for chunk_size in [1, 3, 32, 100, 4096] {
            for size in [0, 1, 2, 31, 32, 33, 99, 100, 101, 1000, 4097] {
                let file = FileDescriptor::new(1, "f", size);
                let chunks = planer(chunk_size).chunks(&file);

                assert_eq!(chunks.len() as u64, size.div_ceil(chunk_size));
                let mut next = 0;
                for chunk in &chunks {
                    assert_eq!(chunk.start_offset, next, "gap or overlap");
                    assert!(chunk.length > 0 && chunk.length <= chunk_size);
                    next = chunk.end();
                }
                assert_eq!(next, size);
                assert_eq!(chunks.iter().map(|c| c.length).sum::<u64>(), size);
            }
        }
    }

    #[test]
    fn test_single_peer_plan() {
        let file = FileDescriptor::new(4, "a.bin", 100);
        let plan = planer(32).plan(&file, &peers(1)).unwrap();

        assert_eq!(plan.len(), 1);
        let lengths = plan[0].chunks.iter().map(|c| c.length).collect::<Vec<_>>();
        assert_eq!(lengths, vec![32, 32, 32, 4]);
        assert_eq!(plan[0].total_bytes(), 100);
    }

    #[test]
    fn test_two_peers_one_chunk_each() {
        let file = FileDescriptor::new(4, "a.bin", 64);
        let peers = peers(2);
        let plan = planer(32).plan(&file, &peers).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].peer, peers[0]);
        assert_eq!(plan[0].chunks[0].start_offset, 0);
        assert_eq!(plan[1].peer, peers[1]);
        assert_eq!(plan[1].chunks[0].start_offset, 32);
    }

    #[test]
    fn test_round_robin_keeps_offsets_ascending() {
        let file = FileDescriptor::new(1, "f", 10 * 32 + 5);
        let plan = planer(32).plan(&file, &peers(3)).unwrap();

        let offsets = plan
            .iter()
            .map(|a| a.chunks.iter().map(|c| c.start_offset / 32).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            offsets,
            vec![vec![0, 3, 6, 9], vec![1, 4, 7, 10], vec![2, 5, 8]]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let file = FileDescriptor::new(1, "f", 12345);
        let peers = peers(4);
        let planer = planer(100);

        assert_eq!(
            planer.plan(&file, &peers).unwrap(),
            planer.plan(&file, &peers).unwrap()
        );
    }

    #[test]
    fn test_more_peers_than_chunks() {
        let file = FileDescriptor::new(1, "f", 40);
        let plan = planer(32).plan(&file, &peers(5)).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_duplicate_peers_collapsed() {
        let file = FileDescriptor::new(1, "f", 96);
        let peers = vec!["a:1".to_string(), "b:1".to_string(), "a:1".to_string()];
        let plan = planer(32).plan(&file, &peers).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].chunks.len(), 2);
        assert_eq!(plan[1].chunks.len(), 1);
    }

    #[test]
    fn test_empty_file_and_no_peers() {
        let empty = FileDescriptor::new(1, "f", 0);
        assert!(planer(32).plan(&empty, &peers(2)).unwrap().is_empty());

        let file = FileDescriptor::new(1, "f", 10);
        assert!(matches!(
            planer(32).plan(&file, &[]),
            Err(Error::NoSources { file_id: 1, .. })
        ));
    }
}
