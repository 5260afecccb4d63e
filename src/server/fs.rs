use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::protocol::FileDescriptor;

/// Suffix of a file that is still being downloaded.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Files stored under a root laid out as `<root>/<id>/<name>`.
///
/// Each numeric `<id>` directory holds one file; if several regular files are
/// present the first one by name wins. Directories with non-numeric names and
/// `*.part` files are ignored, and so are entries that cannot be read.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    root: PathBuf,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scans the root, ordered by id. A missing root is an empty catalog.
    pub fn list_local(&self) -> io::Result<Vec<FileDescriptor>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = BTreeMap::new();
        for entry in stored_files(WalkDir::new(&self.root).min_depth(2).max_depth(2)) {
            let Some(id) = parse_id_dir(entry.path()) else {
                continue;
            };
            if files.contains_key(&id) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    tracing::warn!(path = ?entry.path(), %err, "skipping unreadable catalog entry");
                    continue;
                }
            };
            files.insert(
                id,
                FileDescriptor {
                    id,
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size,
                },
            );
        }

        Ok(files.into_values().collect())
    }

    /// Path of the file stored under `id`, if any.
    pub fn file_path(&self, id: u64) -> io::Result<Option<PathBuf>> {
        let dir = self.root.join(id.to_string());
        if !dir.is_dir() {
            return Ok(None);
        }

        Ok(stored_files(WalkDir::new(&dir).min_depth(1).max_depth(1))
            .next()
            .map(DirEntry::into_path))
    }

    /// Where a download of `(id, name)` is written.
    pub fn destination(&self, id: u64, name: &str) -> PathBuf {
        self.root.join(id.to_string()).join(name)
    }

    /// Where a download of `(id, name)` is written until it completes.
    pub fn partial_destination(&self, id: u64, name: &str) -> PathBuf {
        self.root
            .join(id.to_string())
            .join(format!("{}{}", name, PARTIAL_SUFFIX))
    }

    /// Whether a complete local copy of `(id, name)` exists.
    pub fn holds(&self, id: u64, name: &str) -> bool {
        self.destination(id, name).is_file()
    }

    pub fn dump<W: Write>(&self, mut w: W) -> io::Result<()> {
        for file in self.list_local()? {
            writeln!(w, "{}", file)?;
        }
        Ok(())
    }
}

/// Regular files of `walk` in name order, minus partial downloads. Entries
/// that fail, such as dangling symlinks, are logged and skipped.
fn stored_files(walk: WalkDir) -> impl Iterator<Item = DirEntry> {
    walk.follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable catalog entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
}

fn parse_id_dir(file: &Path) -> Option<u64> {
    file.parent()?.file_name()?.to_str()?.parse().ok()
}
