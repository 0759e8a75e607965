//! Sorted listing of the message files in a queue directory.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Hidden files (temporaries, quarantined messages) are never messages.
pub(crate) fn is_message(name: &std::ffi::OsStr) -> bool {
    !name.as_encoded_bytes().starts_with(b".")
}

fn visible_files(dir: &Path) -> io::Result<impl Iterator<Item = fs::DirEntry>> {
    Ok(fs::read_dir(dir)?.filter_map(|entry| {
        let entry = entry.ok()?;
        let regular = entry.file_type().ok()?.is_file();
        (regular && is_message(&entry.file_name())).then_some(entry)
    }))
}

/// Number of messages currently in `dir`.
pub(crate) fn count(dir: &Path) -> io::Result<usize> {
    Ok(visible_files(dir)?.count())
}

/// Oldest-first list of paths believed to be queued messages.
///
/// Entries may go stale at any time because other processes consume from
/// the same directory; they are pruned lazily when reached.
#[derive(Debug, Default)]
pub(crate) struct FileCache {
    entries: VecDeque<PathBuf>,
}

impl FileCache {
    /// Replaces the cache with a fresh listing ordered by (mtime, name).
    pub(crate) fn refill(&mut self, dir: &Path) -> io::Result<usize> {
        let mut listed: Vec<(SystemTime, PathBuf)> = visible_files(dir)?
            .filter_map(|entry| {
                // Vanished between readdir and stat: someone else took it.
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        listed.sort();
        self.entries = listed.into_iter().map(|(_, path)| path).collect();
        Ok(self.entries.len())
    }

    /// Drops leading entries that no longer exist and returns the oldest survivor.
    pub(crate) fn front(&mut self) -> Option<&Path> {
        while let Some(path) = self.entries.front() {
            if path.exists() {
                break;
            }
            self.entries.pop_front();
        }
        self.entries.front().map(PathBuf::as_path)
    }

    /// Forgets `path` once it has been consumed or quarantined.
    ///
    /// Only that entry goes; the rest keep their order even if `path` is
    /// already gone from disk.
    pub(crate) fn remove(&mut self, path: &Path) -> bool {
        match self.entries.iter().position(|p| p == path) {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
