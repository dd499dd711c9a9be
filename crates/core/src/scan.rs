use crate::db::SqliteSource;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// First 16 bytes of every SQLite 3 database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub fn is_sqlite_file(path: &Path) -> bool {
    let mut header = [0u8; 16];
    let read = File::open(path).and_then(|mut file| file.read_exact(&mut header));
    read.is_ok() && header == *SQLITE_MAGIC
}

pub fn discover_sqlite_files(directory: &Path, blacklist: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let walker = WalkDir::new(directory).into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return true;
        }
        match entry.path().strip_prefix(directory) {
            Ok(relative) => !blacklist.iter().any(|skipped| skipped.as_path() == relative),
            Err(_) => true,
        }
    });

    for entry in walker.filter_map(|item| item.ok()) {
        if entry.file_type().is_file() && is_sqlite_file(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Finds SQLite files under a directory and keeps only the ones that can be
/// opened and pass an integrity check. Carved or truncated files often carry
/// a valid header but no readable pages.
pub struct DirectoryScanner {
    directory: PathBuf,
    blacklist: Vec<PathBuf>,
}

impl DirectoryScanner {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            blacklist: Vec::new(),
        }
    }

    pub fn with_blacklist(directory: impl Into<PathBuf>, blacklist: Vec<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            blacklist,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn valid_databases(&self) -> Vec<PathBuf> {
        let candidates = discover_sqlite_files(&self.directory, &self.blacklist);
        debug!(
            directory = %self.directory.display(),
            candidates = candidates.len(),
            "database files discovered"
        );

        let mut valid = Vec::new();
        for path in candidates {
            match SqliteSource::open(&path) {
                Ok(source) if source.quick_check() => valid.push(path),
                Ok(_) => warn!(path = %path.display(), "integrity check failure"),
                Err(error) => warn!(path = %path.display(), %error, "unable to open"),
            }
        }

        debug!(
            directory = %self.directory.display(),
            valid = valid.len(),
            "database files passed the integrity check"
        );
        valid
    }
}
