use crate::error::ShareError;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata of a path that passed the file-type checks.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl EntryMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A regular file opened for streaming.
#[derive(Debug)]
pub struct OpenedFile {
    pub file: File,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Opens and stats resolved paths, admitting only regular files and
/// directories.
///
/// On Unix the final open uses `O_NOFOLLOW`, so a symlink swapped in after
/// resolution fails atomically with `ELOOP`. The opened handle is then
/// compared (device and inode) with the pre-open `lstat` result. Elsewhere
/// only the stat-then-verify sequence is available, which narrows the
/// swap window but does not close it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAccessGuard;

impl FileAccessGuard {
    /// Stat `path` without following a final symlink.
    pub async fn stat(&self, path: &Path) -> Result<EntryMeta, ShareError> {
        let meta = lstat(path).await?;
        entry_meta(&meta)
    }

    /// Open a regular file for reading.
    pub async fn open(&self, path: &Path) -> Result<OpenedFile, ShareError> {
        let before = lstat(path).await?;
        if entry_meta(&before)?.is_dir() {
            return Err(ShareError::IsDirectory);
        }

        let file = open_no_follow(path).await?;
        let after = file.metadata().await.map_err(|error| {
            warn!(?error, "Failed to stat opened file");
            ShareError::AccessDenied
        })?;

        if !after.file_type().is_file() || !same_file(&before, &after) {
            warn!("File changed between stat and open");
            return Err(ShareError::AccessDenied);
        }

        Ok(OpenedFile {
            size: after.len(),
            modified: after.modified().ok(),
            file,
        })
    }
}

async fn lstat(path: &Path) -> Result<Metadata, ShareError> {
    tokio::fs::symlink_metadata(path)
        .await
        .map_err(|error| match error.kind() {
            ErrorKind::NotFound | ErrorKind::NotADirectory => ShareError::NotFound,
            _ => {
                debug!(?error, "lstat failed");
                ShareError::AccessDenied
            }
        })
}

fn entry_meta(meta: &Metadata) -> Result<EntryMeta, ShareError> {
    let file_type = meta.file_type();
    let kind = if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        // Symlinks (a canonical path never names one), devices, sockets, FIFOs.
        return Err(ShareError::AccessDenied);
    };

    Ok(EntryMeta {
        kind,
        size: meta.len(),
        modified: meta.modified().ok(),
    })
}

#[cfg(unix)]
async fn open_no_follow(path: &Path) -> Result<File, ShareError> {
    // O_NONBLOCK keeps a FIFO swapped in after the stat from blocking the open.
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
        .await
        .map_err(map_open_error)
}

#[cfg(not(unix))]
async fn open_no_follow(path: &Path) -> Result<File, ShareError> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .await
        .map_err(map_open_error)
}

fn map_open_error(error: std::io::Error) -> ShareError {
    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::ELOOP) {
        warn!("Refused to open a symlink");
        return ShareError::AccessDenied;
    }

    match error.kind() {
        ErrorKind::NotFound => ShareError::NotFound,
        _ => {
            debug!(?error, "open failed");
            ShareError::AccessDenied
        }
    }
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}
