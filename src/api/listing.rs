use crate::error::ShareError;
use crate::security::{EntryKind, EntryMeta};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_formatted: Option<String>,
    pub mod_time: DateTime<Utc>,
}

impl FileEntry {
    pub fn new(name: String, path: String, meta: &EntryMeta) -> Self {
        let is_directory = meta.is_dir();
        let size = (!is_directory).then_some(meta.size);
        Self {
            name,
            path,
            is_directory,
            size,
            size_formatted: size.map(format_file_size),
            mod_time: mod_time(meta.modified),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesResponse {
    pub current_dir: String,
    pub base_info: FileEntry,
    pub files: Vec<FileEntry>,
}

/// Read the entries of `dir`, a directory already admitted by the guard.
///
/// Entries that are neither regular files nor directories (symlinks,
/// sockets, devices) and entries whose metadata cannot be read are left out.
/// Entries are ordered by file name.
pub async fn read_entries(dir: &Path, display_dir: &str) -> Result<Vec<FileEntry>, ShareError> {
    let mut reader = tokio::fs::read_dir(dir).await.map_err(|error| {
        debug!(?error, "Failed to read directory");
        ShareError::Internal
    })?;

    let mut entries = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                debug!(?error, "Failed to read directory entry");
                return Err(ShareError::Internal);
            }
        };

        // DirEntry::metadata does not traverse symlinks.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else if meta.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = EntryMeta {
            kind,
            size: meta.len(),
            modified: meta.modified().ok(),
        };
        let path = join_display(display_dir, &name);
        entries.push(FileEntry::new(name, path, &meta));
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn join_display(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Human readable size with 1024 steps, e.g. `512 B`, `1.5 KB`, `2.0 GB`.
pub fn format_file_size(size: u64) -> String {
    const UNIT: u64 = 1024;
    const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

    if size < UNIT {
        return format!("{size} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = size / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", size as f64 / div as f64, PREFIXES[exp])
}

fn mod_time(t: Option<SystemTime>) -> DateTime<Utc> {
    DateTime::<Utc>::from(t.unwrap_or(SystemTime::UNIX_EPOCH))
}
