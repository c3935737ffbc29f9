use crate::error::ShareError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Resolves untrusted, base-relative request paths to canonical paths
/// that are guaranteed to live under the shared directory.
///
/// Resolution runs two independent layers:
/// - a syntactic pre-filter on the raw request string, before any I/O;
/// - a component-wise containment check, once on the lexically joined
///   path and once more on the canonical path after symlink expansion.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    /// Canonicalize `base` and build a resolver for it.
    ///
    /// Fails with [`ShareError::Fatal`] when the base cannot be resolved
    /// or is not a directory.
    pub fn new(base: impl AsRef<Path>) -> Result<Self, ShareError> {
        let base = base.as_ref();
        let canonical = std::fs::canonicalize(base)
            .map_err(|error| ShareError::Fatal(format!("cannot resolve share root: {error}")))?;
        if !canonical.is_dir() {
            return Err(ShareError::Fatal("share root is not a directory".into()));
        }
        Ok(Self { base: canonical })
    }

    /// Build a resolver for a base that is already absolute and canonical.
    pub fn from_canonical(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `requested` against the base directory.
    ///
    /// A leading `/` is accepted and means "relative to the base". Empty
    /// requests resolve to the base itself.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, ShareError> {
        let segments = prefilter(requested)?;

        let mut joined = self.base.clone();
        for segment in segments {
            joined.push(segment);
        }
        let joined = normalize_lexically(&joined);

        if !is_within(&self.base, &joined) {
            return Err(ShareError::PathTraversal);
        }

        let real = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|error| match error.kind() {
                ErrorKind::NotFound | ErrorKind::NotADirectory => ShareError::NotFound,
                _ => {
                    debug!(?error, "Failed to canonicalize request path");
                    ShareError::PathTraversal
                }
            })?;

        if !is_within(&self.base, &real) {
            debug!(?real, "Symlink resolves outside the share root");
            return Err(ShareError::PathTraversal);
        }

        Ok(real)
    }

    /// Path of `resolved` relative to the base, `/`-separated with a
    /// leading slash. Returns `None` when `resolved` is not under the base.
    pub fn relative(&self, resolved: &Path) -> Option<String> {
        let rest = resolved.strip_prefix(&self.base).ok()?;
        let mut out = String::from("/");
        let parts = rest
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>();
        out.push_str(&parts.join("/"));
        Some(out)
    }
}

/// Syntactic pre-filter on the raw request string.
///
/// Rejects parent-directory segments, backslashes, NUL bytes and `~`
/// segments outright, and returns the remaining non-empty segments.
pub(crate) fn prefilter(requested: &str) -> Result<Vec<&str>, ShareError> {
    if requested.contains('\\') || requested.contains('\0') {
        return Err(ShareError::PathTraversal);
    }

    let mut segments = Vec::new();
    for segment in requested.split('/') {
        match segment {
            "" | "." => continue,
            ".." | "~" => return Err(ShareError::PathTraversal),
            s => segments.push(s),
        }
    }
    Ok(segments)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Component-wise containment: `path` equals `base` or descends from it.
///
/// `Path::starts_with` compares whole components, so `/data-other` is not
/// considered to be under `/data`.
pub fn is_within(base: &Path, path: &Path) -> bool {
    path.is_absolute() && path.starts_with(base)
}
