use crate::auth::{AccessToken, TokenAuthority};
use crate::error::{RateLimitReason, ShareError};
use crate::limit::{Backoff, RateLimiter};
use crate::security::path::prefilter;
use crate::security::{EntryMeta, FileAccessGuard, OpenedFile, PathResolver};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What is being shared: a directory tree or a single regular file.
#[derive(Debug, Clone)]
pub enum ShareRoot {
    Directory(PathResolver),
    File { path: PathBuf, name: String },
}

impl ShareRoot {
    /// Verify the shared path at startup.
    ///
    /// Fails with [`ShareError::Fatal`] for paths that cannot be resolved or
    /// that are neither a directory nor a regular file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShareError> {
        let canonical = std::fs::canonicalize(path.as_ref())
            .map_err(|error| ShareError::Fatal(format!("cannot resolve shared path: {error}")))?;
        let meta = std::fs::symlink_metadata(&canonical)
            .map_err(|error| ShareError::Fatal(format!("cannot stat shared path: {error}")))?;

        if meta.is_dir() {
            return Ok(ShareRoot::Directory(PathResolver::from_canonical(canonical)));
        }
        if !meta.is_file() {
            return Err(ShareError::Fatal(
                "shared path must be a regular file or a directory".into(),
            ));
        }

        let name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ShareError::Fatal("shared file has no name".into()))?;
        Ok(ShareRoot::File {
            path: canonical,
            name,
        })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, ShareRoot::Directory(_))
    }

    /// Canonical path of the shared directory or file.
    pub fn path(&self) -> &Path {
        match self {
            ShareRoot::Directory(resolver) => resolver.base(),
            ShareRoot::File { path, .. } => path,
        }
    }

    /// Resolve a request path to a canonical path inside the share.
    ///
    /// In single-file mode only an empty path or the file's own name resolve.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, ShareError> {
        match self {
            ShareRoot::Directory(resolver) => resolver.resolve(requested).await,
            ShareRoot::File { path, name } => match prefilter(requested)?.as_slice() {
                [] => Ok(path.clone()),
                [single] if *single == name.as_str() => Ok(path.clone()),
                _ => Err(ShareError::NotFound),
            },
        }
    }

    /// Base-relative display path for a resolved path.
    pub fn relative(&self, resolved: &Path) -> String {
        match self {
            ShareRoot::Directory(resolver) => resolver
                .relative(resolved)
                .unwrap_or_else(|| "/".to_string()),
            ShareRoot::File { name, .. } => format!("/{name}"),
        }
    }
}

/// Settings of the admission side of the gate.
#[derive(Debug, Clone, Copy)]
pub struct GateLimits {
    pub session: Duration,
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub backoff: Duration,
}

/// The ordered check pipeline every protected request passes.
///
/// 1. failed-auth cooldown for the source
/// 2. sliding window quota for the source
/// 3. token validation
/// 4. global session expiry
/// 5. path resolution inside the share
/// 6. file access guard
///
/// Steps 1 to 4 are [`RequestGate::admit`], step 5 is
/// [`RequestGate::resolve`], step 6 is [`RequestGate::stat`] or
/// [`RequestGate::open`]. The first failure ends the request.
#[derive(Debug)]
pub struct RequestGate {
    root: ShareRoot,
    tokens: TokenAuthority,
    limiter: RateLimiter,
    backoff: Backoff,
    guard: FileAccessGuard,
    session: Duration,
}

impl RequestGate {
    pub fn new(root: ShareRoot, limits: GateLimits) -> Result<Self, ShareError> {
        Ok(Self {
            root,
            tokens: TokenAuthority::new(limits.session)?,
            limiter: RateLimiter::new(limits.rate_limit, limits.rate_window),
            backoff: Backoff::new(limits.backoff),
            guard: FileAccessGuard,
            session: limits.session,
        })
    }

    pub fn root(&self) -> &ShareRoot {
        &self.root
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    /// Steps 1 to 4: admission of `source` presenting `token`.
    pub fn admit(&self, source: IpAddr, token: Option<&str>) -> Result<(), ShareError> {
        self.admit_at(source, token, Instant::now())
    }

    pub fn admit_at(
        &self,
        source: IpAddr,
        token: Option<&str>,
        now: Instant,
    ) -> Result<(), ShareError> {
        if let Some(retry_after) = self.backoff.remaining_at(source, now) {
            debug!(%source, "Rejected during failed-auth cooldown");
            return Err(ShareError::RateLimited {
                reason: RateLimitReason::Cooldown,
                retry_after,
            });
        }

        if !self.limiter.check_at(source, now) {
            warn!(%source, "Rate limit exceeded");
            return Err(ShareError::RateLimited {
                reason: RateLimitReason::Quota,
                retry_after: self.limiter.retry_after_at(source, now),
            });
        }

        if !token.is_some_and(|t| self.tokens.validate_at(t, now)) {
            warn!(%source, has_token = token.is_some(), "Invalid or missing token");
            self.backoff.record_failure_at(source, now);
            return Err(ShareError::Unauthorized);
        }

        if self.tokens.is_expired_at(now) {
            debug!(%source, "Session expired");
            return Err(ShareError::SessionExpired);
        }

        Ok(())
    }

    /// Step 5.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, ShareError> {
        self.root.resolve(requested).await.inspect_err(|error| {
            debug!(%error, "Path rejected");
        })
    }

    /// Step 6 for listings.
    pub async fn stat(&self, resolved: &Path) -> Result<EntryMeta, ShareError> {
        self.guard.stat(resolved).await
    }

    /// Step 6 for downloads.
    pub async fn open(&self, resolved: &Path) -> Result<OpenedFile, ShareError> {
        self.guard.open(resolved).await
    }

    /// Run the whole pipeline for a download.
    pub async fn authorize_download(
        &self,
        source: IpAddr,
        token: Option<&str>,
        requested: &str,
    ) -> Result<OpenedFile, ShareError> {
        self.admit(source, token)?;
        let resolved = self.resolve(requested).await?;
        self.open(&resolved).await
    }

    /// Replace the access token with a new one valid for the configured
    /// session length. The session deadline set at startup still applies.
    pub fn rotate(&self) -> Result<AccessToken, ShareError> {
        self.tokens.rotate(self.session)
    }

    /// Drop limiter and backoff entries that no longer affect admission.
    pub fn compact(&self, now: Instant) -> (usize, usize) {
        (self.limiter.compact(now), self.backoff.compact(now))
    }

    pub fn tracked_sources(&self) -> (usize, usize) {
        (self.limiter.tracked_sources(), self.backoff.tracked_sources())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 8));

    fn limits() -> GateLimits {
        GateLimits {
            session: Duration::from_secs(3600),
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            backoff: Duration::from_secs(2),
        }
    }

    fn gate_with(limits: GateLimits) -> (TempDir, RequestGate) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/report.pdf"), vec![7u8; 1024]).unwrap();
        let gate = RequestGate::new(ShareRoot::open(dir.path()).unwrap(), limits).unwrap();
        (dir, gate)
    }

    fn token(gate: &RequestGate) -> String {
        gate.tokens().snapshot().value().to_string()
    }

    #[tokio::test]
    async fn test_valid_download() {
        let (_dir, gate) = gate_with(limits());
        let token = token(&gate);

        let opened = gate
            .authorize_download(SRC, Some(&token), "/docs/report.pdf")
            .await
            .unwrap();
        assert_eq!(opened.size, 1024);
    }

    #[tokio::test]
    async fn test_traversal_with_valid_token() {
        let (_dir, gate) = gate_with(limits());
        let token = token(&gate);

        let err = gate
            .authorize_download(SRC, Some(&token), "/../../etc/passwd")
            .await
            .unwrap_err();
        assert_eq!(err, ShareError::PathTraversal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_unauthorized() {
        let (_dir, gate) = gate_with(limits());
        assert_eq!(gate.admit(SRC, None), Err(ShareError::Unauthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_applies_even_to_correct_token() {
        let (_dir, gate) = gate_with(limits());
        let token = token(&gate);

        let results = (0..6)
            .map(|i| {
                let candidate = if i == 5 { token.as_str() } else { "wrong" };
                gate.admit(SRC, Some(candidate))
            })
            .collect::<Vec<_>>();

        assert_eq!(results[0], Err(ShareError::Unauthorized));
        for result in &results[1..] {
            assert_eq!(
                *result,
                Err(ShareError::RateLimited {
                    reason: RateLimitReason::Cooldown,
                    retry_after: Duration::from_secs(2),
                })
            );
        }

        // Unaffected sources still get in.
        assert_eq!(gate.admit(OTHER, Some(&token)), Ok(()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(gate.admit(SRC, Some(&token)), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_checked_before_token() {
        let (_dir, gate) = gate_with(GateLimits {
            rate_limit: 3,
            ..limits()
        });
        let token = token(&gate);

        for _ in 0..3 {
            assert_eq!(gate.admit(SRC, Some(&token)), Ok(()));
        }
        assert_eq!(
            gate.admit(SRC, Some(&token)),
            Err(ShareError::RateLimited {
                reason: RateLimitReason::Quota,
                retry_after: Duration::from_secs(60),
            })
        );
        // Quota rejection happens before validation, so no cooldown starts.
        assert_eq!(gate.tracked_sources().1, 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(gate.admit(SRC, Some(&token)), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_rejected() {
        let (_dir, gate) = gate_with(GateLimits {
            session: Duration::from_secs(10),
            ..limits()
        });
        let token = token(&gate);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(gate.admit(SRC, Some(&token)), Err(ShareError::Unauthorized));
        assert!(gate.tokens().is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_follows_configured_limits() {
        let (_dir, gate) = gate_with(GateLimits {
            rate_limit: 1,
            rate_window: Duration::from_secs(600),
            backoff: Duration::from_secs(30),
            ..limits()
        });
        let token = token(&gate);
        let t0 = Instant::now();

        assert_eq!(gate.admit_at(SRC, Some("wrong"), t0), Err(ShareError::Unauthorized));
        assert_eq!(
            gate.admit_at(SRC, Some(&token), t0 + Duration::from_secs(10)),
            Err(ShareError::RateLimited {
                reason: RateLimitReason::Cooldown,
                retry_after: Duration::from_secs(20),
            })
        );

        assert_eq!(gate.admit_at(OTHER, Some(&token), t0), Ok(()));
        assert_eq!(
            gate.admit_at(OTHER, Some(&token), t0 + Duration::from_secs(100)),
            Err(ShareError::RateLimited {
                reason: RateLimitReason::Quota,
                retry_after: Duration::from_secs(500),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_end_outlives_rotation() {
        let (_dir, gate) = gate_with(GateLimits {
            session: Duration::from_secs(10),
            ..limits()
        });
        let t0 = Instant::now();

        tokio::time::advance(Duration::from_secs(6)).await;
        let rotated = gate.rotate().unwrap();
        assert_eq!(
            gate.admit_at(SRC, Some(rotated.value()), t0 + Duration::from_secs(9)),
            Ok(())
        );

        // The rotated token is still valid, the session is not.
        assert_eq!(
            gate.admit_at(SRC, Some(rotated.value()), t0 + Duration::from_secs(11)),
            Err(ShareError::SessionExpired)
        );
        // A 410 does not start a cooldown.
        assert_eq!(gate.tracked_sources().1, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_revokes_old_token() {
        let (_dir, gate) = gate_with(limits());
        let old = token(&gate);
        let new = gate.rotate().unwrap();

        assert_eq!(gate.admit(SRC, Some(&old)), Err(ShareError::Unauthorized));
        assert_eq!(gate.admit(OTHER, Some(new.value())), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_forgets_stale_sources() {
        let (_dir, gate) = gate_with(limits());
        let token = token(&gate);

        gate.admit(SRC, Some(&token)).unwrap();
        gate.admit(OTHER, Some("wrong")).unwrap_err();
        assert_eq!(gate.tracked_sources(), (2, 1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(gate.compact(Instant::now()), (2, 1));
        assert_eq!(gate.tracked_sources(), (0, 0));
    }

    #[tokio::test]
    async fn test_single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("movie.mp4");
        std::fs::write(&file, b"frames").unwrap();
        let root = ShareRoot::open(&file).unwrap();
        assert!(!root.is_directory());

        let canonical = std::fs::canonicalize(&file).unwrap();
        assert_eq!(root.resolve("").await.unwrap(), canonical);
        assert_eq!(root.resolve("/movie.mp4").await.unwrap(), canonical);
        assert_eq!(root.resolve("other.mp4").await, Err(ShareError::NotFound));
        assert_eq!(
            root.resolve("../movie.mp4").await,
            Err(ShareError::PathTraversal)
        );
        assert_eq!(root.relative(&canonical), "/movie.mp4");
    }

    #[test]
    fn test_share_root_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShareRoot::open(dir.path().join("missing")),
            Err(ShareError::Fatal(_))
        ));
    }
}
