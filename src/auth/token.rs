use crate::error::ShareError;
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::info;

/// Number of random bytes in a token (hex-encoded to twice as many chars).
pub const TOKEN_BYTES: usize = 32;

/// The single live access token.
#[derive(Clone, Eq, PartialEq)]
pub struct AccessToken {
    value: String,
    issued_at: SystemTime,
    expires_at: SystemTime,
    deadline: Instant,
}

impl AccessToken {
    fn generate(validity: Duration) -> Result<Self, ShareError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|error| ShareError::Fatal(format!("secure random source failed: {error}")))?;

        let issued_at = SystemTime::now();
        Ok(Self {
            value: hex::encode(bytes),
            issued_at,
            expires_at: issued_at + validity,
            deadline: Instant::now() + validity,
        })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues, validates and rotates the shared access token.
///
/// The token and its expiry live behind one lock and are replaced as a
/// unit, so a validator sees either the old pair or the new pair.
///
/// The session ends at the first token's deadline. Rotation revokes the
/// previous token but never extends the session.
#[derive(Debug)]
pub struct TokenAuthority {
    current: RwLock<AccessToken>,
    session_deadline: Instant,
}

impl TokenAuthority {
    /// Create an authority holding a freshly issued token.
    pub fn new(validity: Duration) -> Result<Self, ShareError> {
        let token = AccessToken::generate(validity)?;
        Ok(Self {
            session_deadline: token.deadline,
            current: RwLock::new(token),
        })
    }

    /// Issue a new token valid for `validity`, replacing the previous one.
    pub fn issue(&self, validity: Duration) -> Result<AccessToken, ShareError> {
        // Generate outside the lock; only the swap is exclusive.
        let token = AccessToken::generate(validity)?;
        *self.current.write() = token.clone();
        Ok(token)
    }

    /// Replace the current token. Holders of the previous token lose
    /// access immediately.
    pub fn rotate(&self, validity: Duration) -> Result<AccessToken, ShareError> {
        let token = self.issue(validity)?;
        info!("Access token rotated");
        Ok(token)
    }

    pub fn validate(&self, candidate: &str) -> bool {
        self.validate_at(candidate, Instant::now())
    }

    /// Constant-time comparison against the current token, false once `now`
    /// reaches the expiry.
    pub fn validate_at(&self, candidate: &str, now: Instant) -> bool {
        if candidate.is_empty() {
            return false;
        }

        let current = self.current.read();
        let matches: bool = candidate
            .as_bytes()
            .ct_eq(current.value.as_bytes())
            .into();
        matches && now < current.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Whether the sharing session is over, whatever token is current.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.session_deadline
    }

    pub fn session_deadline(&self) -> Instant {
        self.session_deadline
    }

    /// A consistent copy of the live token and its expiry.
    pub fn snapshot(&self) -> AccessToken {
        self.current.read().clone()
    }
}
