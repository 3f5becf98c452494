//! Federation session types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// How the session's user was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    Federation,
}

/// Remembered state while waiting for the user to supply an e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEmailRequest {
    /// Path to resume once the e-mail has been accepted.
    pub target_return_path: String,
    /// Set while the redirect to the e-mail form is on its way to the browser.
    pub redirect_in_flight: bool,
}

impl PendingEmailRequest {
    pub fn new(target_return_path: impl Into<String>) -> Self {
        Self {
            target_return_path: target_return_path.into(),
            redirect_in_flight: true,
        }
    }
}

/// Per browser session federation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationSession {
    pub id: SessionId,

    /// Username the session was bound to on its first federated request.
    pub bound_username: Option<String>,

    /// Set on every successful federated login.
    pub authentication_source: Option<AuthSource>,

    /// Outstanding custom e-mail request.
    pub pending_email: Option<PendingEmailRequest>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl FederationSession {
    /// Create a new, unbound session. A TTL past chrono's range never expires.
    pub fn new(ttl_secs: u64) -> Self {
        let now = Utc::now();
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: SessionId::new(),
            bound_username: None,
            authentication_source: None,
            pending_email: None,
            created_at: now,
            expires_at,
            last_accessed: now,
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Update last accessed time.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    pub fn is_bound(&self) -> bool {
        self.bound_username.is_some()
    }

    pub fn is_federated(&self) -> bool {
        self.authentication_source == Some(AuthSource::Federation)
    }

    /// Drop every federation marker. Id and timestamps are kept.
    pub fn reset(&mut self) {
        self.bound_username = None;
        self.authentication_source = None;
        self.pending_email = None;
    }
}
