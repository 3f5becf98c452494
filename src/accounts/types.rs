//! Local account types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::GrantSet;

/// Reserved id of the site superuser.
pub const SUPERUSER_ID: u64 = 1;

/// A local account in the host's user store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAccount {
    pub id: u64,
    /// Unique username (the asserted federation username for federated accounts).
    pub username: String,
    /// Unique e-mail address.
    pub email: Option<String>,
    /// Roles held by the account.
    #[serde(default)]
    pub roles: GrantSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalAccount {
    pub fn new(id: u64, username: impl Into<String>, email: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            username: username.into(),
            email,
            roles: GrantSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.id == SUPERUSER_ID
    }

    /// Whether the account's e-mail equals `email` (case-insensitive).
    pub fn has_email(&self, email: &str) -> bool {
        self.email
            .as_deref()
            .map(|own| own.eq_ignore_ascii_case(email))
            .unwrap_or(false)
    }
}

/// Identity of the caller for the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "account", rename_all = "snake_case")]
pub enum Caller {
    #[default]
    Anonymous,
    Account(LocalAccount),
}

impl Caller {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Caller::Account(_))
    }

    pub fn account(&self) -> Option<&LocalAccount> {
        match self {
            Caller::Account(account) => Some(account),
            Caller::Anonymous => None,
        }
    }

    pub fn account_id(&self) -> Option<u64> {
        self.account().map(|a| a.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_email() {
        let account = LocalAccount::new(5, "alice", Some("Alice@Example.org".to_string()));
        assert!(account.has_email("alice@example.org"));
        assert!(!account.has_email("bob@example.org"));
        assert!(!LocalAccount::new(6, "bob", None).has_email("bob@example.org"));
    }

    #[test]
    fn test_caller() {
        assert!(!Caller::Anonymous.is_authenticated());
        let caller = Caller::Account(LocalAccount::new(SUPERUSER_ID, "admin", None));
        assert!(caller.is_authenticated());
        assert!(caller.account().unwrap().is_superuser());
        assert_eq!(caller.account_id(), Some(1));
    }
}
