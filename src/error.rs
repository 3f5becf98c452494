//! Error taxonomy for federated login and rule administration.

use thiserror::Error;

use crate::rules::RuleId;

/// Typed failure conditions.
///
/// Store APIs return `anyhow::Result`; these variants travel inside
/// `anyhow::Error` and are recovered with `downcast_ref` where the caller
/// needs to branch on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FederationError {
    /// The IdP did not assert a username (or the username field is misconfigured).
    #[error("username is missing from the federation attributes")]
    MissingUsername,

    /// A new account needs an e-mail address and the IdP did not provide one.
    #[error("e-mail address is missing from the federation attributes")]
    MissingEmail,

    /// The e-mail address belongs to another account.
    #[error("e-mail address '{email}' is already used by another account")]
    EmailConflict { email: String },

    /// The username was registered concurrently by another request.
    #[error("username '{username}' already exists")]
    UsernameConflict { username: String },

    /// The account store failed.
    #[error("account store failure: {0}")]
    AccountStore(String),

    /// No rule with this id.
    #[error("rule #{0} not found")]
    RuleNotFound(RuleId),

    /// A rule draft failed validation.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A stored grant envelope carries a version this build cannot read.
    #[error("unsupported grant encoding version {0}")]
    UnsupportedEncoding(u8),
}

impl FederationError {
    /// Text shown to the end user through the host's message channel.
    pub fn user_message(&self) -> String {
        match self {
            FederationError::MissingUsername => {
                "Username is missing. Please contact your Shibboleth administrator!".to_string()
            }
            FederationError::MissingEmail => {
                "E-mail address is missing. Please contact your Shibboleth administrator!"
                    .to_string()
            }
            FederationError::EmailConflict { .. } => {
                "Error saving user account. E-mail address is already used.".to_string()
            }
            FederationError::UsernameConflict { .. } => {
                "Error saving user account. Username is already used.".to_string()
            }
            FederationError::AccountStore(_) => {
                "Error saving user account. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the condition warrants a critical entry in the admin log.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            FederationError::MissingUsername
                | FederationError::MissingEmail
                | FederationError::AccountStore(_)
        )
    }
}
