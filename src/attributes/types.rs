//! Request-scoped identity types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the host hands over for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Server variables / headers injected by the federation module.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Current path without leading slash (e.g. "node/42").
    #[serde(default)]
    pub path: String,

    /// Request host (e.g. "www.example.com").
    #[serde(default)]
    pub host: String,

    /// Request scheme ("http" or "https").
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// E-mail address submitted through the custom e-mail form, if any.
    #[serde(default)]
    pub custom_email: Option<String>,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl RequestContext {
    /// Create a context for a path with the given server variables.
    pub fn new(path: impl Into<String>, env: HashMap<String, String>) -> Self {
        Self {
            env,
            path: path.into(),
            host: String::new(),
            scheme: default_scheme(),
            custom_email: None,
        }
    }

    /// Set the request host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Attach a custom e-mail form submission.
    pub fn with_custom_email(mut self, email: impl Into<String>) -> Self {
        self.custom_email = Some(email.into());
        self
    }

    /// Get a server variable, treating empty values as absent.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.env
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Identity asserted by the IdP for the current request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssertedIdentity {
    /// Asserted username.
    pub username: Option<String>,

    /// E-mail value split on `;`, each segment trimmed. Only the first is
    /// used for resolution.
    pub email_candidates: Vec<String>,

    /// Every server variable of the request, for rule evaluation.
    pub attributes: HashMap<String, String>,

    /// Whether federation headers are present on this request.
    pub federation_active: bool,
}

impl AssertedIdentity {
    /// The e-mail candidate used for resolution.
    pub fn primary_email(&self) -> Option<&str> {
        self.email_candidates
            .first()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// The asserted username, or the empty string when absent.
    pub fn username_or_empty(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }

    /// Get a raw attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_email() {
        let mut identity = AssertedIdentity::default();
        assert_eq!(identity.primary_email(), None);

        identity.email_candidates = vec![String::new(), "b@example.com".to_string()];
        assert_eq!(identity.primary_email(), None);

        identity.email_candidates = vec!["a@example.com".to_string()];
        assert_eq!(identity.primary_email(), Some("a@example.com"));
    }

    #[test]
    fn test_empty_var_is_absent() {
        let mut env = HashMap::new();
        env.insert("REMOTE_USER".to_string(), String::new());
        let ctx = RequestContext::new("node/1", env);
        assert_eq!(ctx.var("REMOTE_USER"), None);
        assert_eq!(ctx.var("MISSING"), None);
    }
}
