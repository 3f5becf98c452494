//! Federation agent configuration.

use serde::{Deserialize, Serialize};

/// Federation agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FederationConfig {
    /// Shibboleth handler URL, absolute or relative to the site host.
    #[serde(default = "default_handler_url")]
    pub handler_url: String,

    /// Protocol used to compose relative handler URLs ("http" or "https").
    #[serde(default = "default_handler_protocol")]
    pub handler_protocol: String,

    /// WAYF / discovery service location, appended to the handler URL.
    #[serde(default = "default_wayf_uri")]
    pub wayf_uri: String,

    /// Server variable carrying the username.
    #[serde(default = "default_username_field")]
    pub username_field: String,

    /// Server variable carrying the e-mail address (may hold `;`-separated values).
    #[serde(default = "default_email_field")]
    pub email_field: String,

    /// When false, the IdP e-mail is required and overrides the local one.
    /// When true, the local e-mail is kept and missing addresses are asked for.
    #[serde(default)]
    pub mail_shib_only: bool,

    /// Dump the request's server variables on debug paths.
    #[serde(default)]
    pub debug_enabled: bool,

    /// Path prefix on which the debug dump is produced (empty = every path).
    #[serde(default)]
    pub debug_path_prefix: String,

    /// Destroy the session when federation headers disappear mid-session.
    #[serde(default)]
    pub auto_destroy_session: bool,

    /// Where to send the user after the IdP logout (absolute or relative to the base URL).
    #[serde(default)]
    pub post_logout_redirect_url: Option<String>,

    /// Text of the login link.
    #[serde(default = "default_link_text")]
    pub link_text: String,

    /// Rule store path (redb database file).
    #[serde(default = "default_rule_store_path")]
    pub rule_store_path: String,

    /// Account store path (redb database file).
    #[serde(default = "default_account_store_path")]
    pub account_store_path: String,

    /// Session store path (redb database file).
    #[serde(default = "default_session_store_path")]
    pub session_store_path: String,

    /// Session TTL in seconds (default: 8 hours).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Cleanup interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_handler_url() -> String {
    "/Shibboleth.sso".to_string()
}

fn default_handler_protocol() -> String {
    "https".to_string()
}

fn default_wayf_uri() -> String {
    "/DS".to_string()
}

fn default_username_field() -> String {
    "REMOTE_USER".to_string()
}

fn default_email_field() -> String {
    "HTTP_SHIB_MAIL".to_string()
}

fn default_link_text() -> String {
    "Shibboleth Login".to_string()
}

fn default_rule_store_path() -> String {
    "/var/lib/zentinel-shib/rules.redb".to_string()
}

fn default_account_store_path() -> String {
    "/var/lib/zentinel-shib/accounts.redb".to_string()
}

fn default_session_store_path() -> String {
    "/var/lib/zentinel-shib/sessions.redb".to_string()
}

/// Longest accepted session TTL (one year).
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

fn default_session_ttl() -> u64 {
    8 * 60 * 60 // 8 hours
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            handler_url: default_handler_url(),
            handler_protocol: default_handler_protocol(),
            wayf_uri: default_wayf_uri(),
            username_field: default_username_field(),
            email_field: default_email_field(),
            mail_shib_only: false,
            debug_enabled: false,
            debug_path_prefix: String::new(),
            auto_destroy_session: false,
            post_logout_redirect_url: None,
            link_text: default_link_text(),
            rule_store_path: default_rule_store_path(),
            account_store_path: default_account_store_path(),
            session_store_path: default_session_store_path(),
            session_ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl FederationConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.handler_url.trim().is_empty() {
            return Err("handler_url must not be empty".to_string());
        }

        if self.handler_protocol != "http" && self.handler_protocol != "https" {
            return Err(format!(
                "handler_protocol must be 'http' or 'https': {}",
                self.handler_protocol
            ));
        }

        if self.username_field.trim().is_empty() {
            return Err("username_field must not be empty".to_string());
        }

        if self.email_field.trim().is_empty() {
            return Err("email_field must not be empty".to_string());
        }

        for (name, path) in [
            ("rule_store_path", &self.rule_store_path),
            ("account_store_path", &self.account_store_path),
            ("session_store_path", &self.session_store_path),
        ] {
            if path.is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }

        if self.session_ttl_secs == 0 {
            return Err("session_ttl_secs must be greater than zero".to_string());
        }
        if self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(format!(
                "session_ttl_secs must not exceed {} seconds",
                MAX_SESSION_TTL_SECS
            ));
        }

        Ok(())
    }
}

/// JSON configuration for reconfiguration and config files.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FederationConfigJson {
    pub handler_url: Option<String>,
    pub handler_protocol: Option<String>,
    pub wayf_uri: Option<String>,
    pub username_field: Option<String>,
    pub email_field: Option<String>,
    pub mail_shib_only: Option<bool>,
    pub debug_enabled: Option<bool>,
    pub debug_path_prefix: Option<String>,
    pub auto_destroy_session: Option<bool>,
    pub post_logout_redirect_url: Option<String>,
    pub link_text: Option<String>,
    pub rule_store_path: Option<String>,
    pub account_store_path: Option<String>,
    pub session_store_path: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

impl FederationConfigJson {
    /// Merge JSON config into existing config.
    pub fn apply_to(&self, config: &mut FederationConfig) {
        if let Some(ref url) = self.handler_url {
            config.handler_url = url.clone();
        }
        if let Some(ref protocol) = self.handler_protocol {
            config.handler_protocol = protocol.clone();
        }
        if let Some(ref uri) = self.wayf_uri {
            config.wayf_uri = uri.clone();
        }
        if let Some(ref field) = self.username_field {
            config.username_field = field.clone();
        }
        if let Some(ref field) = self.email_field {
            config.email_field = field.clone();
        }
        if let Some(only) = self.mail_shib_only {
            config.mail_shib_only = only;
        }
        if let Some(debug) = self.debug_enabled {
            config.debug_enabled = debug;
        }
        if let Some(ref prefix) = self.debug_path_prefix {
            config.debug_path_prefix = prefix.clone();
        }
        if let Some(destroy) = self.auto_destroy_session {
            config.auto_destroy_session = destroy;
        }
        if let Some(ref url) = self.post_logout_redirect_url {
            config.post_logout_redirect_url = Some(url.clone());
        }
        if let Some(ref text) = self.link_text {
            config.link_text = text.clone();
        }
        if let Some(ref path) = self.rule_store_path {
            config.rule_store_path = path.clone();
        }
        if let Some(ref path) = self.account_store_path {
            config.account_store_path = path.clone();
        }
        if let Some(ref path) = self.session_store_path {
            config.session_store_path = path.clone();
        }
        if let Some(ttl) = self.session_ttl_secs {
            config.session_ttl_secs = ttl;
        }
        if let Some(interval) = self.cleanup_interval_secs {
            config.cleanup_interval_secs = interval;
        }
    }
}
