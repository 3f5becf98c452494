//! Reads the asserted identity out of the request's server variables.

use std::collections::BTreeMap;
use tracing::debug;

use super::types::{AssertedIdentity, RequestContext};
use crate::config::FederationConfig;

/// Server variables whose presence signals an active federation session.
/// The module exposes the IdP under either spelling depending on the web server.
pub const IDP_PRESENCE_FIELDS: [&str; 2] = ["HTTP_SHIB_IDENTITY_PROVIDER", "Shib-Identity-Provider"];

/// Extracts asserted identities according to the configured field names.
#[derive(Debug, Clone)]
pub struct AttributeSource {
    username_field: String,
    email_field: String,
    debug_enabled: bool,
    debug_path_prefix: String,
}

impl AttributeSource {
    pub fn new(config: &FederationConfig) -> Self {
        Self {
            username_field: config.username_field.clone(),
            email_field: config.email_field.clone(),
            debug_enabled: config.debug_enabled,
            debug_path_prefix: config.debug_path_prefix.clone(),
        }
    }

    /// Build the asserted identity for a request.
    pub fn extract(&self, ctx: &RequestContext) -> AssertedIdentity {
        let federation_active = Self::federation_active(ctx);

        let username = ctx.var(&self.username_field).map(|s| s.to_string());

        let email_candidates = ctx
            .var(&self.email_field)
            .map(|raw| raw.split(';').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        AssertedIdentity {
            username,
            email_candidates,
            attributes: ctx.env.clone(),
            federation_active,
        }
    }

    /// Check both spellings of the IdP presence header.
    pub fn federation_active(ctx: &RequestContext) -> bool {
        IDP_PRESENCE_FIELDS.iter().any(|f| ctx.var(f).is_some())
    }

    /// Full header set, sorted, when debug mode covers the current path.
    pub fn debug_dump(&self, ctx: &RequestContext) -> Option<BTreeMap<String, String>> {
        if !self.debug_enabled || !ctx.path.starts_with(&self.debug_path_prefix) {
            return None;
        }

        let dump: BTreeMap<String, String> = ctx
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        debug!(path = %ctx.path, headers = ?dump, "Federation debug dump");

        Some(dump)
    }
}
