//! Shibboleth handler links: login, logout and the login return path.

use crate::attributes::RequestContext;
use crate::config::FederationConfig;

/// Path prefix the IdP sends the browser back to after login.
pub const LOGIN_RETURN_PREFIX: &str = "shib_login/";

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Absolute URL of the session initiator on this host.
fn handler_base(config: &FederationConfig, host: &str) -> String {
    if is_absolute(&config.handler_url) {
        config.handler_url.clone()
    } else {
        format!(
            "{}://{}{}",
            config.handler_protocol,
            host,
            with_leading_slash(&config.handler_url)
        )
    }
}

/// IdP logout redirect, returning to the configured post-logout page.
///
/// Relative post-logout targets are resolved against `base_url`.
pub fn logout_redirect(config: &FederationConfig, host: &str, base_url: &str) -> String {
    let logout = format!("{}/Logout", handler_base(config, host));

    let base = base_url.trim_end_matches('/');
    let target = match config.post_logout_redirect_url.as_deref().map(str::trim) {
        None | Some("") => base.to_string(),
        Some(url) if is_absolute(url) => url.to_string(),
        Some(url) => format!("{}/{}", base, url.trim_start_matches('/')),
    };

    format!("{}?return={}", logout, urlencoding::encode(&target))
}

/// Login link through the WAYF, returning to the current path via the
/// `shib_login/` prefix.
pub fn login_link(config: &FederationConfig, ctx: &RequestContext, base_path: &str) -> String {
    let wayf = format!(
        "{}{}",
        handler_base(config, &ctx.host),
        with_leading_slash(&config.wayf_uri)
    );

    let target = format!(
        "{}://{}{}/{}{}",
        ctx.scheme,
        ctx.host,
        base_path.trim_end_matches('/'),
        LOGIN_RETURN_PREFIX,
        ctx.path
    );

    format!("{}?target={}", wayf, urlencoding::encode(&target))
}

/// Path to redirect to when the IdP returns to `shib_login/<path>`.
///
/// Returns `None` for paths outside the login return prefix.
pub fn shib_login_return(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    if path == LOGIN_RETURN_PREFIX.trim_end_matches('/') {
        return Some(String::new());
    }
    path.strip_prefix(LOGIN_RETURN_PREFIX).map(str::to_string)
}
