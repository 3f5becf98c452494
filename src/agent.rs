//! Per-request orchestration of the federation components.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info};

use crate::accounts::{AccountDirectory, Caller, LocalAccount};
use crate::attributes::{AttributeSource, RequestContext};
use crate::authz::AuthorizationEngine;
use crate::config::{FederationConfig, FederationConfigJson};
use crate::error::FederationError;
use crate::handler;
use crate::identity::{IdentityResolver, ResolutionOutcome, ResolveRequest};
use crate::rules::{GrantSet, RuleStore};
use crate::session::{FederationSession, GuardDecision, SessionGuard};

/// Severity of a message shown to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Status,
    Warning,
    Error,
}

/// Message for the host's user-facing message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub level: MessageLevel,
    pub text: String,
}

impl UserMessage {
    fn new(level: MessageLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Login link for the host's login block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginLink {
    pub url: String,
    pub text: String,
}

/// Everything the host needs to finish the request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    /// Caller identity for the rest of the request.
    pub caller: Caller,
    /// Identity resolution, skipped when the session was invalidated.
    pub resolution: Option<ResolutionOutcome>,
    pub guard: GuardDecision,
    /// Roles held after rule evaluation.
    pub grants: GrantSet,
    /// Whether the host must refresh its cached permissions.
    pub cache_stale: bool,
    /// Where to send the browser next, if anywhere.
    pub redirect: Option<String>,
    pub messages: Vec<UserMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_headers: Option<BTreeMap<String, String>>,
}

/// The federation agent.
pub struct FederationAgent {
    config: RwLock<FederationConfig>,
    rules: Arc<RuleStore>,
    directory: Arc<dyn AccountDirectory>,
    engine: AuthorizationEngine,
}

impl FederationAgent {
    pub fn new(
        config: FederationConfig,
        rules: Arc<RuleStore>,
        directory: Arc<dyn AccountDirectory>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            rules,
            directory,
            engine: AuthorizationEngine::new(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Result<FederationConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| anyhow!("Failed to acquire read lock"))
    }

    /// Reconfigure the agent with new settings.
    pub fn reconfigure(&self, json_config: FederationConfigJson) -> Result<()> {
        let mut config = self
            .config
            .write()
            .map_err(|_| anyhow!("Failed to acquire write lock"))?;

        let mut updated = config.clone();
        json_config.apply_to(&mut updated);
        updated
            .validate()
            .map_err(|e| anyhow!("Invalid federation config: {}", e))?;
        *config = updated;

        info!(
            mail_shib_only = config.mail_shib_only,
            auto_destroy_session = config.auto_destroy_session,
            debug_enabled = config.debug_enabled,
            "Reconfigured federation agent"
        );
        Ok(())
    }

    /// Run one request through the federation pipeline.
    pub fn handle_request(
        &self,
        ctx: &RequestContext,
        session: &mut FederationSession,
        caller: Caller,
    ) -> Result<RequestOutcome> {
        let config = self.config()?;
        let mut caller = caller;
        let mut messages = Vec::new();

        let source = AttributeSource::new(&config);
        let identity = source.extract(ctx);

        let debug_headers = source.debug_dump(ctx);
        if let Some(ref headers) = debug_headers {
            let listing = headers
                .iter()
                .map(|(k, v)| format!("{} => {}", k, v))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(UserMessage::new(MessageLevel::Status, listing));
        }

        let guard = SessionGuard::new(config.auto_destroy_session).check(&identity, session, &mut caller);
        if guard.is_invalidated() {
            if let Some(text) = guard.user_message() {
                messages.push(UserMessage::new(MessageLevel::Warning, text));
            }
            return Ok(RequestOutcome {
                caller,
                resolution: None,
                guard,
                grants: GrantSet::new(),
                cache_stale: false,
                redirect: None,
                messages,
                debug_headers,
            });
        }

        let resolver = IdentityResolver::new(config.mail_shib_only, Arc::clone(&self.directory));
        let resolution = resolver
            .resolve(ResolveRequest {
                identity: &identity,
                caller: &caller,
                session: &mut *session,
                path: &ctx.path,
                custom_email: ctx.custom_email.as_deref(),
            })
            .map_err(account_store_failure)?;

        if let Some(account) = resolution.account() {
            caller = Caller::Account(account.clone());
        }
        if let Some(err) = resolution.error() {
            messages.push(UserMessage::new(MessageLevel::Error, err.user_message()));
        }

        let current = caller
            .account()
            .map(|a| a.roles.clone())
            .unwrap_or_default();
        let evaluation = self
            .engine
            .compute_grants(&identity, &self.rules.list()?, &current);

        if evaluation.cache_stale {
            if let Caller::Account(ref account) = caller {
                let saved = self
                    .directory
                    .save_roles(account.id, &evaluation.grants)
                    .map_err(account_store_failure)?;
                info!(
                    account_id = saved.id,
                    roles = %saved.roles.display_names(),
                    "Roles granted by attribute rules"
                );
                caller = Caller::Account(saved);
            }
        }

        let redirect = resolution.redirect().map(str::to_string);

        debug!(
            session_id = %session.id,
            account_id = ?caller.account_id(),
            matched_rules = evaluation.matched_rules.len(),
            "Federation request handled"
        );

        Ok(RequestOutcome {
            caller,
            resolution: Some(resolution),
            guard,
            grants: evaluation.grants,
            cache_stale: evaluation.cache_stale,
            redirect,
            messages,
            debug_headers,
        })
    }

    /// End the federated login and return the IdP logout redirect.
    pub fn logout(
        &self,
        ctx: &RequestContext,
        session: &mut FederationSession,
        base_url: &str,
    ) -> Result<String> {
        let config = self.config()?;
        session.authentication_source = None;
        session.pending_email = None;

        let url = handler::logout_redirect(&config, &ctx.host, base_url);
        info!(session_id = %session.id, redirect = %url, "Federated logout");
        Ok(url)
    }

    /// Account deletion hook: drop the federation mapping.
    pub fn on_account_deleted(&self, account: &LocalAccount) -> Result<()> {
        let removed = self
            .directory
            .remove_federation_mapping(account.id, &account.username)?;
        if removed {
            info!(account_id = account.id, username = %account.username, "Federation mapping removed");
        }
        Ok(())
    }

    /// Login link for anonymous callers.
    pub fn login_link(
        &self,
        ctx: &RequestContext,
        caller: &Caller,
        base_path: &str,
    ) -> Result<Option<LoginLink>> {
        if caller.is_authenticated() {
            return Ok(None);
        }
        let config = self.config()?;
        Ok(Some(LoginLink {
            url: handler::login_link(&config, ctx, base_path),
            text: config.link_text,
        }))
    }
}

/// Tag an account directory failure as `FederationError::AccountStore`.
fn account_store_failure(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<FederationError>().is_some() {
        return err;
    }
    error!(error = %err, "Account store failure");
    let detail = format!("{:#}", err);
    err.context(FederationError::AccountStore(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::identity::CUSTOM_EMAIL_FORM_PATH;
    use crate::rules::{RoleId, RuleDraft};
    use crate::session::{AuthSource, BindingState, InvalidationReason, PendingEmailRequest};
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct Fixture {
        agent: FederationAgent,
        accounts: Arc<AccountStore>,
        rules: Arc<RuleStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: FederationConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let rules = Arc::new(RuleStore::open(dir.path().join("rules.redb")).unwrap());
        let accounts = Arc::new(AccountStore::open(dir.path().join("accounts.redb")).unwrap());
        let agent = FederationAgent::new(config, Arc::clone(&rules), accounts.clone());
        Fixture {
            agent,
            accounts,
            rules,
            _dir: dir,
        }
    }

    fn shib_request(path: &str, pairs: &[(&str, &str)]) -> RequestContext {
        let mut env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert(
            "HTTP_SHIB_IDENTITY_PROVIDER".to_string(),
            "https://idp.example.org/idp/shibboleth".to_string(),
        );
        RequestContext::new(path, env).with_host("www.example.org")
    }

    fn plain_request(path: &str) -> RequestContext {
        RequestContext::new(path, HashMap::new()).with_host("www.example.org")
    }

    #[test]
    fn test_first_login_with_rule_grants() {
        let fx = fixture(FederationConfig::default());
        fx.rules
            .create(RuleDraft::new(
                "HTTP_SHIB_AFFILIATION",
                "^staff$",
                GrantSet::from_pairs([(2, "editor")]),
            ))
            .unwrap();

        let mut session = FederationSession::new(3600);
        let ctx = shib_request(
            "node/1",
            &[
                ("REMOTE_USER", "alice"),
                ("HTTP_SHIB_MAIL", "alice@x.org"),
                ("HTTP_SHIB_AFFILIATION", "student; staff"),
            ],
        );

        let outcome = fx.agent.handle_request(&ctx, &mut session, Caller::Anonymous).unwrap();
        assert!(matches!(outcome.resolution, Some(ResolutionOutcome::AccountCreated { .. })));
        assert!(outcome.caller.is_authenticated());
        assert!(outcome.cache_stale);
        assert!(outcome.grants.contains(RoleId(2)));
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.guard.state, BindingState::Bound);
        assert_eq!(session.authentication_source, Some(AuthSource::Federation));

        let stored = fx.accounts.find_by_username("alice").unwrap().unwrap();
        assert!(stored.roles.contains(RoleId(2)));

        // Second request: nothing new to grant
        let again = fx.agent.handle_request(&ctx, &mut session, outcome.caller).unwrap();
        assert_eq!(again.resolution, Some(ResolutionOutcome::AlreadyAuthenticated));
        assert!(!again.cache_stale);
    }

    #[test]
    fn test_session_switch_to_other_user() {
        let fx = fixture(FederationConfig::default());
        let mut session = FederationSession::new(3600);

        let alice = shib_request("node/1", &[("REMOTE_USER", "alice"), ("HTTP_SHIB_MAIL", "alice@x.org")]);
        let first = fx.agent.handle_request(&alice, &mut session, Caller::Anonymous).unwrap();
        assert!(first.caller.is_authenticated());
        session.pending_email = Some(PendingEmailRequest::new("node/9"));

        let bob = shib_request("node/1", &[("REMOTE_USER", "bob"), ("HTTP_SHIB_MAIL", "bob@x.org")]);
        let second = fx.agent.handle_request(&bob, &mut session, first.caller).unwrap();
        assert_eq!(second.guard.reason, Some(InvalidationReason::UsernameMismatch));
        assert_eq!(second.caller, Caller::Anonymous);
        assert!(second.resolution.is_none());
        assert!(second.messages.is_empty());
        assert!(session.bound_username.is_none());
        assert!(session.pending_email.is_none());
        assert!(!session.is_federated());

        // The next request logs bob in
        let third = fx.agent.handle_request(&bob, &mut session, second.caller).unwrap();
        assert_eq!(
            third.caller.account().map(|a| a.username.as_str()),
            Some("bob")
        );
        assert_eq!(session.bound_username.as_deref(), Some("bob"));
    }

    #[test]
    fn test_auto_destroy_session() {
        let config = FederationConfig {
            auto_destroy_session: true,
            ..Default::default()
        };
        let fx = fixture(config);
        let mut session = FederationSession::new(3600);

        let login = shib_request("node/1", &[("REMOTE_USER", "alice"), ("HTTP_SHIB_MAIL", "alice@x.org")]);
        let first = fx.agent.handle_request(&login, &mut session, Caller::Anonymous).unwrap();

        let outcome = fx.agent.handle_request(&plain_request("node/2"), &mut session, first.caller).unwrap();
        assert_eq!(outcome.guard.reason, Some(InvalidationReason::HeadersMissing));
        assert_eq!(outcome.caller, Caller::Anonymous);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].level, MessageLevel::Warning);
        assert!(outcome.messages[0].text.contains("session is expired"));
    }

    #[test]
    fn test_missing_email_reports_error() {
        let fx = fixture(FederationConfig::default());
        let mut session = FederationSession::new(3600);

        let ctx = shib_request("node/1", &[("REMOTE_USER", "dave")]);
        let outcome = fx.agent.handle_request(&ctx, &mut session, Caller::Anonymous).unwrap();
        assert_eq!(outcome.resolution, Some(ResolutionOutcome::MissingEmail));
        assert!(!outcome.caller.is_authenticated());
        assert_eq!(outcome.messages[0].level, MessageLevel::Error);
        assert!(outcome.messages[0].text.contains("E-mail address is missing"));
        assert_eq!(fx.accounts.count().unwrap(), 0);
    }

    #[test]
    fn test_anonymous_grants_not_persisted() {
        let fx = fixture(FederationConfig::default());
        fx.rules
            .create(RuleDraft::new("HTTP_SHIB_AFFILIATION", "staff", GrantSet::from_pairs([(2, "editor")])))
            .unwrap();
        let mut session = FederationSession::new(3600);

        let ctx = shib_request("node/1", &[("REMOTE_USER", "dave"), ("HTTP_SHIB_AFFILIATION", "staff")]);
        let outcome = fx.agent.handle_request(&ctx, &mut session, Caller::Anonymous).unwrap();
        assert!(!outcome.caller.is_authenticated());
        assert!(outcome.grants.contains(RoleId(2)));
        assert_eq!(fx.accounts.count().unwrap(), 0);
    }

    #[test]
    fn test_custom_email_flow() {
        let config = FederationConfig {
            mail_shib_only: true,
            ..Default::default()
        };
        let fx = fixture(config);
        let mut session = FederationSession::new(3600);

        let first = fx
            .agent
            .handle_request(&shib_request("node/42", &[("REMOTE_USER", "carol")]), &mut session, Caller::Anonymous)
            .unwrap();
        assert_eq!(first.redirect.as_deref(), Some(CUSTOM_EMAIL_FORM_PATH));

        let form = shib_request(CUSTOM_EMAIL_FORM_PATH, &[("REMOTE_USER", "carol")]);
        let second = fx.agent.handle_request(&form, &mut session, first.caller).unwrap();
        assert_eq!(second.resolution, Some(ResolutionOutcome::AwaitingRetry));
        assert!(second.redirect.is_none());

        let submit = form.clone().with_custom_email("carol@x.org");
        let third = fx.agent.handle_request(&submit, &mut session, second.caller).unwrap();
        assert!(third.caller.is_authenticated());
        assert_eq!(third.redirect.as_deref(), Some("node/42"));
        assert!(session.pending_email.is_none());
    }

    #[test]
    fn test_debug_dump_message() {
        let config = FederationConfig {
            debug_enabled: true,
            debug_path_prefix: "admin".to_string(),
            ..Default::default()
        };
        let fx = fixture(config);
        let mut session = FederationSession::new(3600);

        let outside = fx
            .agent
            .handle_request(&plain_request("node/1"), &mut session, Caller::Anonymous)
            .unwrap();
        assert!(outside.debug_headers.is_none());

        let mut ctx = plain_request("admin/config");
        ctx.env.insert("HTTP_SHIB_AFFILIATION".to_string(), "staff".to_string());
        let inside = fx.agent.handle_request(&ctx, &mut session, Caller::Anonymous).unwrap();
        let headers = inside.debug_headers.unwrap();
        assert_eq!(headers.get("HTTP_SHIB_AFFILIATION").map(String::as_str), Some("staff"));
        assert_eq!(inside.messages[0].level, MessageLevel::Status);
        assert!(inside.messages[0].text.contains("HTTP_SHIB_AFFILIATION => staff"));
    }

    #[test]
    fn test_logout_clears_markers() {
        let fx = fixture(FederationConfig::default());
        let mut session = FederationSession::new(3600);
        let login = shib_request("node/1", &[("REMOTE_USER", "alice"), ("HTTP_SHIB_MAIL", "alice@x.org")]);
        fx.agent.handle_request(&login, &mut session, Caller::Anonymous).unwrap();

        let url = fx
            .agent
            .logout(&plain_request("user/logout"), &mut session, "https://www.example.org")
            .unwrap();
        assert_eq!(
            url,
            "https://www.example.org/Shibboleth.sso/Logout?return=https%3A%2F%2Fwww.example.org"
        );
        assert!(!session.is_federated());
        assert!(session.pending_email.is_none());
    }

    #[test]
    fn test_account_deletion_hook() {
        let fx = fixture(FederationConfig::default());
        let mut session = FederationSession::new(3600);
        let login = shib_request("node/1", &[("REMOTE_USER", "alice"), ("HTTP_SHIB_MAIL", "alice@x.org")]);
        let outcome = fx.agent.handle_request(&login, &mut session, Caller::Anonymous).unwrap();
        let account = outcome.caller.account().unwrap().clone();
        assert!(fx.accounts.federation_mapping("alice").unwrap().is_some());

        fx.agent.on_account_deleted(&account).unwrap();
        assert!(fx.accounts.federation_mapping("alice").unwrap().is_none());
    }

    #[test]
    fn test_login_link_only_for_anonymous() {
        let fx = fixture(FederationConfig::default());
        let ctx = plain_request("node/5");

        let link = fx.agent.login_link(&ctx, &Caller::Anonymous, "").unwrap().unwrap();
        assert!(link.url.contains("/Shibboleth.sso/DS?target="));
        assert_eq!(link.text, "Shibboleth Login");

        let caller = Caller::Account(LocalAccount::new(7, "alice", None));
        assert!(fx.agent.login_link(&ctx, &caller, "").unwrap().is_none());
    }

    /// Directory whose backing store is unavailable.
    struct UnavailableDirectory;

    impl AccountDirectory for UnavailableDirectory {
        fn find_by_username(&self, _username: &str) -> Result<Option<LocalAccount>> {
            Err(anyhow!("database is locked"))
        }

        fn find_by_email(&self, _email: &str) -> Result<Option<LocalAccount>> {
            Err(anyhow!("database is locked"))
        }

        fn create(&self, _username: &str, _email: &str) -> Result<LocalAccount> {
            Err(anyhow!("database is locked"))
        }

        fn update_email(&self, _id: u64, _email: &str) -> Result<LocalAccount> {
            Err(anyhow!("database is locked"))
        }

        fn save_roles(&self, _id: u64, _roles: &GrantSet) -> Result<LocalAccount> {
            Err(anyhow!("database is locked"))
        }

        fn link_federation(&self, _id: u64, _username: &str) -> Result<()> {
            Err(anyhow!("database is locked"))
        }

        fn remove_federation_mapping(&self, _id: u64, _username: &str) -> Result<bool> {
            Err(anyhow!("database is locked"))
        }
    }

    #[test]
    fn test_account_store_failure_is_typed() {
        let dir = tempdir().unwrap();
        let rules = Arc::new(RuleStore::open(dir.path().join("rules.redb")).unwrap());
        let agent = FederationAgent::new(
            FederationConfig::default(),
            rules,
            Arc::new(UnavailableDirectory),
        );
        let mut session = FederationSession::new(3600);

        let ctx = shib_request("node/1", &[("REMOTE_USER", "alice"), ("HTTP_SHIB_MAIL", "alice@x.org")]);
        let err = agent
            .handle_request(&ctx, &mut session, Caller::Anonymous)
            .unwrap_err();

        let typed = err.downcast_ref::<FederationError>().unwrap();
        assert!(matches!(typed, FederationError::AccountStore(detail) if detail.contains("database is locked")));
        assert!(typed.is_critical());
        assert_eq!(
            typed.user_message(),
            "Error saving user account. Please try again later."
        );
    }

    #[test]
    fn test_reconfigure() {
        let fx = fixture(FederationConfig::default());

        fx.agent
            .reconfigure(FederationConfigJson {
                mail_shib_only: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(fx.agent.config().unwrap().mail_shib_only);

        let err = fx.agent.reconfigure(FederationConfigJson {
            handler_protocol: Some("ftp".to_string()),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(fx.agent.config().unwrap().handler_protocol, "https");
    }
}
