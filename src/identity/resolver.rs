//! Resolution of an asserted identity to a local account.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::accounts::{AccountDirectory, Caller, LocalAccount};
use crate::attributes::AssertedIdentity;
use crate::error::FederationError;
use crate::session::{AuthSource, FederationSession, PendingEmailRequest};

/// Path of the host's custom e-mail form.
pub const CUSTOM_EMAIL_FORM_PATH: &str = "shib_auth/get_custom_mail";

/// Everything the resolver looks at for one request.
pub struct ResolveRequest<'a> {
    pub identity: &'a AssertedIdentity,
    pub caller: &'a Caller,
    pub session: &'a mut FederationSession,
    /// Current path, remembered when the user is sent to the e-mail form.
    pub path: &'a str,
    /// Custom e-mail form submission.
    pub custom_email: Option<&'a str>,
}

/// What happened to the caller's identity on this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The caller already had a local session.
    AlreadyAuthenticated,
    /// No federation headers on this request.
    NotFederated,
    /// The redirect to the e-mail form is on its way; nothing to do yet.
    AwaitingRetry,
    MissingUsername,
    LoggedIn { account: LocalAccount },
    LoggedInEmailUpdated { account: LocalAccount },
    EmailConflict { email: String },
    UsernameConflict { username: String },
    AccountCreated {
        account: LocalAccount,
        /// Path to return to after a custom e-mail detour.
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<String>,
    },
    MissingEmail,
    /// The user must supply an e-mail address first.
    AwaitingEmail { redirect: String },
}

impl ResolutionOutcome {
    /// The account logged in by this request, if any.
    pub fn account(&self) -> Option<&LocalAccount> {
        match self {
            ResolutionOutcome::LoggedIn { account }
            | ResolutionOutcome::LoggedInEmailUpdated { account }
            | ResolutionOutcome::AccountCreated { account, .. } => Some(account),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error().is_some()
    }

    /// The failure condition, for outcomes that abort the login.
    pub fn error(&self) -> Option<FederationError> {
        match self {
            ResolutionOutcome::MissingUsername => Some(FederationError::MissingUsername),
            ResolutionOutcome::MissingEmail => Some(FederationError::MissingEmail),
            ResolutionOutcome::EmailConflict { email } => Some(FederationError::EmailConflict {
                email: email.clone(),
            }),
            ResolutionOutcome::UsernameConflict { username } => {
                Some(FederationError::UsernameConflict {
                    username: username.clone(),
                })
            }
            _ => None,
        }
    }

    /// Where the host should send the browser next.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            ResolutionOutcome::AwaitingEmail { redirect } => Some(redirect),
            ResolutionOutcome::AccountCreated { resume, .. } => resume.as_deref(),
            _ => None,
        }
    }

    fn from_error(err: FederationError) -> Option<Self> {
        match err {
            FederationError::MissingUsername => Some(ResolutionOutcome::MissingUsername),
            FederationError::MissingEmail => Some(ResolutionOutcome::MissingEmail),
            FederationError::EmailConflict { email } => {
                Some(ResolutionOutcome::EmailConflict { email })
            }
            FederationError::UsernameConflict { username } => {
                Some(ResolutionOutcome::UsernameConflict { username })
            }
            _ => None,
        }
    }
}

/// Maps asserted identities to local accounts, creating them on first login.
pub struct IdentityResolver {
    mail_shib_only: bool,
    directory: Arc<dyn AccountDirectory>,
}

impl IdentityResolver {
    pub fn new(mail_shib_only: bool, directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            mail_shib_only,
            directory,
        }
    }

    /// Resolve the request's identity. Login failures are outcomes; only
    /// account store failures are errors.
    pub fn resolve(&self, request: ResolveRequest<'_>) -> Result<ResolutionOutcome> {
        let ResolveRequest {
            identity,
            caller,
            session,
            path,
            custom_email,
        } = request;

        if caller.is_authenticated() {
            return Ok(ResolutionOutcome::AlreadyAuthenticated);
        }

        if !identity.federation_active {
            return Ok(ResolutionOutcome::NotFederated);
        }

        if let Some(pending) = session.pending_email.as_mut() {
            if pending.redirect_in_flight {
                pending.redirect_in_flight = false;
                debug!(session_id = %session.id, "E-mail form redirect delivered");
                return Ok(ResolutionOutcome::AwaitingRetry);
            }
        }

        let username = match identity.username.as_deref().filter(|u| !u.is_empty()) {
            Some(u) => u,
            None => return Ok(Self::report(ResolutionOutcome::MissingUsername)),
        };

        let outcome = match self.directory.find_by_username(username)? {
            Some(account) => self.resolve_existing(account, identity.primary_email())?,
            None => self.resolve_new(username, identity.primary_email(), session, path, custom_email)?,
        };

        if let Some(account) = outcome.account() {
            session.authentication_source = Some(AuthSource::Federation);
            self.directory.link_federation(account.id, username)?;
            info!(account_id = account.id, username = %username, "Federated login");
        }

        Ok(Self::report(outcome))
    }

    fn resolve_existing(
        &self,
        account: LocalAccount,
        candidate: Option<&str>,
    ) -> Result<ResolutionOutcome> {
        let email = match candidate {
            Some(email) if !self.mail_shib_only => email,
            _ => return Ok(ResolutionOutcome::LoggedIn { account }),
        };

        if account.has_email(email) {
            return Ok(ResolutionOutcome::LoggedIn { account });
        }

        if let Some(owner) = self.directory.find_by_email(email)? {
            if owner.id != account.id {
                return Ok(ResolutionOutcome::EmailConflict {
                    email: email.to_string(),
                });
            }
            return Ok(ResolutionOutcome::LoggedIn { account });
        }

        match self.directory.update_email(account.id, email) {
            Ok(account) => {
                info!(account_id = account.id, "Account e-mail updated from federation attributes");
                Ok(ResolutionOutcome::LoggedInEmailUpdated { account })
            }
            Err(e) => Self::conflict_or_err(e),
        }
    }

    fn resolve_new(
        &self,
        username: &str,
        candidate: Option<&str>,
        session: &mut FederationSession,
        path: &str,
        custom_email: Option<&str>,
    ) -> Result<ResolutionOutcome> {
        if let Some(email) = candidate {
            if self.directory.find_by_email(email)?.is_some() {
                return Ok(ResolutionOutcome::EmailConflict {
                    email: email.to_string(),
                });
            }
            return self.create(username, email, None);
        }

        if !self.mail_shib_only {
            return Ok(ResolutionOutcome::MissingEmail);
        }

        let target = Self::return_target(session, path);
        match custom_email.map(str::trim).filter(|e| !e.is_empty()) {
            Some(email) => {
                let outcome = if self.directory.find_by_email(email)?.is_some() {
                    ResolutionOutcome::EmailConflict {
                        email: email.to_string(),
                    }
                } else {
                    self.create(username, email, Some(target.clone()))?
                };

                if outcome.account().is_some() {
                    session.pending_email = None;
                } else {
                    // The user stays on the form; keep the target for the next attempt
                    session.pending_email = Some(PendingEmailRequest {
                        target_return_path: target,
                        redirect_in_flight: false,
                    });
                }
                Ok(outcome)
            }
            None => {
                session.pending_email = Some(PendingEmailRequest::new(target));
                debug!(session_id = %session.id, "Asking user for an e-mail address");
                Ok(ResolutionOutcome::AwaitingEmail {
                    redirect: CUSTOM_EMAIL_FORM_PATH.to_string(),
                })
            }
        }
    }

    /// Path to resume after the e-mail detour. The form itself is never a
    /// target; it falls back to the front page.
    fn return_target(session: &FederationSession, path: &str) -> String {
        match session.pending_email.as_ref() {
            Some(pending) => pending.target_return_path.clone(),
            None if path.trim_start_matches('/') == CUSTOM_EMAIL_FORM_PATH => String::new(),
            None => path.to_string(),
        }
    }

    fn create(
        &self,
        username: &str,
        email: &str,
        resume: Option<String>,
    ) -> Result<ResolutionOutcome> {
        match self.directory.create(username, email) {
            Ok(account) => Ok(ResolutionOutcome::AccountCreated { account, resume }),
            Err(e) => Self::conflict_or_err(e),
        }
    }

    /// Uniqueness violations raised by the store become outcomes.
    fn conflict_or_err(err: anyhow::Error) -> Result<ResolutionOutcome> {
        let outcome = err
            .downcast_ref::<FederationError>()
            .cloned()
            .and_then(ResolutionOutcome::from_error);
        match outcome {
            Some(outcome) => Ok(outcome),
            None => Err(err),
        }
    }

    /// Write the admin log entry for a failed login.
    fn report(outcome: ResolutionOutcome) -> ResolutionOutcome {
        if let Some(err) = outcome.error() {
            if err.is_critical() {
                error!(error = %err, "Federated login failed");
            } else {
                warn!(error = %err, "Federated login failed");
            }
        }
        outcome
    }
}
