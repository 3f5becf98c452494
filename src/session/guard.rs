//! Session binding and invalidation.
//!
//! A session is bound to the first asserted username it sees. Later requests
//! carrying federation headers for a different user, or a federated session
//! that lost its headers, clear the session and demote the caller.

use serde::Serialize;
use tracing::{debug, info};

use super::types::FederationSession;
use crate::accounts::Caller;
use crate::attributes::AssertedIdentity;

/// Shown when a federated session is destroyed because the headers vanished.
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session is expired. Please log in again!";

/// Binding state of a session after the guard ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Unbound,
    Bound,
    Invalidated,
}

impl BindingState {
    pub fn of(session: &FederationSession) -> Self {
        if session.is_bound() {
            BindingState::Bound
        } else {
            BindingState::Unbound
        }
    }
}

/// Why a session was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// Federated session without federation headers (auto-destroy).
    HeadersMissing,
    /// The asserted username differs from the bound one.
    UsernameMismatch,
}

/// Result of one guard check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardDecision {
    pub state: BindingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidationReason>,
    /// Whether this request bound the session.
    pub newly_bound: bool,
}

impl GuardDecision {
    fn keep(session: &FederationSession, newly_bound: bool) -> Self {
        Self {
            state: BindingState::of(session),
            reason: None,
            newly_bound,
        }
    }

    fn invalidated(reason: InvalidationReason) -> Self {
        Self {
            state: BindingState::Invalidated,
            reason: Some(reason),
            newly_bound: false,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.state == BindingState::Invalidated
    }

    /// User-facing message, if any. Mismatch resets are silent.
    pub fn user_message(&self) -> Option<&'static str> {
        match self.reason {
            Some(InvalidationReason::HeadersMissing) => Some(SESSION_EXPIRED_MESSAGE),
            _ => None,
        }
    }
}

/// Validates and binds sessions against the asserted identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionGuard {
    auto_destroy: bool,
}

impl SessionGuard {
    pub fn new(auto_destroy: bool) -> Self {
        Self { auto_destroy }
    }

    /// Check the session for this request, clearing it and demoting the
    /// caller when it no longer belongs to the asserted user.
    pub fn check(
        &self,
        identity: &AssertedIdentity,
        session: &mut FederationSession,
        caller: &mut Caller,
    ) -> GuardDecision {
        // Federated session whose headers went away
        if self.auto_destroy
            && !identity.federation_active
            && session.is_federated()
            && caller.account().map(|a| !a.is_superuser()).unwrap_or(false)
        {
            info!(
                session_id = %session.id,
                account_id = ?caller.account_id(),
                "Federation headers missing, destroying session"
            );
            Self::invalidate(session, caller);
            return GuardDecision::invalidated(InvalidationReason::HeadersMissing);
        }

        if !identity.federation_active {
            return GuardDecision::keep(session, false);
        }

        let asserted = identity.username_or_empty();
        if let Some(bound) = session.bound_username.as_deref() {
            if bound != asserted {
                debug!(
                    session_id = %session.id,
                    bound = %bound,
                    asserted = %asserted,
                    "Asserted username differs from session binding, clearing session"
                );
                Self::invalidate(session, caller);
                return GuardDecision::invalidated(InvalidationReason::UsernameMismatch);
            }
            return GuardDecision::keep(session, false);
        }

        if asserted.is_empty() {
            return GuardDecision::keep(session, false);
        }

        session.bound_username = Some(asserted.to_string());
        debug!(session_id = %session.id, username = %asserted, "Session bound");
        GuardDecision::keep(session, true)
    }

    fn invalidate(session: &mut FederationSession, caller: &mut Caller) {
        session.reset();
        *caller = Caller::Anonymous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{LocalAccount, SUPERUSER_ID};
    use crate::session::types::AuthSource;

    fn asserted(username: Option<&str>) -> AssertedIdentity {
        AssertedIdentity {
            username: username.map(str::to_string),
            federation_active: true,
            ..Default::default()
        }
    }

    fn headers_gone() -> AssertedIdentity {
        AssertedIdentity::default()
    }

    fn account(id: u64) -> Caller {
        Caller::Account(LocalAccount::new(id, "alice", Some("alice@example.org".to_string())))
    }

    #[test]
    fn test_first_request_binds() {
        let guard = SessionGuard::new(false);
        let mut session = FederationSession::new(3600);
        let mut caller = Caller::Anonymous;

        let decision = guard.check(&asserted(Some("alice")), &mut session, &mut caller);
        assert_eq!(decision.state, BindingState::Bound);
        assert!(decision.newly_bound);
        assert_eq!(session.bound_username.as_deref(), Some("alice"));

        let again = guard.check(&asserted(Some("alice")), &mut session, &mut caller);
        assert_eq!(again.state, BindingState::Bound);
        assert!(!again.newly_bound);
    }

    #[test]
    fn test_empty_username_does_not_bind() {
        let guard = SessionGuard::new(false);
        let mut session = FederationSession::new(3600);
        let mut caller = Caller::Anonymous;

        let decision = guard.check(&asserted(None), &mut session, &mut caller);
        assert_eq!(decision.state, BindingState::Unbound);
        assert!(!session.is_bound());
    }

    #[test]
    fn test_mismatch_clears_session() {
        let guard = SessionGuard::new(false);
        let mut session = FederationSession::new(3600);
        session.bound_username = Some("alice".to_string());
        session.authentication_source = Some(AuthSource::Federation);
        let mut caller = account(5);

        let decision = guard.check(&asserted(Some("bob")), &mut session, &mut caller);
        assert!(decision.is_invalidated());
        assert_eq!(decision.reason, Some(InvalidationReason::UsernameMismatch));
        assert_eq!(decision.user_message(), None);
        assert_eq!(caller, Caller::Anonymous);
        assert!(!session.is_bound());
        assert!(!session.is_federated());

        // Next request starts unbound and binds to the new user
        let next = guard.check(&asserted(Some("bob")), &mut session, &mut caller);
        assert!(next.newly_bound);
    }

    #[test]
    fn test_missing_username_on_bound_session_is_mismatch() {
        let guard = SessionGuard::new(false);
        let mut session = FederationSession::new(3600);
        session.bound_username = Some("alice".to_string());
        let mut caller = Caller::Anonymous;

        let decision = guard.check(&asserted(None), &mut session, &mut caller);
        assert_eq!(decision.reason, Some(InvalidationReason::UsernameMismatch));
    }

    #[test]
    fn test_auto_destroy_when_headers_missing() {
        let guard = SessionGuard::new(true);
        let mut session = FederationSession::new(3600);
        session.bound_username = Some("alice".to_string());
        session.authentication_source = Some(AuthSource::Federation);
        let mut caller = account(5);

        let decision = guard.check(&headers_gone(), &mut session, &mut caller);
        assert_eq!(decision.reason, Some(InvalidationReason::HeadersMissing));
        assert_eq!(decision.user_message(), Some(SESSION_EXPIRED_MESSAGE));
        assert!(!caller.is_authenticated());
    }

    #[test]
    fn test_auto_destroy_disabled_keeps_session() {
        let guard = SessionGuard::new(false);
        let mut session = FederationSession::new(3600);
        session.authentication_source = Some(AuthSource::Federation);
        let mut caller = account(5);

        let decision = guard.check(&headers_gone(), &mut session, &mut caller);
        assert!(!decision.is_invalidated());
        assert!(caller.is_authenticated());
    }

    #[test]
    fn test_superuser_exempt_from_auto_destroy() {
        let guard = SessionGuard::new(true);
        let mut session = FederationSession::new(3600);
        session.authentication_source = Some(AuthSource::Federation);
        let mut caller = account(SUPERUSER_ID);

        let decision = guard.check(&headers_gone(), &mut session, &mut caller);
        assert!(!decision.is_invalidated());
        assert!(caller.is_authenticated());
    }

    #[test]
    fn test_auto_destroy_ignores_non_federated_session() {
        let guard = SessionGuard::new(true);
        let mut session = FederationSession::new(3600);
        let mut caller = account(5);

        let decision = guard.check(&headers_gone(), &mut session, &mut caller);
        assert!(!decision.is_invalidated());
    }
}
