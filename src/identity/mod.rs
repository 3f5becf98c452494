//! Identity resolution for federated logins.
//!
//! Maps the asserted username to a local account, creating it on first login
//! and reconciling the asserted e-mail address with the stored one.

pub mod resolver;

pub use resolver::{IdentityResolver, ResolutionOutcome, ResolveRequest, CUSTOM_EMAIL_FORM_PATH};
