//! Shibboleth federation agent.
//!
//! Maps identities asserted by a Shibboleth IdP (through server-injected
//! variables) to local accounts and derives role grants from administrator
//! defined attribute rules.

pub mod accounts;
pub mod agent;
pub mod attributes;
pub mod authz;
pub mod config;
pub mod error;
pub mod handler;
pub mod identity;
pub mod rules;
pub mod session;

pub use agent::{FederationAgent, LoginLink, MessageLevel, RequestOutcome, UserMessage};
pub use config::{FederationConfig, FederationConfigJson};
pub use error::FederationError;
