//! Attribute-based role assignment rules.
//!
//! Each rule maps a server variable and a regular expression to a set of
//! roles. Rules are persisted in redb and administered through
//! [`RuleCommand`]s.

pub mod command;
pub mod store;
pub mod types;

pub use command::{RuleCommand, RuleCommandOutcome};
pub use store::RuleStore;
pub use types::{AuthorizationRule, GrantSet, RoleId, RuleDraft, RuleId, RuleListing};
