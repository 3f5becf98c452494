//! Local account directory.
//!
//! The account store belongs to the host; the federation core reaches it
//! only through [`AccountDirectory`]. [`AccountStore`] is the redb-backed
//! implementation used by the agent binary and the tests.

pub mod store;
pub mod types;

use anyhow::Result;

use crate::rules::GrantSet;

pub use store::AccountStore;
pub use types::{Caller, LocalAccount, SUPERUSER_ID};

/// Operations the federation core needs from the host's account store.
///
/// `create` and `update_email` must enforce username and e-mail uniqueness
/// and report violations as `FederationError::UsernameConflict` /
/// `FederationError::EmailConflict` inside the returned error.
pub trait AccountDirectory: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<LocalAccount>>;

    fn find_by_email(&self, email: &str) -> Result<Option<LocalAccount>>;

    fn create(&self, username: &str, email: &str) -> Result<LocalAccount>;

    fn update_email(&self, id: u64, email: &str) -> Result<LocalAccount>;

    fn save_roles(&self, id: u64, roles: &GrantSet) -> Result<LocalAccount>;

    /// Record that `username` authenticates through federation as account `id`.
    fn link_federation(&self, id: u64, username: &str) -> Result<()>;

    /// Remove the federation mapping of a deleted account.
    fn remove_federation_mapping(&self, id: u64, username: &str) -> Result<bool>;
}
