//! Account store backed by redb embedded database.
//!
//! Provides persistent storage for local accounts with:
//! - In-memory cache for fast lookups
//! - Secondary indexes for username and e-mail (the uniqueness backstop)
//! - The federation mapping (username -> account id) of federated accounts

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{LocalAccount, SUPERUSER_ID};
use super::AccountDirectory;
use crate::error::FederationError;
use crate::rules::GrantSet;

/// Primary account table: id -> MessagePack<LocalAccount>.
const ACCOUNTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("accounts");
/// Secondary index: username -> id.
const USERNAME_INDEX: TableDefinition<&str, u64> = TableDefinition::new("accounts_username_index");
/// Secondary index: lowercased e-mail -> id.
const EMAIL_INDEX: TableDefinition<&str, u64> = TableDefinition::new("accounts_email_index");
/// Federation mapping: federated username -> id.
const AUTHMAP_TABLE: TableDefinition<&str, u64> = TableDefinition::new("accounts_authmap");
/// Store metadata (id sequence).
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("accounts_meta");

const NEXT_ID_KEY: &str = "next_account_id";

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Account store with in-memory caches and persistent storage.
pub struct AccountStore {
    db: Database,
    /// Primary cache: id -> account.
    account_cache: RwLock<HashMap<u64, LocalAccount>>,
    /// Index cache: username -> id.
    username_cache: RwLock<HashMap<String, u64>>,
}

impl AccountStore {
    /// Open or create an account store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open account database: {:?}", path))?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _ = write_txn.open_table(USERNAME_INDEX)?;
            let _ = write_txn.open_table(EMAIL_INDEX)?;
            let _ = write_txn.open_table(AUTHMAP_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        let (account_cache, username_cache) = Self::load_all(&db)?;
        debug!(accounts = account_cache.len(), "Loaded accounts into cache");

        Ok(Self {
            db,
            account_cache: RwLock::new(account_cache),
            username_cache: RwLock::new(username_cache),
        })
    }

    /// Get an account by id.
    pub fn get(&self, id: u64) -> Result<Option<LocalAccount>> {
        // Check cache first
        if let Ok(cache) = self.account_cache.read() {
            if let Some(account) = cache.get(&id) {
                return Ok(Some(account.clone()));
            }
        }

        // Fall back to database
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        match table.get(id)? {
            Some(value) => {
                let account: LocalAccount = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize account")?;

                if let Ok(mut cache) = self.account_cache.write() {
                    cache.insert(account.id, account.clone());
                }

                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Account id mapped to a federated username.
    pub fn federation_mapping(&self, username: &str) -> Result<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUTHMAP_TABLE)?;
        Ok(table.get(username)?.map(|v| v.value()))
    }

    /// Delete an account and its indexes. Returns false if it did not exist.
    pub fn delete(&self, id: u64) -> Result<bool> {
        let account = match self.get(id)? {
            Some(a) => a,
            None => return Ok(false),
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            let mut usernames = write_txn.open_table(USERNAME_INDEX)?;
            let mut emails = write_txn.open_table(EMAIL_INDEX)?;

            accounts.remove(id)?;
            usernames.remove(account.username.as_str())?;
            if let Some(ref email) = account.email {
                emails.remove(email_key(email).as_str())?;
            }
        }
        write_txn.commit()?;

        if let Ok(mut cache) = self.account_cache.write() {
            cache.remove(&id);
        }
        if let Ok(mut cache) = self.username_cache.write() {
            cache.remove(&account.username);
        }

        Ok(true)
    }

    /// Get total account count.
    pub fn count(&self) -> Result<usize> {
        if let Ok(cache) = self.account_cache.read() {
            return Ok(cache.len());
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Persist an account record and refresh caches.
    fn persist(&self, account: &LocalAccount) -> Result<()> {
        let data = rmp_serde::to_vec_named(account).context("Failed to serialize account")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS_TABLE)?;
            table.insert(account.id, data.as_slice())?;
        }
        write_txn.commit()?;

        self.cache_account(account);
        Ok(())
    }

    fn cache_account(&self, account: &LocalAccount) {
        if let Ok(mut cache) = self.account_cache.write() {
            cache.insert(account.id, account.clone());
        }
        if let Ok(mut cache) = self.username_cache.write() {
            cache.insert(account.username.clone(), account.id);
        }
    }

    fn require(&self, id: u64) -> Result<LocalAccount> {
        self.get(id)?
            .ok_or_else(|| anyhow!("Account {} not found", id))
    }

    /// Load all accounts and build the username cache.
    fn load_all(db: &Database) -> Result<(HashMap<u64, LocalAccount>, HashMap<String, u64>)> {
        let mut accounts = HashMap::new();
        let mut usernames = HashMap::new();

        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            match rmp_serde::from_slice::<LocalAccount>(value.value()) {
                Ok(account) => {
                    usernames.insert(account.username.clone(), account.id);
                    accounts.insert(account.id, account);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to deserialize account during load, skipping");
                }
            }
        }

        Ok((accounts, usernames))
    }
}

impl AccountDirectory for AccountStore {
    fn find_by_username(&self, username: &str) -> Result<Option<LocalAccount>> {
        let id = if let Ok(cache) = self.username_cache.read() {
            cache.get(username).copied()
        } else {
            None
        };

        if let Some(id) = id {
            return self.get(id);
        }

        // Fall back to database index
        let id = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(USERNAME_INDEX)?;
            table.get(username)?.map(|v| v.value())
        };

        match id {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    fn find_by_email(&self, email: &str) -> Result<Option<LocalAccount>> {
        let id = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(EMAIL_INDEX)?;
            table.get(email_key(email).as_str())?.map(|v| v.value())
        };

        match id {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    fn create(&self, username: &str, email: &str) -> Result<LocalAccount> {
        let key = email_key(email);

        // Uniqueness is checked inside the write transaction so a concurrent
        // first login for the same username loses with a conflict.
        let write_txn = self.db.begin_write()?;
        let account = {
            let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            let mut usernames = write_txn.open_table(USERNAME_INDEX)?;
            let mut emails = write_txn.open_table(EMAIL_INDEX)?;
            let mut meta = write_txn.open_table(META_TABLE)?;

            if usernames.get(username)?.is_some() {
                return Err(FederationError::UsernameConflict {
                    username: username.to_string(),
                }
                .into());
            }
            if emails.get(key.as_str())?.is_some() {
                return Err(FederationError::EmailConflict {
                    email: email.to_string(),
                }
                .into());
            }

            // Id 1 is reserved for the superuser
            let next = meta
                .get(NEXT_ID_KEY)?
                .map(|v| v.value())
                .unwrap_or(SUPERUSER_ID + 1);
            meta.insert(NEXT_ID_KEY, next + 1)?;

            let account = LocalAccount::new(next, username, Some(email.trim().to_string()));
            let data = rmp_serde::to_vec_named(&account).context("Failed to serialize account")?;

            accounts.insert(account.id, data.as_slice())?;
            usernames.insert(username, account.id)?;
            emails.insert(key.as_str(), account.id)?;
            account
        };
        write_txn.commit()?;

        self.cache_account(&account);

        info!(account_id = account.id, username = %account.username, "Account created");
        Ok(account)
    }

    fn update_email(&self, id: u64, email: &str) -> Result<LocalAccount> {
        let mut account = self.require(id)?;
        let key = email_key(email);

        let write_txn = self.db.begin_write()?;
        {
            let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            let mut emails = write_txn.open_table(EMAIL_INDEX)?;

            if let Some(owner) = emails.get(key.as_str())?.map(|v| v.value()) {
                if owner != id {
                    return Err(FederationError::EmailConflict {
                        email: email.to_string(),
                    }
                    .into());
                }
            }

            if let Some(ref old) = account.email {
                emails.remove(email_key(old).as_str())?;
            }

            account.email = Some(email.trim().to_string());
            account.updated_at = Utc::now();

            let data = rmp_serde::to_vec_named(&account).context("Failed to serialize account")?;
            accounts.insert(id, data.as_slice())?;
            emails.insert(key.as_str(), id)?;
        }
        write_txn.commit()?;

        self.cache_account(&account);

        debug!(account_id = id, "Account e-mail updated");
        Ok(account)
    }

    fn save_roles(&self, id: u64, roles: &GrantSet) -> Result<LocalAccount> {
        let mut account = self.require(id)?;
        account.roles = roles.clone();
        account.updated_at = Utc::now();
        self.persist(&account)?;
        Ok(account)
    }

    fn link_federation(&self, id: u64, username: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUTHMAP_TABLE)?;
            table.insert(username, id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_federation_mapping(&self, id: u64, username: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(AUTHMAP_TABLE)?;
            let mapped = table.get(username)?.map(|v| v.value());
            if mapped == Some(id) {
                table.remove(username)?;
                true
            } else {
                false
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }
}
