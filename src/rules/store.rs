//! Rule store backed by redb embedded database.
//!
//! Provides persistent storage for authorization rules with:
//! - Monotonic id allocation (ids are never reused)
//! - URL-encoded text fields and versioned grant envelopes at rest
//! - In-memory cache in store order

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{AuthorizationRule, RuleDraft, RuleId, StoredRule};
use crate::error::FederationError;

/// Rule table: rule id -> MessagePack<StoredRule>.
const RULES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("shib_auth_rules");
/// Store metadata (id sequence).
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("shib_auth_meta");

const NEXT_ID_KEY: &str = "next_rule_id";

/// Rule store with in-memory cache and persistent storage.
pub struct RuleStore {
    db: Database,
    /// Decoded rules, ordered by id (= insertion order).
    cache: RwLock<BTreeMap<RuleId, AuthorizationRule>>,
}

impl RuleStore {
    /// Open or create a rule store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open rule database: {:?}", path))?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RULES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_all(&db)?;
        debug!(rules = cache.len(), "Loaded authorization rules into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
        })
    }

    /// All rules in store order.
    pub fn list(&self) -> Result<Vec<AuthorizationRule>> {
        if let Ok(cache) = self.cache.read() {
            return Ok(cache.values().cloned().collect());
        }

        // Fall back to database
        Ok(Self::load_all(&self.db)?.into_values().collect())
    }

    /// Get a rule by id.
    pub fn get(&self, id: RuleId) -> Result<Option<AuthorizationRule>> {
        if let Ok(cache) = self.cache.read() {
            return Ok(cache.get(&id).cloned());
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RULES_TABLE)?;
        match table.get(id.0)? {
            Some(value) => {
                let stored: StoredRule = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize rule")?;
                Ok(Some(stored.decode(id)?))
            }
            None => Ok(None),
        }
    }

    /// Store a new rule and return its id.
    pub fn create(&self, draft: RuleDraft) -> Result<RuleId> {
        draft.validate()?;
        let stored = StoredRule::encode(&draft)?;
        let data = rmp_serde::to_vec_named(&stored).context("Failed to serialize rule")?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let next = meta.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
            meta.insert(NEXT_ID_KEY, next + 1)?;

            let mut rules = write_txn.open_table(RULES_TABLE)?;
            rules.insert(next, data.as_slice())?;
            RuleId(next)
        };
        write_txn.commit()?;

        self.cache_insert(id, &draft);

        info!(rule_id = %id, attribute = %draft.attribute_name, "Authorization rule stored");
        Ok(id)
    }

    /// Replace an existing rule's contents, keeping its id.
    pub fn update(&self, id: RuleId, draft: RuleDraft) -> Result<()> {
        draft.validate()?;
        let stored = StoredRule::encode(&draft)?;
        let data = rmp_serde::to_vec_named(&stored).context("Failed to serialize rule")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut rules = write_txn.open_table(RULES_TABLE)?;
            if rules.get(id.0)?.is_none() {
                return Err(FederationError::RuleNotFound(id).into());
            }
            rules.insert(id.0, data.as_slice())?;
        }
        write_txn.commit()?;

        self.cache_insert(id, &draft);

        info!(rule_id = %id, "Authorization rule modified");
        Ok(())
    }

    /// Delete a rule. Deleting a missing id is a no-op and returns false.
    pub fn delete(&self, id: RuleId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut rules = write_txn.open_table(RULES_TABLE)?;
            let result = rules.remove(id.0)?;
            result.is_some()
        };
        write_txn.commit()?;

        if removed {
            info!(rule_id = %id, "Authorization rule deleted");
        }
        Ok(removed)
    }

    /// Duplicate a rule under a fresh id.
    pub fn clone_rule(&self, id: RuleId) -> Result<RuleId> {
        let rule = self
            .get(id)?
            .ok_or(FederationError::RuleNotFound(id))?;

        let new_id = self.create(RuleDraft {
            attribute_name: rule.attribute_name,
            pattern: rule.pattern,
            grants: rule.grants,
        })?;

        debug!(source = %id, rule_id = %new_id, "Authorization rule cloned");
        Ok(new_id)
    }

    /// Number of stored rules.
    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    fn cache_insert(&self, id: RuleId, draft: &RuleDraft) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                id,
                AuthorizationRule {
                    id,
                    attribute_name: draft.attribute_name.clone(),
                    pattern: draft.pattern.clone(),
                    grants: draft.grants.clone(),
                },
            );
        }
    }

    /// Load and decode every rule.
    fn load_all(db: &Database) -> Result<BTreeMap<RuleId, AuthorizationRule>> {
        let mut rules = BTreeMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RULES_TABLE)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            let id = RuleId(key.value());
            let decoded = rmp_serde::from_slice::<StoredRule>(value.value())
                .context("Failed to deserialize rule")
                .and_then(|stored| stored.decode(id));
            match decoded {
                Ok(rule) => {
                    rules.insert(id, rule);
                }
                Err(e) => {
                    warn!(rule_id = %id, error = %e, "Failed to decode rule during load, skipping");
                }
            }
        }

        Ok(rules)
    }
}
