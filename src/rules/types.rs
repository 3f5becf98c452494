//! Authorization rule types and their at-rest encoding.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::FederationError;

/// Current version of the grant envelope written to the rule store.
pub const GRANT_ENCODING_VERSION: u8 = 1;

/// Rule identifier, auto-assigned by the store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role identifier in the host's role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u32);

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered set of granted roles, keyed by id and carrying the role name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantSet(BTreeMap<RoleId, String>);

/// Versioned envelope for grant sets at rest.
#[derive(Serialize, Deserialize)]
struct GrantEnvelope {
    v: u8,
    roles: BTreeMap<RoleId, String>,
}

/// Version header, read before the full envelope.
#[derive(Deserialize)]
struct EnvelopeVersion {
    v: u8,
}

impl GrantSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(id, name)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(id, name)| (RoleId(id), name.into()))
                .collect(),
        )
    }

    /// Parse an `id:name` pair as given on the command line.
    pub fn parse_pair(pair: &str) -> Result<(RoleId, String)> {
        let (id, name) = pair
            .split_once(':')
            .ok_or_else(|| anyhow!("Expected ID:NAME, got '{}'", pair))?;
        let id: u32 = id
            .trim()
            .parse()
            .with_context(|| format!("Invalid role id in '{}'", pair))?;
        Ok((RoleId(id), name.trim().to_string()))
    }

    pub fn insert(&mut self, id: RoleId, name: impl Into<String>) {
        self.0.insert(id, name.into());
    }

    pub fn contains(&self, id: RoleId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleId, &String)> {
        self.0.iter()
    }

    pub fn role_ids(&self) -> Vec<RoleId> {
        self.0.keys().copied().collect()
    }

    /// Union another set into this one. Existing names are overwritten by
    /// the incoming ones; nothing is ever removed.
    pub fn merge(&mut self, other: &GrantSet) {
        for (id, name) in other.iter() {
            self.0.insert(*id, name.clone());
        }
    }

    /// Drop falsy entries: role id 0 or a blank name.
    pub fn retain_valid(&mut self) {
        self.0.retain(|id, name| id.0 != 0 && !name.trim().is_empty());
    }

    /// Role names joined for listings.
    pub fn display_names(&self) -> String {
        self.0.values().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Encode for storage: versioned JSON envelope, URL-encoded.
    pub fn encode(&self) -> Result<String> {
        let envelope = GrantEnvelope {
            v: GRANT_ENCODING_VERSION,
            roles: self.0.clone(),
        };
        let json = serde_json::to_string(&envelope).context("Failed to serialize grant set")?;
        Ok(urlencoding::encode(&json).into_owned())
    }

    /// Decode a stored grant set.
    pub fn decode(stored: &str) -> Result<Self> {
        let json = urlencoding::decode(stored).context("Grant set is not valid URL encoding")?;

        let version: EnvelopeVersion =
            serde_json::from_str(&json).context("Failed to read grant set version")?;
        if version.v != GRANT_ENCODING_VERSION {
            return Err(FederationError::UnsupportedEncoding(version.v).into());
        }

        let envelope: GrantEnvelope =
            serde_json::from_str(&json).context("Failed to deserialize grant set")?;
        Ok(Self(envelope.roles))
    }
}

/// A persisted authorization rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRule {
    pub id: RuleId,
    /// Server variable the pattern is tested against.
    pub attribute_name: String,
    /// Regular expression, matched unanchored against each `;`-separated value.
    pub pattern: String,
    /// Roles granted on a match.
    pub grants: GrantSet,
}

impl AuthorizationRule {
    /// Whether any `;`-separated, trimmed segment of `value` matches.
    pub fn matches_value(regex: &Regex, value: &str) -> bool {
        value.split(';').any(|segment| regex.is_match(segment.trim()))
    }

    /// Listing row for admin display.
    pub fn listing(&self) -> RuleListing {
        RuleListing {
            id: self.id,
            attribute: self.attribute_name.clone(),
            pattern: self.pattern.clone(),
            roles: self.grants.display_names(),
        }
    }
}

/// Rule contents as submitted by an administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub attribute_name: String,
    pub pattern: String,
    #[serde(default)]
    pub grants: GrantSet,
}

impl RuleDraft {
    pub fn new(attribute_name: impl Into<String>, pattern: impl Into<String>, grants: GrantSet) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            pattern: pattern.into(),
            grants,
        }
    }

    /// Attribute and pattern must be non-empty and the pattern must compile.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.attribute_name.trim().is_empty() {
            return Err(FederationError::InvalidRule(
                "attribute name must not be empty".to_string(),
            ));
        }
        if self.pattern.is_empty() {
            return Err(FederationError::InvalidRule(
                "pattern must not be empty".to_string(),
            ));
        }
        Regex::new(&self.pattern)
            .map_err(|e| FederationError::InvalidRule(format!("pattern does not compile: {}", e)))?;
        Ok(())
    }
}

/// One row of the rule listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleListing {
    pub id: RuleId,
    pub attribute: String,
    pub pattern: String,
    pub roles: String,
}

/// Rule record as stored in redb: text fields URL-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRule {
    pub field: String,
    pub regexpression: String,
    pub role: String,
}

impl StoredRule {
    pub(crate) fn encode(draft: &RuleDraft) -> Result<Self> {
        Ok(Self {
            field: urlencoding::encode(&draft.attribute_name).into_owned(),
            regexpression: urlencoding::encode(&draft.pattern).into_owned(),
            role: draft.grants.encode()?,
        })
    }

    pub(crate) fn decode(&self, id: RuleId) -> Result<AuthorizationRule> {
        Ok(AuthorizationRule {
            id,
            attribute_name: urlencoding::decode(&self.field)
                .context("Rule attribute is not valid URL encoding")?
                .into_owned(),
            pattern: urlencoding::decode(&self.regexpression)
                .context("Rule pattern is not valid URL encoding")?
                .into_owned(),
            grants: GrantSet::decode(&self.role)?,
        })
    }
}
