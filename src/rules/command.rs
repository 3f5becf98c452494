//! Administrative rule commands.

use anyhow::Result;
use serde::Serialize;

use super::store::RuleStore;
use super::types::{RuleDraft, RuleId};

/// An administrative action on the rule store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCommand {
    Create(RuleDraft),
    Update { id: RuleId, draft: RuleDraft },
    Delete(RuleId),
    Clone(RuleId),
}

/// Result of an applied rule command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RuleCommandOutcome {
    Created { id: RuleId },
    Updated { id: RuleId },
    Deleted { id: RuleId, existed: bool },
    Cloned { source: RuleId, id: RuleId },
}

impl RuleCommandOutcome {
    /// Feedback line for the administrator.
    pub fn message(&self) -> String {
        match self {
            RuleCommandOutcome::Created { .. } => "New rule has been stored.".to_string(),
            RuleCommandOutcome::Updated { .. } => "The rule has been modified.".to_string(),
            RuleCommandOutcome::Deleted { id, .. } => format!("Rule #{} has been deleted.", id),
            RuleCommandOutcome::Cloned { .. } => "The rule has been successfully cloned.".to_string(),
        }
    }
}

impl RuleStore {
    /// Apply an administrative command.
    pub fn apply(&self, command: RuleCommand) -> Result<RuleCommandOutcome> {
        match command {
            RuleCommand::Create(draft) => {
                let id = self.create(draft)?;
                Ok(RuleCommandOutcome::Created { id })
            }
            RuleCommand::Update { id, draft } => {
                self.update(id, draft)?;
                Ok(RuleCommandOutcome::Updated { id })
            }
            RuleCommand::Delete(id) => {
                let existed = self.delete(id)?;
                Ok(RuleCommandOutcome::Deleted { id, existed })
            }
            RuleCommand::Clone(source) => {
                let id = self.clone_rule(source)?;
                Ok(RuleCommandOutcome::Cloned { source, id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FederationError;
    use crate::rules::types::GrantSet;
    use tempfile::tempdir;

    #[test]
    fn test_command_lifecycle() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path().join("rules.redb")).unwrap();

        let created = store
            .apply(RuleCommand::Create(RuleDraft::new(
                "affiliation",
                "^staff$",
                GrantSet::from_pairs([(2, "editor")]),
            )))
            .unwrap();
        let id = match created {
            RuleCommandOutcome::Created { id } => id,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(created.message(), "New rule has been stored.");

        let cloned = store.apply(RuleCommand::Clone(id)).unwrap();
        assert!(matches!(cloned, RuleCommandOutcome::Cloned { source, .. } if source == id));

        let updated = store
            .apply(RuleCommand::Update {
                id,
                draft: RuleDraft::new("affiliation", "^member$", GrantSet::new()),
            })
            .unwrap();
        assert_eq!(updated.message(), "The rule has been modified.");

        let deleted = store.apply(RuleCommand::Delete(id)).unwrap();
        assert_eq!(deleted, RuleCommandOutcome::Deleted { id, existed: true });
        assert_eq!(deleted.message(), format!("Rule #{} has been deleted.", id));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_clone_missing_surfaces_not_found() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path().join("rules.redb")).unwrap();

        let err = store.apply(RuleCommand::Clone(RuleId(3))).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FederationError>(),
            Some(&FederationError::RuleNotFound(RuleId(3)))
        );
    }
}
