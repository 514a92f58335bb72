//! Destination table metadata
//!
//! A [`TargetDescriptor`] describes one MALTOPUFT table the loader writes
//! to: which batch columns belong to it, which surrogate column identifies
//! its rows in memory, which foreign keys must be reconciled before insert,
//! and how duplicates are recognised.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::database::{ConstraintKind, ConstraintViolation};

pub mod catalogue;
pub mod plan;

pub use plan::{LoadPlan, Stage};

/// Default name of the database identifier column
pub const DEFAULT_ID_COLUMN: &str = "id";

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

/// A business-key uniqueness constraint on a target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint name as declared in the schema
    pub name: String,
    /// Constrained columns
    #[serde(default)]
    pub columns: Vec<String>,
}

impl UniqueConstraint {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Whether a reported violation refers to this constraint
    ///
    /// PostgreSQL reports the constraint name, SQLite the column list.
    pub fn matches(&self, violation: &ConstraintViolation) -> bool {
        if violation.constraint.as_deref() == Some(self.name.as_str()) {
            return true;
        }
        if violation.columns.is_empty() {
            return false;
        }
        let declared: BTreeSet<&str> = self.columns.iter().map(String::as_str).collect();
        let reported: BTreeSet<&str> = violation.columns.iter().map(String::as_str).collect();
        declared == reported
    }
}

/// Immutable description of one destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Physical table name
    pub table_name: String,

    /// Batch column holding the in-memory surrogate key
    pub local_key: String,

    /// Batch columns referencing other targets' local keys
    #[serde(default)]
    pub foreign_keys: Vec<String>,

    /// Prefix marking batch columns owned by this table (e.g. `"obs."`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_prefix: Option<String>,

    /// Database identifier column
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Attributes ignored when looking up an existing duplicate row
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub match_exclusions: BTreeSet<String>,

    /// Business-key constraint; `None` means only primary-key collisions
    /// count as duplicates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_constraint: Option<UniqueConstraint>,
}

impl TargetDescriptor {
    /// Create a descriptor with an explicit local key column
    pub fn new(table_name: impl Into<String>, local_key: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            local_key: local_key.into(),
            foreign_keys: Vec::new(),
            column_prefix: None,
            id_column: default_id_column(),
            match_exclusions: BTreeSet::new(),
            unique_constraint: None,
        }
    }

    /// Create a descriptor whose local key is `{table}_id`
    pub fn for_table(table_name: impl Into<String>) -> Self {
        let table_name = table_name.into();
        let local_key = format!("{}_id", table_name);
        Self::new(table_name, local_key)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.column_prefix = Some(prefix.into());
        self
    }

    pub fn with_foreign_keys(mut self, foreign_keys: &[&str]) -> Self {
        self.foreign_keys = foreign_keys.iter().map(|fk| fk.to_string()).collect();
        self
    }

    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraint = Some(constraint);
        self
    }

    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    /// Exclude a derived attribute from duplicate lookups
    pub fn excluding_from_match(mut self, attribute: impl Into<String>) -> Self {
        self.match_exclusions.insert(attribute.into());
        self
    }

    /// Table column a batch column maps to, if this table owns it
    ///
    /// Foreign keys keep their name; prefixed attributes lose the prefix.
    /// The local key is never a table column.
    pub fn table_column_for(&self, batch_column: &str) -> Option<String> {
        if batch_column == self.local_key {
            return None;
        }
        if self.foreign_keys.iter().any(|fk| fk == batch_column) {
            return Some(batch_column.to_string());
        }
        match &self.column_prefix {
            Some(prefix) if !prefix.is_empty() => batch_column
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty())
                .map(str::to_string),
            _ => None,
        }
    }

    /// Whether an attribute participates in duplicate lookups
    pub fn is_match_attribute(&self, column: &str) -> bool {
        !self.match_exclusions.contains(column)
    }

    /// Whether a unique violation means "this row already exists"
    ///
    /// Primary key collisions always do. Otherwise the violation must be
    /// the declared business-key constraint; a violation that names no
    /// constraint at all is given the benefit of the doubt.
    pub fn is_duplicate_violation(&self, violation: &ConstraintViolation) -> bool {
        match violation.kind {
            ConstraintKind::PrimaryKey => true,
            ConstraintKind::Unique => {
                let unidentified = violation.constraint.is_none() && violation.columns.is_empty();
                match &self.unique_constraint {
                    Some(constraint) => unidentified || constraint.matches(violation),
                    None => unidentified,
                }
            }
            ConstraintKind::ForeignKey | ConstraintKind::Other => false,
        }
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.table_name, self.local_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beam() -> TargetDescriptor {
        TargetDescriptor::for_table("beam")
            .with_prefix("beam.")
            .with_foreign_keys(&["observation_id", "host_id"])
            .with_unique_constraint(UniqueConstraint::new(
                "beam_observation_id_number_key",
                &["observation_id", "number"],
            ))
    }

    #[test]
    fn test_for_table_defaults() {
        let target = TargetDescriptor::for_table("host");
        assert_eq!(target.local_key, "host_id");
        assert_eq!(target.id_column, "id");
        assert!(target.foreign_keys.is_empty());
        assert!(target.unique_constraint.is_none());
    }

    #[test]
    fn test_table_column_for() {
        let target = beam();
        assert_eq!(target.table_column_for("beam.number").as_deref(), Some("number"));
        assert_eq!(target.table_column_for("host_id").as_deref(), Some("host_id"));
        assert_eq!(target.table_column_for("beam_id"), None);
        assert_eq!(target.table_column_for("obs.t_min"), None);
        assert_eq!(target.table_column_for("beam."), None);
    }

    #[test]
    fn test_duplicate_violation_by_constraint_name() {
        let target = beam();
        let named = ConstraintViolation::new(ConstraintKind::Unique, "dup")
            .with_constraint("beam_observation_id_number_key");
        assert!(target.is_duplicate_violation(&named));

        let other = ConstraintViolation::new(ConstraintKind::Unique, "dup")
            .with_constraint("beam_something_else_key");
        assert!(!target.is_duplicate_violation(&other));
    }

    #[test]
    fn test_duplicate_violation_by_columns() {
        let target = beam();
        let by_columns = ConstraintViolation::new(ConstraintKind::Unique, "dup")
            .with_columns(vec!["number".into(), "observation_id".into()]);
        assert!(target.is_duplicate_violation(&by_columns));

        let fk = ConstraintViolation::new(ConstraintKind::ForeignKey, "fk");
        assert!(!target.is_duplicate_violation(&fk));
    }

    #[test]
    fn test_duplicate_violation_without_declared_constraint() {
        let target = TargetDescriptor::for_table("host");
        let pk = ConstraintViolation::new(ConstraintKind::PrimaryKey, "pk");
        assert!(target.is_duplicate_violation(&pk));

        let identified = ConstraintViolation::new(ConstraintKind::Unique, "dup")
            .with_columns(vec!["hostname".into()]);
        assert!(!target.is_duplicate_violation(&identified));

        let anonymous = ConstraintViolation::new(ConstraintKind::Unique, "dup");
        assert!(target.is_duplicate_violation(&anonymous));
    }

    #[test]
    fn test_descriptor_from_toml() {
        let target: TargetDescriptor = toml::from_str(
            r#"
table_name = "observation"
local_key = "observation_id"
foreign_keys = ["schedule_block_id"]
column_prefix = "obs."
match_exclusions = ["t_max"]
"#,
        )
        .unwrap();
        assert_eq!(target.id_column, "id");
        assert!(!target.is_match_attribute("t_max"));
        assert!(target.is_match_attribute("t_min"));
    }
}
