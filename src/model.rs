//! Entities, hierarchy levels and code normalization.
//!
//! The engine is level-agnostic: everything table- or column-specific about a parent/child
//! tier lives in the static [`LevelSpec`] returned by [`Level::spec`].

use crate::error::LedgerError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three stored entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Unit,
    Container,
    Batch,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Unit => "units",
            EntityKind::Container => "containers",
            EntityKind::Batch => "batches",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Unit => "unit",
            EntityKind::Container => "container",
            EntityKind::Batch => "batch",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parent/child tier of the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Units linked into containers
    UnitToContainer,
    /// Containers linked into batches
    ContainerToBatch,
}

/// Storage layout of one level
#[derive(Debug)]
pub struct LevelSpec {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub link_table: &'static str,
    pub link_parent_column: &'static str,
    pub link_child_column: &'static str,
    /// Column on the child table naming its current parent
    pub child_owner_column: &'static str,
    /// Denormalized link count on the parent table
    pub counter_column: &'static str,
    /// Denormalized weight sum on the parent table
    pub weight_column: &'static str,
}

static UNIT_TO_CONTAINER: LevelSpec = LevelSpec {
    parent: EntityKind::Container,
    child: EntityKind::Unit,
    link_table: "container_units",
    link_parent_column: "container_id",
    link_child_column: "unit_id",
    child_owner_column: "container_id",
    counter_column: "unit_count",
    weight_column: "weight",
};

static CONTAINER_TO_BATCH: LevelSpec = LevelSpec {
    parent: EntityKind::Batch,
    child: EntityKind::Container,
    link_table: "batch_containers",
    link_parent_column: "batch_id",
    link_child_column: "container_id",
    child_owner_column: "batch_id",
    counter_column: "linked_count",
    weight_column: "total_weight",
};

impl Level {
    pub fn all() -> [Level; 2] {
        [Level::UnitToContainer, Level::ContainerToBatch]
    }

    pub fn spec(self) -> &'static LevelSpec {
        match self {
            Level::UnitToContainer => &UNIT_TO_CONTAINER,
            Level::ContainerToBatch => &CONTAINER_TO_BATCH,
        }
    }

    pub fn parent_kind(self) -> EntityKind {
        self.spec().parent
    }

    pub fn child_kind(self) -> EntityKind {
        self.spec().child
    }

    /// The level at which `kind` is the parent
    pub fn for_parent(kind: EntityKind) -> Option<Level> {
        Level::all().into_iter().find(|level| level.parent_kind() == kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::UnitToContainer => "unit_to_container",
            Level::ContainerToBatch => "container_to_batch",
        }
    }

    /// Status a parent at this level has with `count` links against `capacity`.
    pub fn status_for(self, count: i64, capacity: i64) -> ParentStatus {
        match self {
            Level::UnitToContainer if count >= capacity => ParentStatus::Completed,
            Level::UnitToContainer => ParentStatus::Pending,
            Level::ContainerToBatch if count == 0 => ParentStatus::New,
            Level::ContainerToBatch if count >= capacity => ParentStatus::Completed,
            Level::ContainerToBatch => ParentStatus::Processing,
        }
    }

    /// Status of a parent that has just been created
    pub fn initial_status(self) -> ParentStatus {
        match self {
            Level::UnitToContainer => ParentStatus::Pending,
            Level::ContainerToBatch => ParentStatus::New,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived parent status; containers use `Pending`/`Completed`, batches
/// `New`/`Processing`/`Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentStatus {
    Pending,
    Completed,
    New,
    Processing,
}

impl ParentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParentStatus::Pending => "pending",
            ParentStatus::Completed => "completed",
            ParentStatus::New => "new",
            ParentStatus::Processing => "processing",
        }
    }
}

impl FromStr for ParentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParentStatus::Pending),
            "completed" => Ok(ParentStatus::Completed),
            "new" => Ok(ParentStatus::New),
            "processing" => Ok(ParentStatus::Processing),
            other => Err(LedgerError::Other(format!("unknown parent status '{other}'"))),
        }
    }
}

impl fmt::Display for ParentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes external codes: trim, upper-case, then match the configured pattern.
#[derive(Debug, Clone)]
pub struct CodeValidator {
    pattern: Regex,
}

impl CodeValidator {
    pub fn new(pattern: &str) -> Result<Self, LedgerError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| LedgerError::Config(format!("invalid code_pattern: {e}")))?;
        Ok(Self { pattern })
    }

    pub fn normalize(&self, raw: &str) -> Result<String, LedgerError> {
        let code = raw.trim().to_uppercase();
        if code.is_empty() {
            return Err(LedgerError::InvalidCode("code is empty".to_string()));
        }
        if !self.pattern.is_match(&code) {
            return Err(LedgerError::InvalidCode(format!(
                "'{code}' does not match {}",
                self.pattern.as_str()
            )));
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_level_layout() {
        let spec = Level::UnitToContainer.spec();
        assert_eq!(spec.parent.table(), "containers");
        assert_eq!(spec.child.table(), "units");
        assert_eq!(spec.link_table, "container_units");

        let spec = Level::ContainerToBatch.spec();
        assert_eq!(spec.parent, EntityKind::Batch);
        assert_eq!(spec.counter_column, "linked_count");
        assert_eq!(Level::for_parent(EntityKind::Container), Some(Level::UnitToContainer));
        assert_eq!(Level::for_parent(EntityKind::Unit), None);
    }

    #[test]
    fn test_status_for() {
        assert_eq!(Level::UnitToContainer.status_for(29, 30), ParentStatus::Pending);
        assert_eq!(Level::UnitToContainer.status_for(30, 30), ParentStatus::Completed);
        assert_eq!(Level::ContainerToBatch.status_for(0, 50), ParentStatus::New);
        assert_eq!(Level::ContainerToBatch.status_for(1, 50), ParentStatus::Processing);
        assert_eq!(Level::ContainerToBatch.status_for(50, 50), ParentStatus::Completed);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            ParentStatus::Pending,
            ParentStatus::Completed,
            ParentStatus::New,
            ParentStatus::Processing,
        ] {
            assert_eq!(status.as_str().parse::<ParentStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ParentStatus>().is_err());
    }

    #[test]
    fn test_normalize_codes() {
        let codes = CodeValidator::new(&EngineConfig::default().code_pattern).unwrap();
        assert_eq!(codes.normalize("  ab-123 ").unwrap(), "AB-123");
        assert!(matches!(codes.normalize("   "), Err(LedgerError::InvalidCode(_))));
        assert!(matches!(codes.normalize("a$"), Err(LedgerError::InvalidCode(_))));
        assert!(matches!(codes.normalize("X1"), Err(LedgerError::InvalidCode(_))));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        assert!(matches!(CodeValidator::new("("), Err(LedgerError::Config(_))));
    }
}
