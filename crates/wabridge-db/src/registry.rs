use wabridge_common::{Error, Result};

use crate::builtin;
use crate::database::SchemaTx;
use crate::operations::EmbeddedOp;

/// A single versioned schema change with a body for each dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub id: i32,
    pub name: &'static str,
    /// Script for PostgreSQL. Every statement guards itself against
    /// effects that are already present.
    pub network: &'static str,
    /// Steps for SQLite, applied in order.
    pub embedded: Vec<EmbeddedOp>,
}

impl MigrationDefinition {
    /// Run the body matching the transaction's dialect.
    pub fn apply(&self, tx: &mut SchemaTx<'_>) -> Result<()> {
        match tx {
            SchemaTx::Network(tx) => tx
                .batch_execute(self.network)
                .map_err(|e| Error::MigrationExecution(format!("{e}"))),
            SchemaTx::Embedded(tx) => {
                for op in &self.embedded {
                    op.apply(tx)?;
                }
                Ok(())
            }
        }
    }
}

/// Ordered, immutable set of migrations.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<MigrationDefinition>,
}

impl Registry {
    /// Sort `entries` by id and reject non-positive or duplicate ids.
    pub fn new(mut entries: Vec<MigrationDefinition>) -> Result<Self> {
        entries.sort_by_key(|m| m.id);

        if let Some(bad) = entries.iter().find(|m| m.id <= 0) {
            return Err(Error::Config(format!(
                "migration {} ({}) must have a positive id",
                bad.id, bad.name
            )));
        }
        if let Some(pair) = entries.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(Error::Config(format!(
                "duplicate migration id {}: {} and {}",
                pair[0].id, pair[0].name, pair[1].name
            )));
        }

        Ok(Self { entries })
    }

    /// The migrations that ship with this crate.
    pub fn builtin() -> Self {
        // Ids in the builtin list are literals and covered by tests.
        Self {
            entries: builtin::migrations(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&MigrationDefinition> {
        self.entries
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn ids(&self) -> Vec<i32> {
        self.entries.iter().map(|m| m.id).collect()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.get(id).is_some()
    }
}
