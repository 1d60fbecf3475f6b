//! Migration runner.
//!
//! Brings a database up to the newest schema in a [`Registry`]. Each pending
//! migration runs in its own transaction together with its ledger row, so a
//! failure leaves neither half visible and earlier migrations stay committed.
//!
//! Only one process may migrate a given database at a time. Nothing here takes
//! a lock across processes; running two migrators concurrently against the
//! same database can make one of them fail on the ledger's primary key.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};
use wabridge_common::{Error, Result};
use wabridge_config::DatabaseConfig;

use crate::database::Database;
use crate::ledger::{self, LEDGER_TABLE};
use crate::registry::Registry;

/// What a call to [`Migrator::apply_all`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub ledger_created: bool,
    /// Ids applied by this run, ascending.
    pub applied: Vec<i32>,
    /// Ids already present in the ledger.
    pub skipped: Vec<i32>,
}

impl MigrationReport {
    /// True when the run changed nothing.
    pub fn is_noop(&self) -> bool {
        !self.ledger_created && self.applied.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: i32,
    pub name: &'static str,
    pub applied: bool,
    pub applied_at: Option<NaiveDateTime>,
}

pub struct Migrator {
    registry: Registry,
}

impl Migrator {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply every migration missing from the ledger, in ascending id order.
    ///
    /// Stops at the first failure and returns it wrapped in
    /// [`Error::Migration`]. Migrations committed before the failure stay
    /// applied; rerunning resumes from the failed one.
    pub fn apply_all(&self, db: &mut Database) -> Result<MigrationReport> {
        // Take the write lock only when the ledger has to be created.
        let ledger_created = if db.capabilities().table_exists(LEDGER_TABLE)? {
            false
        } else {
            db.transaction(|tx| ledger::ensure_ledger(tx))?
        };
        let mut report = MigrationReport {
            ledger_created,
            ..Default::default()
        };

        let applied = ledger::applied_ids(db)?;
        for id in applied.iter().filter(|id| !self.registry.contains(**id)) {
            warn!("migrations table has id {id} which is not in the registry");
        }

        for migration in self.registry.iter() {
            if applied.contains(&migration.id) {
                debug!("migration {} ({}) already applied", migration.id, migration.name);
                report.skipped.push(migration.id);
                continue;
            }

            info!(
                "applying migration {} ({}) on {}",
                migration.id,
                migration.name,
                db.dialect()
            );
            db.transaction(|tx| {
                migration.apply(tx)?;
                ledger::record_migration(tx, migration.id, migration.name)
            })
            .map_err(|source| Error::Migration {
                id: migration.id,
                name: migration.name.to_string(),
                source: Box::new(source),
            })?;
            report.applied.push(migration.id);
        }

        Ok(report)
    }

    /// Applied state of every registry entry. A database without a ledger
    /// reports everything as pending.
    pub fn status(&self, db: &mut Database) -> Result<Vec<MigrationStatus>> {
        let applied: BTreeMap<i32, Option<NaiveDateTime>> =
            if db.capabilities().table_exists(LEDGER_TABLE)? {
                ledger::entries(db)?
                    .into_iter()
                    .map(|entry| (entry.id, entry.applied_at))
                    .collect()
            } else {
                BTreeMap::new()
            };

        Ok(self
            .registry
            .iter()
            .map(|migration| MigrationStatus {
                id: migration.id,
                name: migration.name,
                applied: applied.contains_key(&migration.id),
                applied_at: applied.get(&migration.id).copied().flatten(),
            })
            .collect())
    }
}

/// Open the configured database and migrate it to the newest builtin schema.
///
/// Any error is fatal to startup.
pub fn initialize(config: &DatabaseConfig) -> Result<Database> {
    let mut db = Database::open(config)?;
    let report = Migrator::new(Registry::builtin()).apply_all(&mut db)?;
    info!(
        "{} schema ready: {} migrations applied, {} already present",
        db.dialect(),
        report.applied.len(),
        report.skipped.len()
    );
    Ok(db)
}
