//! Versioned schema migrations for persistent stores.
//!
//! Migrations are tracked in a bookkeeping table so each one runs exactly once.
//! The `leasework` binary exposes them on the command line:
//!
//! ```bash
//! leasework migrate --database-url postgresql://localhost/leasework
//! leasework status --database-url postgresql://localhost/leasework
//! ```
//!
//! Applications can run them at startup instead:
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # async fn run() -> leasework::Result<()> {
//! use leasework::migrations::{MigrationManager, postgres::PostgresMigrationRunner};
//!
//! let pool = sqlx::PgPool::connect("postgresql://localhost/leasework").await?;
//! let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(pool)));
//! manager.run_migrations().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::{LeaseworkError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Migration identifier and metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Unique migration identifier (e.g., "001_initial_schema")
    pub id: String,
    pub description: String,
    /// Ordering key; migrations run in ascending version order.
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

/// Migration execution record
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Backend-specific migration execution.
#[async_trait::async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Apply one migration's SQL atomically.
    async fn run_migration(&self, migration: &Migration, sql: &str) -> Result<()>;

    async fn migration_table_exists(&self) -> Result<bool>;

    async fn create_migration_table(&self) -> Result<()>;

    async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>>;

    async fn record_migration(&self, migration: &Migration, execution_time_ms: u64) -> Result<()>;
}

pub struct MigrationManager {
    runner: Box<dyn MigrationRunner>,
    migrations: BTreeMap<u32, (Migration, String)>,
}

impl MigrationManager {
    /// Create a manager with every built-in migration registered.
    pub fn new(runner: Box<dyn MigrationRunner>) -> Self {
        let mut manager = Self {
            runner,
            migrations: BTreeMap::new(),
        };

        manager.register_builtin_migrations();
        manager
    }

    /// Register a migration. A second registration with the same version replaces
    /// the first.
    pub fn register_migration(&mut self, migration: Migration, sql: String) {
        self.migrations.insert(migration.version, (migration, sql));
    }

    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values().map(|(migration, _)| migration)
    }

    /// Run all pending migrations in version order.
    ///
    /// Returns the ids of the migrations that were applied.
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        info!("Starting migration process...");

        if !self.runner.migration_table_exists().await? {
            info!("Creating migration tracking table...");
            self.runner.create_migration_table().await?;
        }

        let executed_ids = self.executed_ids().await?;

        let pending: Vec<_> = self
            .migrations
            .values()
            .filter(|(migration, _)| !executed_ids.contains(&migration.id))
            .collect();

        if pending.is_empty() {
            info!("No pending migrations to run");
            return Ok(Vec::new());
        }

        info!("Found {} pending migrations", pending.len());

        let mut applied = Vec::with_capacity(pending.len());
        for (migration, sql) in pending {
            info!(
                "Running migration: {} - {}",
                migration.id, migration.description
            );

            let start_time = std::time::Instant::now();
            self.runner.run_migration(migration, sql).await?;
            let execution_time_ms = start_time.elapsed().as_millis() as u64;

            self.runner
                .record_migration(migration, execution_time_ms)
                .await?;

            info!(
                "Completed migration {} in {}ms",
                migration.id, execution_time_ms
            );
            applied.push(migration.id.clone());
        }

        info!("All migrations completed successfully");
        Ok(applied)
    }

    /// Every registered migration with whether it has been applied.
    pub async fn get_migration_status(&self) -> Result<Vec<(Migration, bool)>> {
        let executed_ids = if self.runner.migration_table_exists().await? {
            self.executed_ids().await?
        } else {
            HashSet::new()
        };

        Ok(self
            .migrations
            .values()
            .map(|(migration, _)| (migration.clone(), executed_ids.contains(&migration.id)))
            .collect())
    }

    async fn executed_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .runner
            .get_executed_migrations()
            .await?
            .into_iter()
            .map(|record| record.migration_id)
            .collect())
    }

    fn register_builtin_migrations(&mut self) {
        self.register_migration(
            Migration {
                id: "001_initial_schema".to_string(),
                description: "Create leasework_jobs table, dedup index and group id sequence"
                    .to_string(),
                version: 1,
                created_at: builtin_date(2025, 1, 1),
            },
            include_str!("001_initial_schema.postgres.sql").to_string(),
        );

        self.register_migration(
            Migration {
                id: "002_lease_timeout".to_string(),
                description: "Add heartbeat_timeout_sec to leasework_jobs".to_string(),
                version: 2,
                created_at: builtin_date(2025, 3, 1),
            },
            include_str!("002_lease_timeout.postgres.sql").to_string(),
        );
    }
}

fn builtin_date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Fail unless every registered migration has been applied.
pub async fn ensure_schema_current(manager: &MigrationManager) -> Result<()> {
    let pending: Vec<String> = manager
        .get_migration_status()
        .await?
        .into_iter()
        .filter(|(_, applied)| !applied)
        .map(|(migration, _)| migration.id)
        .collect();

    if pending.is_empty() {
        Ok(())
    } else {
        Err(LeaseworkError::Config(format!(
            "database schema is out of date, pending migrations: {}",
            pending.join(", ")
        )))
    }
}
