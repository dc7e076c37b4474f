use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::config::DbConfig;
use crate::store::dial;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Manages PostgreSQL schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
/// Embeds SQL files from `src/migrate/sql/` and applies them in order.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// PostgreSQL migration runner over its own connection.
pub struct PgMigrator {
    client: Client,
}

impl PgMigrator {
    /// Connects a dedicated migration session.
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&cfg.host)
            .port(cfg.port)
            .dbname(&cfg.dbname)
            .user(&cfg.user)
            .connect_timeout(cfg.connect_timeout);
        if !cfg.password.is_empty() {
            pg.password(&cfg.password);
        }

        let client = dial(&pg).await?;
        Ok(Self { client })
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version bigint NOT NULL,
                    dirty boolean NOT NULL
                )",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(u32, bool)> {
        let rows = self
            .client
            .query("SELECT version, dirty FROM schema_migrations LIMIT 1", &[])
            .await
            .context("querying migration version")?;

        match rows.first() {
            Some(row) => {
                let version: i64 = row.get(0);
                let dirty: bool = row.get(1);
                Ok((version as u32, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Sets the migration version in the tracking table.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        // Truncate and re-insert (matches golang-migrate behavior).
        self.client
            .batch_execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        self.client
            .execute(
                "INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)",
                &[&i64::from(version), &dirty],
            )
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    /// Executes one migration file.
    ///
    /// The file runs as a single batch so plpgsql function bodies, which
    /// contain semicolons, stay intact.
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .context("executing migration SQL")?;

        Ok(())
    }
}

impl Migrator for PgMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            // Mark as dirty before applying.
            self.set_version(migration.version, true).await?;

            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            // Mark as clean.
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;

        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        // Set version to previous migration.
        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        if prev_version == 0 {
            self.client
                .batch_execute("TRUNCATE TABLE schema_migrations")
                .await
                .context("truncating schema_migrations after rollback")?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}
