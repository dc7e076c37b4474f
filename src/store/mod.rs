pub mod compact;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::aggregate::EntityMetrics;
use crate::config::DbConfig;

const INSERT_ROW: &str =
    "INSERT INTO tsd (entity_id, key_id, added, value) VALUES (ent_id($1), key_id($2), $3, $4)";

/// Time-series persistence gateway over a single managed PostgreSQL
/// connection.
///
/// The connection is never pooled; a lost connection is replaced by
/// re-dialing. Entity and key names are resolved to ids inside the database
/// by the `ent_id()` / `key_id()` lookup-or-create functions, which are
/// idempotent and safe to call repeatedly within a transaction.
pub struct Store {
    pg: tokio_postgres::Config,
    client: Client,
}

impl Store {
    /// Connects to the database described by the configuration.
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
        info!(host = %cfg.host, port = cfg.port, dbname = %cfg.dbname, "connected to postgres");

        Ok(Self { pg, client })
    }

    /// Replaces the managed connection after a loss.
    async fn reconnect(&mut self) -> Result<()> {
        warn!("reconnecting to postgres");
        self.client = dial(&self.pg).await?;
        Ok(())
    }

    /// Inserts one flush cycle's aggregated metrics in a single transaction.
    ///
    /// An empty mapping succeeds without issuing any statement. With
    /// `minute_mark` the write timestamp is truncated to `:00` seconds,
    /// otherwise to whole seconds. On connection loss the batch is retried
    /// exactly once on a fresh connection; any other failure rolls the
    /// transaction back and drops the batch.
    pub async fn insert_metrics(
        &mut self,
        metrics: &HashMap<String, EntityMetrics>,
        at: DateTime<Utc>,
        minute_mark: bool,
    ) -> Result<()> {
        let batch = flatten_batch(metrics);
        if batch.is_empty() {
            debug!("no metrics to insert");
            return Ok(());
        }

        let added = write_timestamp(at, minute_mark);

        match self.try_insert(&batch, added).await {
            Ok(rows) => {
                debug!(rows, %added, "inserted metric rows");
                Ok(())
            }
            Err(e) if is_connection_error(&e) => {
                warn!(error = %e, "connection lost during insert, reconnecting");
                self.reconnect()
                    .await
                    .context("reconnecting after lost connection")?;

                let rows = self
                    .try_insert(&batch, added)
                    .await
                    .context("retrying metric insert after reconnect")?;
                debug!(rows, %added, "inserted metric rows after reconnect");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "metric insert failed, batch dropped");
                Err(e).context("inserting metrics")
            }
        }
    }

    async fn try_insert(
        &mut self,
        batch: &[(&str, &str, f64)],
        added: NaiveDateTime,
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        let tx = self.client.transaction().await?;
        let stmt = tx.prepare(INSERT_ROW).await?;

        for (entity, key, value) in batch {
            tx.execute(&stmt, &[entity, key, &added, value]).await?;
        }

        tx.commit().await?;
        Ok(batch.len() as u64)
    }

    /// Lists the distinct (entity_id, key_id) pairs with rows in the
    /// open interval `end < added < start`.
    pub async fn list_series(
        &mut self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<(i32, i32)>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT entity_id, key_id FROM tsd \
                 WHERE added < $1 AND added > $2",
                &[&start, &end],
            )
            .await
            .context("listing series for compaction")?;

        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    /// Runs a maintenance vacuum on one table.
    ///
    /// Transient connection loss triggers a reconnect so later operations
    /// can proceed; the vacuum itself is never retried automatically.
    pub async fn vacuum(&mut self, table: &str, full: bool, dry_run: bool) -> Result<()> {
        if !is_safe_identifier(table) {
            bail!("refusing to vacuum invalid table name {table:?}");
        }

        let sql = if full {
            format!("VACUUM FULL {table}")
        } else {
            format!("VACUUM {table}")
        };

        if dry_run {
            info!(%sql, "dry run, skipping vacuum");
            return Ok(());
        }

        info!(%sql, "running vacuum");
        if let Err(e) = self.client.batch_execute(&sql).await {
            if is_connection_error(&e) {
                if let Err(re) = self.reconnect().await {
                    warn!(error = %re, "reconnect after failed vacuum also failed");
                }
            }
            error!(error = %e, table, "vacuum failed");
            return Err(e).context("running vacuum");
        }

        Ok(())
    }
}

/// Flattens one flush cycle's metrics into insert parameters, one row per
/// (entity, metric key) pair. An empty result means no statement is issued.
fn flatten_batch(metrics: &HashMap<String, EntityMetrics>) -> Vec<(&str, &str, f64)> {
    let mut rows = Vec::new();
    for (entity, keys) in metrics {
        for (key, value) in keys {
            rows.push((entity.as_str(), key.as_str(), *value));
        }
    }
    rows
}

/// Dials a new connection and spawns its I/O driver.
pub(crate) async fn dial(pg: &tokio_postgres::Config) -> Result<Client> {
    let (client, connection) = pg
        .connect(NoTls)
        .await
        .context("connecting to postgres")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "postgres connection closed");
        }
    });

    Ok(client)
}

/// Classifies errors that warrant replacing the managed connection:
/// the socket is gone, a class 08 connection exception, or the server
/// shutting the session down.
fn is_connection_error(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }

    match e.code() {
        Some(code) => {
            code.code().starts_with("08")
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CRASH_SHUTDOWN
        }
        None => false,
    }
}

/// Computes the row timestamp for an insert batch.
fn write_timestamp(at: DateTime<Utc>, minute_mark: bool) -> NaiveDateTime {
    let secs = if minute_mark {
        at.timestamp().div_euclid(60) * 60
    } else {
        at.timestamp()
    };

    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.naive_utc())
        .unwrap_or_else(|| at.naive_utc())
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
