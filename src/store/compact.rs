use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use super::{is_connection_error, Store};

/// One raw `tsd` row as read for compaction, ascending by `added`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: i64,
    pub added: NaiveDateTime,
    pub value: f64,
}

/// One compacted bucket: the timestamp of the last row it absorbed and the
/// mean of the absorbed values.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketPoint {
    pub added: NaiveDateTime,
    pub value: f64,
}

/// Result of compacting one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub rows_read: usize,
    pub rows_written: usize,
    pub committed: bool,
}

/// Collapses ordered raw rows into fixed-period buckets.
///
/// A bucket is anchored at the timestamp of its first row and absorbs every
/// row closer than `period_secs` to the anchor. The first row at or beyond
/// that distance closes the bucket and anchors the next one, so bucket
/// boundaries follow the data rather than a fixed grid and gaps longer than
/// a period never produce empty buckets. The trailing bucket is always
/// emitted.
pub fn compress_rows(rows: &[RawRow], period_secs: i64) -> Vec<BucketPoint> {
    let mut out = Vec::new();

    let Some(first) = rows.first() else {
        return out;
    };

    let mut anchor = first.added;
    let mut last_seen = first.added;
    let mut sum = 0.0;
    let mut count = 0u32;

    for row in rows {
        if (row.added - anchor).num_seconds() >= period_secs {
            out.push(BucketPoint {
                added: last_seen,
                value: sum / f64::from(count),
            });
            anchor = row.added;
            sum = 0.0;
            count = 0;
        }

        sum += row.value;
        count += 1;
        last_seen = row.added;
    }

    out.push(BucketPoint {
        added: last_seen,
        value: sum / f64::from(count),
    });

    out
}

/// Decides the rewrite for one series: the row ids to delete and the bucket
/// points that replace them, or `None` when the rewrite would be a no-op
/// (no rows, or bucketing does not reduce the row count).
fn compaction_plan(rows: &[RawRow], period_secs: i64) -> Option<(Vec<i64>, Vec<BucketPoint>)> {
    if rows.is_empty() {
        return None;
    }

    let buckets = compress_rows(rows, period_secs);
    if buckets.len() == rows.len() {
        return None;
    }

    Some((rows.iter().map(|r| r.id).collect(), buckets))
}

impl Store {
    /// Compacts one series: reads the raw rows with
    /// `end < added < start`, replaces them with their bucket points in a
    /// single transaction, and reports what happened.
    ///
    /// With `dry_run` the transaction is rolled back after doing all the
    /// work, so the outcome still reports the would-be row counts. A lost
    /// connection aborts the series (the transaction never half-applies)
    /// and is followed by a best-effort reconnect so the caller can move on
    /// to the next series.
    pub async fn run_compaction(
        &mut self,
        entity_id: i32,
        key_id: i32,
        start: NaiveDateTime,
        period_secs: i64,
        end: NaiveDateTime,
        dry_run: bool,
    ) -> Result<CompactionOutcome> {
        match self
            .try_compaction(entity_id, key_id, start, period_secs, end, dry_run)
            .await
        {
            Ok(outcome) => {
                info!(
                    entity_id,
                    key_id,
                    rows_read = outcome.rows_read,
                    rows_written = outcome.rows_written,
                    committed = outcome.committed,
                    "compacted series",
                );
                Ok(outcome)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    warn!(error = %e, "connection lost during compaction");
                    if let Err(re) = self.reconnect().await {
                        warn!(error = %re, "reconnect after failed compaction also failed");
                    }
                } else {
                    error!(entity_id, key_id, error = %e, "compaction failed");
                }
                Err(e).with_context(|| {
                    format!("compacting series entity_id={entity_id} key_id={key_id}")
                })
            }
        }
    }

    async fn try_compaction(
        &mut self,
        entity_id: i32,
        key_id: i32,
        start: NaiveDateTime,
        period_secs: i64,
        end: NaiveDateTime,
        dry_run: bool,
    ) -> std::result::Result<CompactionOutcome, tokio_postgres::Error> {
        let tx = self.client.transaction().await?;

        let rows: Vec<RawRow> = tx
            .query(
                "SELECT id, added, value FROM tsd \
                 WHERE entity_id = $1 AND key_id = $2 AND added < $3 AND added > $4 \
                 ORDER BY added",
                &[&entity_id, &key_id, &start, &end],
            )
            .await?
            .iter()
            .map(|r| RawRow {
                id: r.get(0),
                added: r.get(1),
                value: r.get(2),
            })
            .collect();

        let Some((ids, buckets)) = compaction_plan(&rows, period_secs) else {
            debug!(entity_id, key_id, rows = rows.len(), "nothing to compact");
            return Ok(CompactionOutcome {
                rows_read: rows.len(),
                rows_written: rows.len(),
                committed: false,
            });
        };

        tx.execute("DELETE FROM tsd WHERE id = ANY($1)", &[&ids]).await?;

        let stmt = tx
            .prepare(
                "INSERT INTO tsd (entity_id, key_id, added, value) \
                 VALUES ($1, $2, $3, $4)",
            )
            .await?;
        for bucket in &buckets {
            tx.execute(&stmt, &[&entity_id, &key_id, &bucket.added, &bucket.value])
                .await?;
        }

        let committed = if dry_run {
            tx.rollback().await?;
            false
        } else {
            tx.commit().await?;
            true
        };

        Ok(CompactionOutcome {
            rows_read: rows.len(),
            rows_written: buckets.len(),
            committed,
        })
    }
}
