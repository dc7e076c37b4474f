pub mod rollup;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::metric::{metric_points, MetricPoint, Sample};

use self::rollup::compute_group;

/// Aggregated metric values for one entity, keyed
/// `"<metric_name>.<rollup_suffix>"`. Produced once per flush cycle.
pub type EntityMetrics = HashMap<String, f64>;

type EntityBuffer = DashMap<String, Vec<Sample>>;

/// Buffers raw samples per entity and computes rollup statistics on demand.
///
/// Pushes append through a lock-free double buffer: `push` loads the live
/// buffer pointer and appends, while `flush_and_reset` swaps in a fresh
/// buffer and computes over the displaced one. A push racing with the swap
/// lands in either the snapshot being computed or the fresh buffer; one
/// that reaches the displaced buffer after the computation already passed
/// its entity is dropped. The flush mutex only serializes flushes against
/// each other, never pushes.
pub struct Aggregator {
    /// Rollup spec per metric kind: ordered function tokens.
    rollups: HashMap<String, Vec<String>>,
    buffer: ArcSwap<EntityBuffer>,
    flush_lock: parking_lot::Mutex<()>,
}

impl Aggregator {
    /// Creates an aggregator with an empty buffer and the given rollup spec.
    pub fn new(rollups: HashMap<String, Vec<String>>) -> Self {
        Self {
            rollups,
            buffer: ArcSwap::from_pointee(EntityBuffer::new()),
            flush_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Appends one sample to its entity's buffer.
    ///
    /// A sample without a host cannot be attributed to an entity; it is
    /// logged and discarded. Never returns an error to the caller.
    pub fn push(&self, sample: Sample) {
        if sample.host.is_empty() {
            error!("discarding sample without host");
            debug!(?sample, "discarded sample");
            return;
        }

        let buffer = self.buffer.load();
        buffer.entry(sample.host.clone()).or_default().push(sample);
    }

    /// Appends a batch of samples.
    pub fn push_all(&self, samples: Vec<Sample>) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// Computes rollups over the current buffer without resetting it.
    ///
    /// An entity whose rollup computation fails is logged and omitted;
    /// other entities are unaffected.
    pub fn snapshot(&self) -> HashMap<String, EntityMetrics> {
        let buffer = self.buffer.load();
        self.compute(&buffer)
    }

    /// Computes rollups and atomically replaces the buffer with a fresh one.
    ///
    /// At most one flush runs at a time. The swap happens before the
    /// computation, so samples pushed to the displaced buffer during the
    /// computation are normally still included in this cycle's result; one
    /// appended after the iteration passed its entity is lost.
    pub fn flush_and_reset(&self) -> HashMap<String, EntityMetrics> {
        let _guard = self.flush_lock.lock();
        let displaced = self.buffer.swap(Arc::new(EntityBuffer::new()));
        self.compute(&displaced)
    }

    /// Returns a copy of the buffered samples for one entity, if any.
    pub fn buffered_samples(&self, host: &str) -> Option<Vec<Sample>> {
        self.buffer.load().get(host).map(|entry| entry.value().clone())
    }

    fn compute(&self, buffer: &EntityBuffer) -> HashMap<String, EntityMetrics> {
        let mut out = HashMap::with_capacity(buffer.len());

        for entry in buffer.iter() {
            match self.compute_entity(entry.value()) {
                Ok(metrics) => {
                    if !metrics.is_empty() {
                        out.insert(entry.key().clone(), metrics);
                    }
                }
                Err(e) => {
                    error!(
                        entity = %entry.key(),
                        error = %e,
                        "rollup computation failed, entity omitted",
                    );
                }
            }
        }

        out
    }

    /// Computes the aggregated metrics for one entity's buffered samples.
    ///
    /// Structurally invalid samples are logged and skipped individually;
    /// a rollup configuration error aborts the whole entity.
    fn compute_entity(&self, samples: &[Sample]) -> Result<EntityMetrics, Error> {
        let mut groups: HashMap<String, Vec<MetricPoint>> = HashMap::new();

        for sample in samples {
            match metric_points(sample) {
                Ok(points) => {
                    for point in points {
                        groups.entry(point.name.clone()).or_default().push(point);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping invalid sample");
                    debug!(?sample, "invalid sample");
                }
            }
        }

        let mut metrics = EntityMetrics::with_capacity(groups.len());
        for (name, points) in &groups {
            // Kind is homogeneous per name within one flush; the first
            // point selects the rollup spec.
            let kind = &points[0].kind;
            let tokens = self.rollups.get(kind).ok_or_else(|| {
                Error::InvalidConfig(format!("no rollups configured for kind {kind:?}"))
            })?;

            for (key, value) in compute_group(name, points, tokens)? {
                metrics.insert(key, value);
            }
        }

        Ok(metrics)
    }
}
