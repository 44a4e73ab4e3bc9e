//! Streaming aggregation engine.
//!
//! Reduces a large record stream into per-group aggregates without
//! holding the input in memory: per-group buffers accumulate until the
//! flush threshold, then their deltas are upserted into the aggregation
//! store and the buffers cleared. Peak memory is bounded by the number
//! of distinct groups seen since the last flush.

use std::collections::HashMap;
use std::sync::Arc;

use conveyor_job::{AggregateDelta, AggregationType, JobError, WorkRecord};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::storage::AggregationStore;

/// Outcome of one aggregation run.
#[derive(Debug, Clone, Default)]
pub struct AggregationStats {
    /// Every input record, parseable or not.
    pub records_seen: u64,
    /// Records that parsed and were folded into buffers.
    pub records_parsed: u64,
    pub parse_failures: u64,
    pub flushes: u64,
    /// Distinct groups per aggregation family after the final flush.
    pub groups: Vec<(AggregationType, u64)>,
}

/// The engine. One instance may serve many executions; each
/// `aggregate` call keeps its own buffers and is single-threaded.
pub struct StreamingAggregator {
    store: Arc<dyn AggregationStore>,
    depth: u8,
    flush_size: usize,
}

impl StreamingAggregator {
    pub fn new(store: Arc<dyn AggregationStore>, depth: u8, flush_size: usize) -> Self {
        Self {
            store,
            depth: depth.clamp(1, 3),
            flush_size: flush_size.max(1),
        }
    }

    /// Consume the input and upsert batched aggregates.
    ///
    /// Every input record advances the flush counter by exactly one,
    /// parse failures included, so cadence never drifts; the counter
    /// resets on each flush. Unparseable records are counted but not
    /// buffered.
    pub async fn aggregate<I>(
        &self,
        execution_id: i64,
        input: I,
    ) -> Result<AggregationStats, CoreError>
    where
        I: IntoIterator<Item = Result<WorkRecord, JobError>>,
    {
        let families = AggregationType::for_depth(self.depth);
        let mut buffers: HashMap<AggregationType, HashMap<String, AggregateDelta>> =
            families.iter().map(|ty| (*ty, HashMap::new())).collect();

        let mut stats = AggregationStats::default();
        let mut records_since_flush = 0usize;

        for item in input {
            stats.records_seen += 1;
            records_since_flush += 1;

            match item {
                Ok(record) => {
                    stats.records_parsed += 1;
                    for ty in families {
                        let key = ty.group_key(&record);
                        buffers
                            .entry(*ty)
                            .or_default()
                            .entry(key)
                            .and_modify(|delta| delta.observe(&record))
                            .or_insert_with(|| AggregateDelta::first(&record));
                    }
                }
                Err(e) => {
                    stats.parse_failures += 1;
                    warn!(execution_id, error = %e, "skipping unparseable record");
                }
            }

            if records_since_flush == self.flush_size {
                self.flush(execution_id, &mut buffers).await?;
                stats.flushes += 1;
                records_since_flush = 0;
            }
        }

        // Final flush of whatever remains.
        if buffers.values().any(|groups| !groups.is_empty()) {
            self.flush(execution_id, &mut buffers).await?;
            stats.flushes += 1;
        }

        for ty in families {
            let count = self.store.count_distinct_groups(execution_id, *ty).await?;
            stats.groups.push((*ty, count));
        }

        debug!(
            execution_id,
            records = stats.records_seen,
            parsed = stats.records_parsed,
            flushes = stats.flushes,
            "aggregation finished"
        );
        Ok(stats)
    }

    /// Upsert every buffered delta, then clear the buffers so the same
    /// delta can never reach the store twice.
    async fn flush(
        &self,
        execution_id: i64,
        buffers: &mut HashMap<AggregationType, HashMap<String, AggregateDelta>>,
    ) -> Result<(), CoreError> {
        for (ty, groups) in buffers.iter_mut() {
            for (key, delta) in groups.iter() {
                self.store
                    .upsert_batch(execution_id, *ty, key, delta)
                    .await?;
            }
            groups.clear();
        }
        Ok(())
    }
}
