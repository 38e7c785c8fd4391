//! Cross-stream context shared by every stream, plus the derived coherence metrics.

use crate::stream::StepExecutionRecord;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

const NEUTRAL_METRIC: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoherenceMetrics {
    pub coherence: f64,
    pub alignment: f64,
    pub integration: f64,
}

impl CoherenceMetrics {
    pub fn neutral() -> Self {
        Self {
            coherence: NEUTRAL_METRIC,
            alignment: NEUTRAL_METRIC,
            integration: NEUTRAL_METRIC,
        }
    }

    fn clamped(self) -> Self {
        Self {
            coherence: clamp_unit(self.coherence),
            alignment: clamp_unit(self.alignment),
            integration: clamp_unit(self.integration),
        }
    }
}

impl Default for CoherenceMetrics {
    fn default() -> Self {
        Self::neutral()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Consistent view handed to a [`CoherenceModel`]; taken under the state's write lock.
pub struct CoherenceInputs<'a> {
    pub stream_count: usize,
    pub perceived_by: &'a [BTreeSet<usize>],
    pub has_context: &'a [bool],
    pub records: &'a [StepExecutionRecord],
}

pub trait CoherenceModel: Send + Sync {
    fn compute(&self, inputs: &CoherenceInputs<'_>) -> CoherenceMetrics;
}

/// Default model: perception density drives alignment, handler success drives
/// coherence, and integration blends both over the streams that published context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerceptionCoherence;

impl CoherenceModel for PerceptionCoherence {
    fn compute(&self, inputs: &CoherenceInputs<'_>) -> CoherenceMetrics {
        let streams = inputs.stream_count;
        let alignment = if streams < 2 {
            1.0
        } else {
            let observed: usize = inputs
                .perceived_by
                .iter()
                .enumerate()
                .map(|(observed, observers)| {
                    observers.iter().filter(|&&observer| observer != observed).count()
                })
                .sum();
            observed as f64 / (streams * (streams - 1)) as f64
        };
        let coherence = if inputs.records.is_empty() {
            1.0
        } else {
            let ok = inputs.records.iter().filter(|record| record.success).count();
            ok as f64 / inputs.records.len() as f64
        };
        let coverage = if streams == 0 {
            0.0
        } else {
            inputs.has_context.iter().filter(|&&has| has).count() as f64 / streams as f64
        };
        CoherenceMetrics {
            coherence,
            alignment,
            integration: coverage * (alignment + coherence) / 2.0,
        }
    }
}

struct StateInner {
    contexts: Vec<Option<Value>>,
    perceived_by: Vec<BTreeSet<usize>>,
    metrics: CoherenceMetrics,
    recomputations: u64,
}

/// Single shared instance; every update is one exclusive, fully-applied write.
pub struct SharedState {
    inner: RwLock<StateInner>,
    model: Arc<dyn CoherenceModel>,
}

impl SharedState {
    pub fn new(stream_count: usize) -> Self {
        Self::with_model(stream_count, Arc::new(PerceptionCoherence))
    }

    pub fn with_model(stream_count: usize, model: Arc<dyn CoherenceModel>) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                contexts: vec![None; stream_count],
                perceived_by: vec![BTreeSet::new(); stream_count],
                metrics: CoherenceMetrics::neutral(),
                recomputations: 0,
            }),
            model,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.inner.read().contexts.len()
    }

    /// Publishes a new context and forgets who had perceived the previous one.
    /// Unknown stream ids are ignored.
    pub fn update_context(&self, stream_id: usize, value: Value) {
        let mut inner = self.inner.write();
        if stream_id >= inner.contexts.len() {
            return;
        }
        inner.contexts[stream_id] = Some(value);
        inner.perceived_by[stream_id].clear();
    }

    /// Marks `observer_id` as having seen `observed_id`'s latest context.
    pub fn record_perception(&self, observer_id: usize, observed_id: usize) {
        let mut inner = self.inner.write();
        if observed_id >= inner.perceived_by.len() || observer_id >= inner.contexts.len() {
            return;
        }
        inner.perceived_by[observed_id].insert(observer_id);
    }

    pub fn context(&self, stream_id: usize) -> Option<Value> {
        self.inner.read().contexts.get(stream_id).cloned().flatten()
    }

    pub fn perceived_by(&self, stream_id: usize) -> BTreeSet<usize> {
        self.inner
            .read()
            .perceived_by
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> CoherenceMetrics {
        self.inner.read().metrics
    }

    pub fn recomputations(&self) -> u64 {
        self.inner.read().recomputations
    }

    /// Recalculates coherence metrics from the perception graph and `records`.
    /// Holds the write lock for the whole computation so the inputs cannot
    /// shift underneath the model.
    pub fn recompute_metrics(&self, records: &[StepExecutionRecord]) -> CoherenceMetrics {
        let mut inner = self.inner.write();
        let has_context: Vec<bool> = inner.contexts.iter().map(Option::is_some).collect();
        let metrics = self
            .model
            .compute(&CoherenceInputs {
                stream_count: inner.contexts.len(),
                perceived_by: &inner.perceived_by,
                has_context: &has_context,
                records,
            })
            .clamped();
        inner.metrics = metrics;
        inner.recomputations += 1;
        metrics
    }
}
