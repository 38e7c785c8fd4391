use crate::coupling::{Coupling, CouplingKind};
use crate::state::CoherenceMetrics;
use crate::step::Mode;
use crate::stream::{StepExecutionRecord, StreamSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const EMA_KEEP: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModeCounts {
    pub expressive: u64,
    pub reflective: u64,
    pub relevance_realization: u64,
    pub meta_cognitive: u64,
}

impl ModeCounts {
    fn bump(&mut self, mode: Mode) {
        match mode {
            Mode::Expressive => self.expressive += 1,
            Mode::Reflective => self.reflective += 1,
            Mode::RelevanceRealization => self.relevance_realization += 1,
            Mode::MetaCognitive => self.meta_cognitive += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.expressive + self.reflective + self.relevance_realization + self.meta_cognitive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Created,
    Running,
    Stopped,
}

/// Point-in-time copy of everything the scheduler exposes.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub state: SchedulerState,
    pub uptime: Duration,
    pub cycle_count: u64,
    pub group_sync_count: Vec<u64>,
    pub total_steps_executed: u64,
    pub failed_steps: u64,
    pub partial_sync_count: u64,
    pub average_step_duration: Duration,
    pub mode_counts: ModeCounts,
    pub failures_by_pair: BTreeMap<String, u64>,
    /// Couplings found at the most recent group release.
    pub active_couplings: Vec<Coupling>,
    pub coupling_counts: BTreeMap<CouplingKind, u64>,
    pub coherence: CoherenceMetrics,
    pub streams: Vec<StreamSnapshot>,
}

impl MetricsSnapshot {
    pub fn current_steps(&self) -> Vec<usize> {
        self.streams.iter().map(|stream| stream.current_step).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LapMark {
    Pending,
    Wrapped,
    Retired,
}

struct MetricsInner {
    started: Option<Instant>,
    cycle_count: u64,
    laps: Vec<LapMark>,
    group_sync_count: Vec<u64>,
    total_steps: u64,
    failed_steps: u64,
    partial_syncs: u64,
    average_step_duration: Option<Duration>,
    mode_counts: ModeCounts,
    failures_by_pair: BTreeMap<String, u64>,
    active_couplings: Vec<Coupling>,
    coupling_counts: BTreeMap<CouplingKind, u64>,
}

/// Aggregate counters fed by every stream runner.
pub struct SchedulerMetrics {
    inner: Mutex<MetricsInner>,
}

impl SchedulerMetrics {
    pub fn new(stream_count: usize, group_count: usize) -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                started: None,
                cycle_count: 0,
                laps: vec![LapMark::Pending; stream_count],
                group_sync_count: vec![0; group_count],
                total_steps: 0,
                failed_steps: 0,
                partial_syncs: 0,
                average_step_duration: None,
                mode_counts: ModeCounts::default(),
                failures_by_pair: BTreeMap::new(),
                active_couplings: Vec::new(),
                coupling_counts: BTreeMap::new(),
            }),
        }
    }

    pub fn mark_started(&self) {
        self.inner.lock().started = Some(Instant::now());
    }

    pub fn record_step(&self, record: &StepExecutionRecord) {
        let mut inner = self.inner.lock();
        inner.total_steps += 1;
        inner.mode_counts.bump(record.mode);
        if !record.success {
            inner.failed_steps += 1;
            *inner
                .failures_by_pair
                .entry(format!("{}/{}", record.term, record.mode))
                .or_default() += 1;
        }
        inner.average_step_duration = Some(match inner.average_step_duration {
            None => record.duration,
            Some(average) => average
                .mul_f64(EMA_KEEP)
                .saturating_add(record.duration.mul_f64(1.0 - EMA_KEEP)),
        });
    }

    pub fn record_group_sync(&self, group: usize) {
        if let Some(count) = self.inner.lock().group_sync_count.get_mut(group) {
            *count += 1;
        }
    }

    /// Replaces the active set with what one release produced, even when empty.
    pub fn record_couplings(&self, couplings: &[Coupling]) {
        let mut inner = self.inner.lock();
        for coupling in couplings {
            *inner.coupling_counts.entry(coupling.kind).or_default() += 1;
        }
        inner.active_couplings = couplings.to_vec();
    }

    pub fn record_partial_sync(&self) {
        self.inner.lock().partial_syncs += 1;
    }

    /// Notes that `stream_id` wrapped from the last step back to 0. Returns
    /// the new cycle count once every live stream has wrapped since the last
    /// increment.
    pub fn record_lap(&self, stream_id: usize) -> Option<u64> {
        let mut inner = self.inner.lock();
        let mark = inner.laps.get_mut(stream_id)?;
        if *mark != LapMark::Pending {
            return None;
        }
        *mark = LapMark::Wrapped;
        Self::maybe_complete_cycle(&mut inner)
    }

    /// Excludes a retired stream from cycle accounting. May itself complete
    /// a cycle if the retired stream was the only one left to wrap.
    pub fn retire_stream(&self, stream_id: usize) -> Option<u64> {
        let mut inner = self.inner.lock();
        let mark = inner.laps.get_mut(stream_id)?;
        if *mark == LapMark::Retired {
            return None;
        }
        *mark = LapMark::Retired;
        Self::maybe_complete_cycle(&mut inner)
    }

    fn maybe_complete_cycle(inner: &mut MetricsInner) -> Option<u64> {
        let mut any_wrapped = false;
        for mark in &inner.laps {
            match mark {
                LapMark::Pending => return None,
                LapMark::Wrapped => any_wrapped = true,
                LapMark::Retired => {}
            }
        }
        if !any_wrapped {
            return None;
        }
        for mark in inner.laps.iter_mut() {
            if *mark == LapMark::Wrapped {
                *mark = LapMark::Pending;
            }
        }
        inner.cycle_count += 1;
        Some(inner.cycle_count)
    }

    pub fn total_steps(&self) -> u64 {
        self.inner.lock().total_steps
    }

    pub fn cycle_count(&self) -> u64 {
        self.inner.lock().cycle_count
    }

    pub fn snapshot(
        &self,
        state: SchedulerState,
        coherence: CoherenceMetrics,
        streams: Vec<StreamSnapshot>,
    ) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            state,
            uptime: match (state, inner.started) {
                (SchedulerState::Running, Some(started)) => started.elapsed(),
                _ => Duration::ZERO,
            },
            cycle_count: inner.cycle_count,
            group_sync_count: inner.group_sync_count.clone(),
            total_steps_executed: inner.total_steps,
            failed_steps: inner.failed_steps,
            partial_sync_count: inner.partial_syncs,
            average_step_duration: inner.average_step_duration.unwrap_or_default(),
            mode_counts: inner.mode_counts,
            failures_by_pair: inner.failures_by_pair.clone(),
            active_couplings: inner.active_couplings.clone(),
            coupling_counts: inner.coupling_counts.clone(),
            coherence,
            streams,
        }
    }
}
