//! Per-stream state and the loop that drives one stream through the cycle.

use crate::barrier::{BarrierError, TriadBarrier};
use crate::cancel::CancelToken;
use crate::coupling::{CouplingRegistry, detect_couplings};
use crate::metrics::SchedulerMetrics;
use crate::registry::{Dispatch, HandlerRegistry};
use crate::state::SharedState;
use crate::step::{Mode, StepDescriptor, StepTable, TermId, sync_group};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepExecutionRecord {
    pub step: usize,
    pub term: TermId,
    pub mode: Mode,
    pub started_at_unix_ms: u64,
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub id: usize,
    pub current_step: usize,
    pub phase_offset: usize,
    pub lap: u64,
    pub ticks: u64,
    pub paused: bool,
    pub active: bool,
    pub partial_syncs: u64,
    pub last_record: Option<StepExecutionRecord>,
}

struct Progress {
    current_step: usize,
    lap: u64,
    ticks: u64,
    partial_syncs: u64,
    history: VecDeque<StepExecutionRecord>,
}

/// One execution line. Position only moves forward, one step at a time.
pub struct Stream {
    id: usize,
    phase_offset: usize,
    cycle_length: usize,
    history_capacity: usize,
    progress: Mutex<Progress>,
    paused: AtomicBool,
    active: AtomicBool,
    cancel: CancelToken,
}

impl Stream {
    pub fn new(
        id: usize,
        phase_offset: usize,
        cycle_length: usize,
        history_capacity: usize,
    ) -> Self {
        Self {
            id,
            phase_offset,
            cycle_length,
            history_capacity,
            progress: Mutex::new(Progress {
                current_step: phase_offset % cycle_length,
                lap: 0,
                ticks: 0,
                partial_syncs: 0,
                history: VecDeque::with_capacity(history_capacity),
            }),
            paused: AtomicBool::new(false),
            active: AtomicBool::new(true),
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase_offset(&self) -> usize {
        self.phase_offset
    }

    pub fn current_step(&self) -> usize {
        self.progress.lock().current_step
    }

    /// `(current_step, ticks)`; ticks counts steps taken since start and is
    /// the logical position shared by all streams at a rendezvous.
    pub fn position(&self) -> (usize, u64) {
        let progress = self.progress.lock();
        (progress.current_step, progress.ticks)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn history(&self) -> Vec<StepExecutionRecord> {
        self.progress.lock().history.iter().cloned().collect()
    }

    /// Newest `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<StepExecutionRecord> {
        let progress = self.progress.lock();
        let skip = progress.history.len().saturating_sub(limit);
        progress.history.iter().skip(skip).cloned().collect()
    }

    fn push_record(&self, record: StepExecutionRecord) {
        let mut progress = self.progress.lock();
        if progress.history.len() == self.history_capacity {
            progress.history.pop_front();
        }
        progress.history.push_back(record);
    }

    fn note_partial_sync(&self) {
        self.progress.lock().partial_syncs += 1;
    }

    /// Moves to the next step. Returns true when the stream wrapped to step 0.
    fn advance(&self) -> bool {
        let mut progress = self.progress.lock();
        progress.ticks += 1;
        progress.current_step = (progress.current_step + 1) % self.cycle_length;
        let wrapped = progress.current_step == 0;
        if wrapped {
            progress.lap += 1;
        }
        wrapped
    }

    fn mark_exited(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let progress = self.progress.lock();
        StreamSnapshot {
            id: self.id,
            current_step: progress.current_step,
            phase_offset: self.phase_offset,
            lap: progress.lap,
            ticks: progress.ticks,
            paused: self.is_paused(),
            active: self.is_active(),
            partial_syncs: progress.partial_syncs,
            last_record: progress.history.back().cloned(),
        }
    }
}

/// Everything a runner shares with its peers.
pub(crate) struct RunnerShared {
    pub table: Arc<StepTable>,
    pub registry: Arc<HandlerRegistry>,
    pub couplings: Arc<CouplingRegistry>,
    pub state: Arc<SharedState>,
    pub metrics: Arc<SchedulerMetrics>,
    pub streams: Vec<Arc<Stream>>,
    pub barriers: Vec<Arc<TriadBarrier>>,
    /// Indexed by sync group; false means the group does not rendezvous.
    pub synchronized: Vec<bool>,
    pub period: Duration,
    pub failure_warn_threshold: u32,
}

impl RunnerShared {
    fn group_count(&self) -> usize {
        self.barriers.len()
    }
}

/// A dispatch that takes longer than one period pushes every later tick of
/// the stream back.
fn overran(duration: Duration, period: Duration) -> bool {
    duration > period
}

/// Consecutive handler failures per `(term, mode)` on one stream.
#[derive(Debug, Default)]
struct FailureStreaks {
    streaks: HashMap<(TermId, Mode), u32>,
}

impl FailureStreaks {
    /// Folds one dispatch outcome into the streak for `(term, mode)`. Returns
    /// the streak length when it reaches a multiple of `threshold`.
    fn observe(&mut self, term: &TermId, mode: Mode, failed: bool, threshold: u32) -> Option<u32> {
        let key = (term.clone(), mode);
        if !failed {
            self.streaks.remove(&key);
            return None;
        }
        let streak = self.streaks.entry(key).or_insert(0);
        *streak += 1;
        (*streak % threshold.max(1) == 0).then_some(*streak)
    }
}

pub(crate) struct StreamRunner {
    stream: Arc<Stream>,
    shared: Arc<RunnerShared>,
    failures: FailureStreaks,
}

impl StreamRunner {
    pub fn new(stream: Arc<Stream>, shared: Arc<RunnerShared>) -> Self {
        Self {
            stream,
            shared,
            failures: FailureStreaks::default(),
        }
    }

    /// Ticks every period until cancelled. Late ticks are not replayed; the
    /// next deadline is pushed out one period from now instead.
    pub fn run(mut self) {
        let period = self.shared.period;
        let cancel = self.stream.cancel_token().clone();
        debug!(
            target: "echobeats::stream",
            stream = self.stream.id(),
            phase_offset = self.stream.phase_offset(),
            "stream runner started"
        );
        let mut deadline = Instant::now() + period;
        while !cancel.wait_until(deadline) {
            let now = Instant::now();
            deadline += period;
            if deadline <= now {
                deadline = now + period;
            }
            if self.stream.is_paused() {
                continue;
            }
            self.tick();
        }
        self.stream.mark_exited();
        debug!(
            target: "echobeats::stream",
            stream = self.stream.id(),
            "stream runner exited"
        );
    }

    fn tick(&mut self) {
        let (step, ticks) = self.stream.position();
        let descriptor = self.shared.table.descriptor_for(step).clone();
        let stream_id = self.stream.id();

        let started_at_unix_ms = now_unix_ms();
        let started = Instant::now();
        let dispatch = self.shared.registry.dispatch(
            &descriptor.term,
            descriptor.mode,
            stream_id,
            step,
            &self.shared.state,
        );
        let duration = started.elapsed();
        self.apply_results(&dispatch);

        if overran(duration, self.shared.period) {
            warn!(
                target: "echobeats::stream",
                stream = stream_id,
                step,
                term = %descriptor.term,
                mode = %descriptor.mode,
                duration_ms = duration.as_millis() as u64,
                period_ms = self.shared.period.as_millis() as u64,
                "step dispatch overran the step period"
            );
        }
        self.track_failures(&descriptor.term, descriptor.mode, step, &dispatch);

        // A partial rendezvous fails the step even when every handler succeeded.
        let mut error = dispatch.error;
        if let Err(partial) = self.synchronize(step, ticks) {
            if error.is_none() {
                error = Some(partial.to_string());
            }
        }
        let record = StepExecutionRecord {
            step,
            term: descriptor.term,
            mode: descriptor.mode,
            started_at_unix_ms,
            duration,
            success: error.is_none(),
            error,
        };
        self.shared.metrics.record_step(&record);
        self.stream.push_record(record);

        if self.stream.advance() {
            if let Some(cycle) = self.shared.metrics.record_lap(stream_id) {
                complete_cycle(&self.shared, cycle);
            }
        }
    }

    fn apply_results(&self, dispatch: &Dispatch) {
        let stream_id = self.stream.id();
        for result in &dispatch.results {
            if let Some(context) = &result.context {
                self.shared.state.update_context(stream_id, context.clone());
            }
            for &observed in &result.perceived {
                self.shared.state.record_perception(stream_id, observed);
            }
            if let Some(note) = &result.note {
                debug!(
                    target: "echobeats::stream",
                    stream = stream_id,
                    note = note.as_str(),
                    "handler note"
                );
            }
        }
    }

    fn track_failures(&mut self, term: &TermId, mode: Mode, step: usize, dispatch: &Dispatch) {
        let threshold = self.shared.failure_warn_threshold;
        let streak = self.failures.observe(term, mode, dispatch.error.is_some(), threshold);
        let Some(error) = &dispatch.error else {
            return;
        };
        if let Some(consecutive) = streak {
            warn!(
                target: "echobeats::stream",
                stream = self.stream.id(),
                step,
                term = %term,
                mode = %mode,
                consecutive,
                error = error.as_str(),
                "handler keeps failing"
            );
        } else {
            debug!(
                target: "echobeats::stream",
                stream = self.stream.id(),
                step,
                term = %term,
                mode = %mode,
                error = error.as_str(),
                "handler failed"
            );
        }
    }

    /// Waits at this step's sync group. Only `PartialSync` is returned; a
    /// closed barrier means the scheduler is stopping and the step stands.
    fn synchronize(&self, step: usize, ticks: u64) -> Result<(), BarrierError> {
        let group = sync_group(step, self.shared.group_count());
        if !self.shared.synchronized.get(group).copied().unwrap_or(false) {
            return Ok(());
        }
        let stream_id = self.stream.id();
        match self.shared.barriers[group].arrive(ticks, step, stream_id) {
            Ok(arrival) => {
                if arrival.leader {
                    self.shared.metrics.record_group_sync(group);
                    self.handle_couplings(group, &arrival.participants);
                }
                Ok(())
            }
            Err(err @ BarrierError::PartialSync { .. }) => {
                self.stream.note_partial_sync();
                self.shared.metrics.record_partial_sync();
                warn!(
                    target: "echobeats::barrier",
                    stream = stream_id,
                    step,
                    group,
                    error = %err,
                    "step ended without full synchronization"
                );
                Err(err)
            }
            Err(BarrierError::Closed { .. }) => {
                debug!(
                    target: "echobeats::barrier",
                    stream = stream_id,
                    group,
                    "barrier closed, skipping rendezvous"
                );
                Ok(())
            }
        }
    }

    fn handle_couplings(&self, group: usize, participants: &[(usize, usize)]) {
        let held: Vec<(usize, &StepDescriptor)> = participants
            .iter()
            .map(|&(stream, step)| (stream, self.shared.table.descriptor_for(step)))
            .collect();
        let couplings = detect_couplings(group, &held);
        self.shared.metrics.record_couplings(&couplings);
        for coupling in &couplings {
            self.shared.couplings.fire(coupling, &self.shared.state);
        }
    }
}

/// Recomputes coherence once per completed cycle from the last lap of
/// records across every stream.
pub(crate) fn complete_cycle(shared: &RunnerShared, cycle: u64) {
    let lap = shared.table.len();
    let records: Vec<StepExecutionRecord> = shared
        .streams
        .iter()
        .flat_map(|stream| stream.recent(lap))
        .collect();
    let metrics = shared.state.recompute_metrics(&records);
    info!(
        target: "echobeats::scheduler",
        cycle,
        coherence = metrics.coherence,
        alignment = metrics.alignment,
        integration = metrics.integration,
        "cycle complete"
    );
}
