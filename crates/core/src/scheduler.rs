//! Lifecycle owner for the step table, handler registry, streams and barriers.
//!
//! `Created -> Running -> Stopped`; the stopped state is terminal.

use crate::barrier::TriadBarrier;
use crate::config::SchedulerConfig;
use crate::coupling::{Coupling, CouplingKind, CouplingRegistry};
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics, SchedulerState};
use crate::registry::{Handler, HandlerRegistry, HandlerResult};
use crate::state::{CoherenceModel, SharedState};
use crate::step::{Mode, StepDescriptor, StepTable, TermId};
use crate::stream::{RunnerShared, StepExecutionRecord, Stream, StreamRunner, complete_cycle};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct Settings {
    cycle_length: usize,
    stream_count: usize,
    period: Duration,
    stop_grace: Duration,
    history_capacity: usize,
    failure_warn_threshold: u32,
    synchronized: Vec<bool>,
}

impl Settings {
    fn group_count(&self) -> usize {
        self.cycle_length / self.stream_count
    }
}

struct RunHandles {
    shared: Arc<RunnerShared>,
    runners: Vec<(usize, JoinHandle<()>)>,
    exits: Receiver<usize>,
}

impl RunHandles {
    fn signal_shutdown(&self) {
        for stream in &self.shared.streams {
            stream.cancel_token().cancel();
        }
        for barrier in &self.shared.barriers {
            barrier.close();
        }
    }
}

struct Lifecycle {
    state: SchedulerState,
    pending: Option<HandlerRegistry>,
    pending_couplings: Option<CouplingRegistry>,
    run: Option<RunHandles>,
    streams: Vec<Arc<Stream>>,
}

/// Sends the stream id when the runner thread ends, including by panic.
struct ExitNotice {
    stream_id: usize,
    tx: Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.tx.send(self.stream_id).ok();
    }
}

pub struct Scheduler {
    settings: Settings,
    table: Arc<StepTable>,
    state: Arc<SharedState>,
    metrics: Arc<SchedulerMetrics>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    /// Builds a scheduler for `stream_count` streams over a `cycle_length`
    /// step cycle, with every other option at its default.
    pub fn new(
        cycle_length: usize,
        stream_count: usize,
        steps: Vec<StepDescriptor>,
        period: Duration,
    ) -> SchedulerResult<Self> {
        let config = SchedulerConfig {
            cycle_length,
            stream_count,
            steps,
            ..SchedulerConfig::default()
        };
        Self::build(&config, period)
    }

    pub fn from_config(config: &SchedulerConfig) -> SchedulerResult<Self> {
        Self::build(config, config.step_period())
    }

    fn build(config: &SchedulerConfig, period: Duration) -> SchedulerResult<Self> {
        config.validate()?;
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod);
        }
        let table = StepTable::new(config.cycle_length, config.steps.clone())?;
        let synchronized = config.sync.resolve(config.group_count())?;
        let settings = Settings {
            cycle_length: config.cycle_length,
            stream_count: config.stream_count,
            period,
            stop_grace: config.stop_grace(),
            history_capacity: config.history_capacity,
            failure_warn_threshold: config.failure_warn_threshold,
            synchronized,
        };
        let metrics = SchedulerMetrics::new(settings.stream_count, settings.group_count());
        Ok(Self {
            state: Arc::new(SharedState::new(settings.stream_count)),
            metrics: Arc::new(metrics),
            table: Arc::new(table),
            settings,
            lifecycle: Mutex::new(Lifecycle {
                state: SchedulerState::Created,
                pending: Some(HandlerRegistry::new()),
                pending_couplings: Some(CouplingRegistry::new()),
                run: None,
                streams: Vec::new(),
            }),
        })
    }

    /// Swaps the metric function used at each cycle completion.
    pub fn with_coherence_model(mut self, model: Arc<dyn CoherenceModel>) -> Self {
        self.state = Arc::new(SharedState::with_model(self.settings.stream_count, model));
        self
    }

    pub fn cycle_length(&self) -> usize {
        self.settings.cycle_length
    }

    pub fn stream_count(&self) -> usize {
        self.settings.stream_count
    }

    pub fn group_count(&self) -> usize {
        self.settings.group_count()
    }

    pub fn phase_offset(&self, stream_id: usize) -> usize {
        stream_id * self.group_count()
    }

    pub fn step_table(&self) -> &StepTable {
        &self.table
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle.lock().state
    }

    pub fn register<F>(
        &self,
        term: impl Into<TermId>,
        mode: Mode,
        handler: F,
    ) -> SchedulerResult<()>
    where
        F: Fn(usize, usize, &SharedState) -> anyhow::Result<HandlerResult> + Send + Sync + 'static,
    {
        self.register_handler(term, mode, Arc::new(handler))
    }

    pub fn register_handler(
        &self,
        term: impl Into<TermId>,
        mode: Mode,
        handler: Handler,
    ) -> SchedulerResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SchedulerState::Created {
            return Err(SchedulerError::LateRegistration);
        }
        let registry = lifecycle
            .pending
            .as_mut()
            .ok_or(SchedulerError::LateRegistration)?;
        registry.register_shared(term.into(), mode, handler);
        Ok(())
    }

    /// Adds a handler run whenever `kind` forms at a group release. Called on
    /// the releasing stream's thread.
    pub fn register_coupling<F>(&self, kind: CouplingKind, handler: F) -> SchedulerResult<()>
    where
        F: Fn(&Coupling, &SharedState) + Send + Sync + 'static,
    {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SchedulerState::Created {
            return Err(SchedulerError::LateRegistration);
        }
        let registry = lifecycle
            .pending_couplings
            .as_mut()
            .ok_or(SchedulerError::LateRegistration)?;
        registry.register(kind, Arc::new(handler));
        Ok(())
    }

    pub fn start(&self) -> SchedulerResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SchedulerState::Running => return Err(SchedulerError::AlreadyRunning),
            SchedulerState::Stopped => return Err(SchedulerError::AlreadyStopped),
            SchedulerState::Created => {}
        }
        let registry = lifecycle.pending.take().unwrap_or_default();
        let couplings = lifecycle.pending_couplings.take().unwrap_or_default();
        let handler_count = registry.len();
        let group_count = self.group_count();

        let streams: Vec<Arc<Stream>> = (0..self.settings.stream_count)
            .map(|id| {
                Arc::new(Stream::new(
                    id,
                    self.phase_offset(id),
                    self.settings.cycle_length,
                    self.settings.history_capacity,
                ))
            })
            .collect();
        let barriers: Vec<Arc<TriadBarrier>> = (0..group_count)
            .map(|group| Arc::new(TriadBarrier::new(group, self.settings.stream_count)))
            .collect();
        let shared = Arc::new(RunnerShared {
            table: Arc::clone(&self.table),
            registry: Arc::new(registry),
            couplings: Arc::new(couplings),
            state: Arc::clone(&self.state),
            metrics: Arc::clone(&self.metrics),
            streams: streams.clone(),
            barriers,
            synchronized: self.settings.synchronized.clone(),
            period: self.settings.period,
            failure_warn_threshold: self.settings.failure_warn_threshold,
        });

        let (tx, exits) = mpsc::channel();
        let mut runners = Vec::with_capacity(streams.len());
        for stream in &streams {
            let stream_id = stream.id();
            let runner = StreamRunner::new(Arc::clone(stream), Arc::clone(&shared));
            let notice = ExitNotice {
                stream_id,
                tx: tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("echobeats-stream-{stream_id}"))
                .spawn(move || {
                    let _notice = notice;
                    runner.run();
                });
            match spawned {
                Ok(handle) => runners.push((stream_id, handle)),
                Err(err) => {
                    let partial = RunHandles {
                        shared,
                        runners,
                        exits,
                    };
                    partial.signal_shutdown();
                    lifecycle.state = SchedulerState::Stopped;
                    lifecycle.streams = streams.clone();
                    return Err(SchedulerError::Spawn {
                        stream: stream_id,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.metrics.mark_started();
        lifecycle.state = SchedulerState::Running;
        lifecycle.streams = streams;
        lifecycle.run = Some(RunHandles {
            shared,
            runners,
            exits,
        });
        info!(
            target: "echobeats::scheduler",
            streams = self.settings.stream_count,
            cycle_length = self.settings.cycle_length,
            groups = group_count,
            period_ms = self.settings.period.as_millis() as u64,
            handlers = handler_count,
            "scheduler started"
        );
        Ok(())
    }

    /// Stops every stream using the configured grace period.
    pub fn shutdown(&self) -> SchedulerResult<()> {
        self.stop(self.settings.stop_grace)
    }

    /// Cancels all streams, releases barrier waiters with a partial-sync
    /// signal and waits up to `grace` for the runner threads. Runners still
    /// alive after that are detached and reported. Safe to call repeatedly.
    pub fn stop(&self, grace: Duration) -> SchedulerResult<()> {
        let run = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                SchedulerState::Stopped => return Ok(()),
                SchedulerState::Created => {
                    lifecycle.state = SchedulerState::Stopped;
                    lifecycle.pending = None;
                    lifecycle.pending_couplings = None;
                    return Ok(());
                }
                SchedulerState::Running => {
                    lifecycle.state = SchedulerState::Stopped;
                    lifecycle.run.take()
                }
            }
        };
        let Some(run) = run else {
            return Ok(());
        };
        info!(
            target: "echobeats::scheduler",
            grace_ms = grace.as_millis() as u64,
            "stopping scheduler"
        );
        run.signal_shutdown();

        let deadline = Instant::now() + grace;
        let mut exited = HashSet::new();
        while exited.len() < run.runners.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match run.exits.recv_timeout(remaining) {
                Ok(stream_id) => {
                    exited.insert(stream_id);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut forced = Vec::new();
        for (stream_id, handle) in run.runners {
            if exited.contains(&stream_id) || handle.is_finished() {
                if handle.join().is_err() {
                    warn!(
                        target: "echobeats::scheduler",
                        stream = stream_id,
                        "stream runner panicked"
                    );
                }
            } else {
                forced.push(stream_id);
            }
        }
        if !forced.is_empty() {
            warn!(
                target: "echobeats::scheduler",
                streams = ?forced,
                "streams did not exit within the grace period and were detached"
            );
            return Err(SchedulerError::ShutdownTimeout { streams: forced });
        }
        info!(
            target: "echobeats::scheduler",
            total_steps = self.metrics.total_steps(),
            cycles = self.metrics.cycle_count(),
            "scheduler stopped"
        );
        Ok(())
    }

    pub fn pause(&self, stream_id: usize) -> SchedulerResult<()> {
        let stream = self.running_stream(stream_id)?;
        stream.pause();
        info!(target: "echobeats::scheduler", stream = stream_id, "stream paused");
        Ok(())
    }

    pub fn resume(&self, stream_id: usize) -> SchedulerResult<()> {
        let stream = self.running_stream(stream_id)?;
        stream.resume();
        info!(target: "echobeats::scheduler", stream = stream_id, "stream resumed");
        Ok(())
    }

    /// Permanently stops one stream while the others keep running. Peers
    /// blocked on it get a partial-synchronization signal and later
    /// rendezvous only wait for the survivors.
    pub fn retire(&self, stream_id: usize) -> SchedulerResult<()> {
        let (stream, shared) = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.state != SchedulerState::Running {
                return Err(SchedulerError::NotRunning);
            }
            let stream = lifecycle
                .streams
                .get(stream_id)
                .cloned()
                .ok_or(SchedulerError::UnknownStream(stream_id))?;
            let shared = lifecycle
                .run
                .as_ref()
                .map(|run| Arc::clone(&run.shared))
                .ok_or(SchedulerError::NotRunning)?;
            (stream, shared)
        };
        stream.cancel_token().cancel();
        for barrier in &shared.barriers {
            barrier.depart(stream_id);
        }
        if let Some(cycle) = self.metrics.retire_stream(stream_id) {
            complete_cycle(&shared, cycle);
        }
        warn!(target: "echobeats::scheduler", stream = stream_id, "stream retired");
        Ok(())
    }

    fn running_stream(&self, stream_id: usize) -> SchedulerResult<Arc<Stream>> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != SchedulerState::Running {
            return Err(SchedulerError::NotRunning);
        }
        lifecycle
            .streams
            .get(stream_id)
            .cloned()
            .ok_or(SchedulerError::UnknownStream(stream_id))
    }

    /// Execution records retained for one stream, oldest first. Available
    /// while running and after stop.
    pub fn history(&self, stream_id: usize) -> SchedulerResult<Vec<StepExecutionRecord>> {
        let lifecycle = self.lifecycle.lock();
        lifecycle
            .streams
            .get(stream_id)
            .map(|stream| stream.history())
            .ok_or(SchedulerError::UnknownStream(stream_id))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (state, streams) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.state, lifecycle.streams.clone())
        };
        let streams = streams.iter().map(|stream| stream.snapshot()).collect();
        self.metrics.snapshot(state, self.state.metrics(), streams)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(run) = self.lifecycle.get_mut().run.take() {
            run.signal_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::step::default_step_table;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAST: Duration = Duration::from_millis(5);

    fn uniform_steps(n: usize, term: &str) -> Vec<StepDescriptor> {
        (0..n)
            .map(|index| StepDescriptor::new(index, term, Mode::Expressive))
            .collect()
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    #[test]
    fn construction_validates_ratio_and_table() {
        assert_eq!(
            Scheduler::new(12, 5, default_step_table(), FAST).err(),
            Some(SchedulerError::IndivisibleCycle {
                cycle_length: 12,
                stream_count: 5
            })
        );
        assert_eq!(
            Scheduler::new(12, 3, uniform_steps(8, "t"), FAST).err(),
            Some(SchedulerError::StepTableLength {
                expected: 12,
                actual: 8
            })
        );
        assert_eq!(
            Scheduler::new(12, 3, default_step_table(), Duration::ZERO).err(),
            Some(SchedulerError::ZeroPeriod)
        );
    }

    #[test]
    fn start_places_streams_at_phase_offsets() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), Duration::from_secs(30))
            .expect("scheduler");
        assert!(scheduler.snapshot().streams.is_empty());
        scheduler.start().expect("start");
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.state, SchedulerState::Running);
        assert_eq!(snapshot.current_steps(), vec![0, 4, 8]);
        let offsets: Vec<usize> = snapshot.streams.iter().map(|s| s.phase_offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        scheduler.stop(Duration::from_secs(2)).expect("stop");
    }

    #[test]
    fn lifecycle_errors_are_explicit() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), Duration::from_secs(30))
            .expect("scheduler");
        assert_eq!(scheduler.pause(0).unwrap_err(), SchedulerError::NotRunning);
        scheduler.start().expect("start");
        assert_eq!(scheduler.start().unwrap_err(), SchedulerError::AlreadyRunning);
        assert_eq!(
            scheduler
                .register("T1", Mode::Expressive, |_, _, _| Ok(HandlerResult::empty()))
                .unwrap_err(),
            SchedulerError::LateRegistration
        );
        assert_eq!(scheduler.pause(7).unwrap_err(), SchedulerError::UnknownStream(7));
        scheduler.stop(Duration::from_secs(2)).expect("stop");
        scheduler.stop(Duration::from_secs(2)).expect("second stop is a no-op");
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.start().unwrap_err(), SchedulerError::AlreadyStopped);
    }

    #[test]
    fn stop_before_start_is_terminal() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        scheduler.stop(Duration::ZERO).expect("stop");
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.start().unwrap_err(), SchedulerError::AlreadyStopped);
    }

    #[test]
    fn streams_execute_every_step_in_order() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.snapshot().cycle_count >= 3
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        for stream_id in 0..3 {
            let history = scheduler.history(stream_id).expect("history");
            assert!(history.len() >= 24, "stream {stream_id} ran {} steps", history.len());
            let first = history[0].step;
            for (offset, record) in history.iter().enumerate() {
                assert_eq!(record.step, (first + offset) % 12, "stream {stream_id} skipped");
            }
        }
        let snapshot = scheduler.snapshot();
        // A stream can take at most one step past a peer while shutting down.
        let ticks: Vec<u64> = snapshot.streams.iter().map(|stream| stream.ticks).collect();
        let spread =
            ticks.iter().max().copied().unwrap_or(0) - ticks.iter().min().copied().unwrap_or(0);
        assert!(spread <= 1, "streams drifted out of phase: {ticks:?}");
        let executed: u64 = snapshot.streams.iter().map(|stream| stream.ticks).sum();
        assert_eq!(snapshot.total_steps_executed, executed);
        assert_eq!(snapshot.mode_counts.total(), executed);
        assert!(snapshot.group_sync_count.iter().all(|&count| count >= 6));
    }

    #[test]
    fn first_group_release_counts_one_sync() {
        let scheduler =
            Scheduler::new(12, 3, uniform_steps(12, "visit"), Duration::from_millis(40))
                .expect("scheduler");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        scheduler
            .register("visit", Mode::Expressive, move |stream, step, _| {
                log.lock().push((stream, step));
                Ok(HandlerResult::empty())
            })
            .expect("register");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.snapshot().group_sync_count[0] >= 1
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        let seen = seen.lock();
        let first_three: HashSet<(usize, usize)> = seen.iter().take(3).copied().collect();
        assert_eq!(first_three, HashSet::from([(0, 0), (1, 4), (2, 8)]));
    }

    #[test]
    fn failing_handler_does_not_stall_the_stream() {
        let mut steps = uniform_steps(12, "other");
        steps[0] = StepDescriptor::new(0, "termX", Mode::Expressive);
        let scheduler = Scheduler::new(12, 3, steps, FAST).expect("scheduler");
        scheduler
            .register("termX", Mode::Expressive, |_, _, _| anyhow::bail!("always fails"))
            .expect("register");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.snapshot().failed_steps >= 3
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        let history = scheduler.history(0).expect("history");
        let failed = history
            .iter()
            .position(|record| record.step == 0)
            .expect("stream 0 ran step 0");
        assert!(!history[failed].success);
        assert_eq!(history[failed].error.as_deref(), Some("always fails"));
        assert_eq!(history.get(failed + 1).map(|record| record.step), Some(1));
        // The last record may be the step cut short by stop.
        let settled = &history[..history.len() - 1];
        assert!(settled.iter().filter(|record| record.step != 0).all(|record| record.success));
        let snapshot = scheduler.snapshot();
        assert!(snapshot.failures_by_pair.get("termX/E").copied().unwrap_or(0) >= 3);
    }

    #[test]
    fn paused_stream_holds_peers_at_the_next_rendezvous() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.snapshot().total_steps_executed >= 6
        }));
        scheduler.pause(1).expect("pause");
        thread::sleep(Duration::from_millis(60));
        let frozen = scheduler.snapshot();
        thread::sleep(Duration::from_millis(60));
        let later = scheduler.snapshot();
        assert_eq!(frozen.current_steps(), later.current_steps());
        assert_eq!(frozen.total_steps_executed, later.total_steps_executed);
        assert!(later.streams[1].paused);

        scheduler.resume(1).expect("resume");
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.snapshot().total_steps_executed >= later.total_steps_executed + 6
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");
    }

    #[test]
    fn stop_releases_blocked_streams_with_partial_sync() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        scheduler.start().expect("start");
        scheduler.pause(1).expect("pause");
        // Streams 0 and 2 end up parked on the rendezvous stream 1 never reaches.
        assert!(wait_until(Duration::from_secs(5), || {
            let before = scheduler.snapshot().total_steps_executed;
            thread::sleep(Duration::from_millis(30));
            scheduler.snapshot().total_steps_executed == before
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop within grace");

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.state, SchedulerState::Stopped);
        assert!(snapshot.partial_sync_count >= 2);
        assert!(snapshot.streams[0].partial_syncs >= 1);
        assert!(snapshot.streams[2].partial_syncs >= 1);
        assert!(snapshot.streams.iter().all(|stream| !stream.active));
        assert!(snapshot.failed_steps >= 2);
        for stream_id in [0, 2] {
            let cut_short = snapshot.streams[stream_id].last_record.clone().expect("record");
            assert!(!cut_short.success, "stream {stream_id}: {cut_short:?}");
            let error = cut_short.error.unwrap_or_default();
            assert!(error.contains("partial synchronization"), "{error}");
        }
    }

    #[test]
    fn stop_reports_streams_that_outlive_the_grace_period() {
        let scheduler = Scheduler::new(3, 3, uniform_steps(3, "slow"), FAST).expect("scheduler");
        let release = Arc::new(crate::cancel::CancelToken::new());
        let gate = Arc::clone(&release);
        let calls = Arc::new(AtomicUsize::new(0));
        let entered = Arc::clone(&calls);
        scheduler
            .register("slow", Mode::Expressive, move |stream, _, _| {
                entered.fetch_add(1, Ordering::SeqCst);
                if stream == 2 {
                    gate.wait_for(Duration::from_secs(10));
                }
                Ok(HandlerResult::empty())
            })
            .expect("register");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 3));
        let err = scheduler.stop(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, SchedulerError::ShutdownTimeout { streams: vec![2] });
        release.cancel();
        assert!(scheduler.stop(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn retired_stream_lets_survivors_continue() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        scheduler.start().expect("start");
        scheduler.pause(1).expect("pause");
        thread::sleep(Duration::from_millis(40));
        scheduler.retire(1).expect("retire");
        let after_retire = scheduler.snapshot();
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.snapshot().total_steps_executed >= after_retire.total_steps_executed + 12
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        let snapshot = scheduler.snapshot();
        assert!(!snapshot.streams[1].active);
        assert!(snapshot.streams[0].ticks.abs_diff(snapshot.streams[2].ticks) <= 1);
    }

    #[test]
    fn coherence_recomputes_once_per_cycle() {
        let scheduler = Scheduler::new(6, 3, uniform_steps(6, "aware"), FAST).expect("scheduler");
        scheduler
            .register("aware", Mode::Expressive, |stream, step, _| {
                let others = (0..3).filter(move |&other| other != stream);
                Ok(HandlerResult::with_context(json!({ "stream": stream, "step": step }))
                    .perceiving(others))
            })
            .expect("register");
        let state = scheduler.shared_state();
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.snapshot().cycle_count >= 2
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        let snapshot = scheduler.snapshot();
        assert_eq!(state.recomputations(), snapshot.cycle_count);
        // Only a step cut short by stop can fail here.
        assert!(snapshot.coherence.coherence >= 0.8);
        assert!(snapshot.coherence.integration > 0.0);
        assert!(state.context(0).is_some());
    }

    #[test]
    fn first_rendezvous_of_default_table_forms_balanced_integration() {
        let scheduler = Scheduler::new(12, 3, default_step_table(), FAST).expect("scheduler");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        scheduler
            .register_coupling(CouplingKind::BalancedIntegration, move |coupling, _| {
                log.lock().push(coupling.clone());
            })
            .expect("register coupling");
        scheduler.start().expect("start");
        assert_eq!(
            scheduler
                .register_coupling(CouplingKind::PerceptionMemory, |_, _| {})
                .unwrap_err(),
            SchedulerError::LateRegistration
        );
        assert!(wait_until(Duration::from_secs(5), || {
            let snapshot = scheduler.snapshot();
            snapshot.coupling_counts.get(&CouplingKind::BalancedIntegration).copied() >= Some(2)
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");

        let seen = seen.lock();
        assert_eq!(seen[0].group, 0);
        assert_eq!(seen[0].streams, vec![2]);
        let snapshot = scheduler.snapshot();
        assert_eq!(
            snapshot.coupling_counts.get(&CouplingKind::BalancedIntegration).copied(),
            Some(seen.len() as u64)
        );
        // T4E never meets T7R and T1R never meets T2E with offsets 0/4/8.
        assert_eq!(snapshot.coupling_counts.len(), 1);
    }

    #[test]
    fn selective_sync_only_counts_configured_groups() {
        let config = SchedulerConfig {
            step_period_ms: 5,
            sync: SyncPolicy::Groups(vec![0]),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::from_config(&config).expect("scheduler");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(10), || {
            scheduler.snapshot().group_sync_count[0] >= 3
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");
        let snapshot = scheduler.snapshot();
        assert_eq!(&snapshot.group_sync_count[1..], &[0, 0, 0]);
    }

    #[test]
    fn handler_invocations_match_total_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(12, 3, uniform_steps(12, "count"), FAST).expect("scheduler");
        let counter = Arc::clone(&calls);
        scheduler
            .register("count", Mode::Expressive, move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerResult::empty())
            })
            .expect("register");
        scheduler.start().expect("start");
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.snapshot().total_steps_executed >= 30
        }));
        scheduler.stop(Duration::from_secs(2)).expect("stop");
        assert_eq!(
            calls.load(Ordering::SeqCst) as u64,
            scheduler.snapshot().total_steps_executed
        );
    }
}
