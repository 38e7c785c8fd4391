use anyhow::{Result, anyhow};
use echobeats::{
    HandlerResult, MetricsSnapshot, Mode, Scheduler, SchedulerConfig, SharedState, TermId,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

const BUDGET_POLL: Duration = Duration::from_millis(100);

pub struct NodeRuntime {
    config: SchedulerConfig,
    scheduler: Scheduler,
}

impl NodeRuntime {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let scheduler = Scheduler::from_config(&config)?;
        register_awareness(&scheduler)?;
        Ok(Self {
            config,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs until ctrl-c, or until `max_cycles` full cycles completed when
    /// given, then stops the scheduler and returns its final snapshot.
    pub fn run_until_shutdown(self, max_cycles: Option<u64>) -> Result<MetricsSnapshot> {
        self.scheduler.start()?;
        info!(
            target: "echobeats::node",
            streams = self.config.stream_count,
            cycle_length = self.config.cycle_length,
            step_period_ms = self.config.step_period_ms,
            max_cycles = ?max_cycles,
            "node runtime started"
        );
        let waited = wait_for_shutdown(&self.scheduler, max_cycles);
        if let Err(err) = self.scheduler.shutdown() {
            warn!(
                target: "echobeats::node",
                error = %err,
                "scheduler did not stop cleanly"
            );
        }
        waited?;
        Ok(self.scheduler.snapshot())
    }
}

/// Publishes each stream's position into the shared state and marks every
/// other stream that has published as perceived.
fn awareness_handler(
    stream_id: usize,
    step_index: usize,
    term: &TermId,
    mode: Mode,
    state: &SharedState,
) -> Result<HandlerResult> {
    let perceived: BTreeSet<usize> = (0..state.stream_count())
        .filter(|&other| other != stream_id && state.context(other).is_some())
        .collect();
    Ok(HandlerResult::with_context(json!({
        "stream": stream_id,
        "step": step_index,
        "term": term.as_str(),
        "mode": mode.short(),
        "aware_of": perceived,
    }))
    .perceiving(perceived))
}

fn register_awareness(scheduler: &Scheduler) -> Result<()> {
    let pairs: BTreeSet<(TermId, Mode)> = scheduler
        .step_table()
        .iter()
        .map(|step| (step.term.clone(), step.mode))
        .collect();
    for (term, mode) in pairs {
        let label = term.clone();
        scheduler.register(term, mode, move |stream_id, step_index, state| {
            awareness_handler(stream_id, step_index, &label, mode, state)
        })?;
    }
    Ok(())
}

fn wait_for_shutdown(scheduler: &Scheduler, max_cycles: Option<u64>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| anyhow!("build shutdown runtime: {err}"))?;
    runtime.block_on(async {
        let mut poll = tokio::time::interval(BUDGET_POLL);
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|err| anyhow!("shutdown signal error: {err}"))?;
                    info!(target: "echobeats::node", "shutdown signal received");
                    return Ok::<_, anyhow::Error>(());
                }
                _ = poll.tick() => {
                    if let Some(budget) = max_cycles {
                        let cycles = scheduler.snapshot().cycle_count;
                        if cycles >= budget {
                            info!(target: "echobeats::node", cycles, "cycle budget reached");
                            return Ok(());
                        }
                    }
                }
            }
        }
    })
}
