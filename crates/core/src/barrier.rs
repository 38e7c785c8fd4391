//! Repeating, group-keyed rendezvous for phase-offset streams.
//!
//! Every stream visits a sync group at the same logical tick (its step count
//! since start), even though the absolute step index differs by the stream's
//! phase offset. Each `(group, tick)` pair is an independent instance that
//! moves `Empty -> AwaitingArrivals -> Released -> Empty`, so a stream that
//! laps the cycle can never satisfy readiness for a slower peer's earlier visit.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error(
        "partial synchronization at group {group} step {step}: streams {missing:?} never arrived"
    )]
    PartialSync {
        group: usize,
        step: usize,
        missing: Vec<usize>,
    },
    #[error("barrier for group {group} is closed")]
    Closed { group: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Empty,
    AwaitingArrivals,
    Released,
}

/// Successful rendezvous. Exactly one arrival per instance is the leader: the
/// one whose arrival completed the set. Only the leader sees `participants`,
/// the `(stream_id, step_index)` of every stream released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub leader: bool,
    pub participants: Vec<(usize, usize)>,
}

#[derive(Debug)]
enum InstanceState {
    AwaitingArrivals,
    Released,
    Partial { missing: Vec<usize> },
}

#[derive(Debug)]
struct Instance {
    readiness: Vec<Option<usize>>,
    state: InstanceState,
    waiters: usize,
}

impl Instance {
    fn new(streams: usize) -> Self {
        Self {
            readiness: vec![None; streams],
            state: InstanceState::AwaitingArrivals,
            waiters: 0,
        }
    }

    fn complete(&self, live: &[bool]) -> bool {
        live.iter()
            .zip(&self.readiness)
            .all(|(&alive, ready)| !alive || ready.is_some())
    }

    fn participants(&self) -> Vec<(usize, usize)> {
        self.readiness
            .iter()
            .enumerate()
            .filter_map(|(stream, step)| step.map(|step| (stream, step)))
            .collect()
    }

    fn missing(&self, live: &[bool]) -> Vec<usize> {
        live.iter()
            .zip(&self.readiness)
            .enumerate()
            .filter(|(_, (&alive, ready))| alive && ready.is_none())
            .map(|(stream, _)| stream)
            .collect()
    }
}

#[derive(Debug)]
struct BarrierState {
    live: Vec<bool>,
    instances: HashMap<u64, Instance>,
    closed: bool,
    partial_through: Option<u64>,
    releases: u64,
    partial_releases: u64,
}

#[derive(Debug)]
pub struct TriadBarrier {
    group: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl TriadBarrier {
    pub fn new(group: usize, streams: usize) -> Self {
        Self {
            group,
            state: Mutex::new(BarrierState {
                live: vec![true; streams],
                instances: HashMap::new(),
                closed: false,
                partial_through: None,
                releases: 0,
                partial_releases: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Records that `stream_id` reached `step_index` at logical `tick` and
    /// blocks until every live stream has arrived for the same tick.
    ///
    /// Returns `PartialSync` if a peer departed or the barrier closed while
    /// this instance was still waiting, or if the instance was already given
    /// up on before this stream got here.
    pub fn arrive(
        &self,
        tick: u64,
        step_index: usize,
        stream_id: usize,
    ) -> Result<Arrival, BarrierError> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(BarrierError::Closed { group: self.group });
        }
        let state = &mut *guard;
        if !state.live.get(stream_id).copied().unwrap_or(false) {
            return Err(BarrierError::Closed { group: self.group });
        }
        if !state.instances.contains_key(&tick)
            && state.partial_through.is_some_and(|through| tick <= through)
        {
            return Err(BarrierError::PartialSync {
                group: self.group,
                step: step_index,
                missing: Vec::new(),
            });
        }
        let streams = state.live.len();
        let instance = state
            .instances
            .entry(tick)
            .or_insert_with(|| Instance::new(streams));
        if let Some(slot) = instance.readiness.get_mut(stream_id) {
            *slot = Some(step_index);
        }
        if instance.complete(&state.live) {
            let participants = instance.participants();
            if instance.waiters == 0 {
                state.instances.remove(&tick);
            } else {
                instance.state = InstanceState::Released;
                instance.readiness.iter_mut().for_each(|slot| *slot = None);
            }
            state.releases += 1;
            debug!(
                target: "echobeats::barrier",
                group = self.group,
                tick,
                step = step_index,
                leader = stream_id,
                "sync group released"
            );
            self.cvar.notify_all();
            return Ok(Arrival {
                leader: true,
                participants,
            });
        }
        instance.waiters += 1;

        loop {
            self.cvar.wait(&mut guard);
            let state = &mut *guard;
            let Some(instance) = state.instances.get_mut(&tick) else {
                // Instances are only removed once their last waiter leaves.
                return Err(BarrierError::Closed { group: self.group });
            };
            let outcome = match &instance.state {
                InstanceState::AwaitingArrivals => continue,
                InstanceState::Released => Ok(Arrival {
                    leader: false,
                    participants: Vec::new(),
                }),
                InstanceState::Partial { missing } => Err(BarrierError::PartialSync {
                    group: self.group,
                    step: step_index,
                    missing: missing.clone(),
                }),
            };
            instance.waiters -= 1;
            if instance.waiters == 0 {
                state.instances.remove(&tick);
            }
            return outcome;
        }
    }

    /// Removes a stream from future rendezvous and gives up on every instance
    /// currently waiting, waking its waiters with `PartialSync`.
    pub fn depart(&self, stream_id: usize) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(alive) = state.live.get_mut(stream_id) else {
            return;
        };
        if !*alive {
            return;
        }
        // Missing lists are computed with the departing stream still counted.
        let live_before = state.live.clone();
        state.live[stream_id] = false;
        self.abandon_waiting(state, &live_before);
    }

    /// Gives up on every waiting instance and rejects all future arrivals.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;
        let live = state.live.clone();
        self.abandon_waiting(state, &live);
    }

    fn abandon_waiting(&self, state: &mut BarrierState, live: &[bool]) {
        let mut abandoned = 0u64;
        let mut highest = state.partial_through;
        for (&tick, instance) in state.instances.iter_mut() {
            if !matches!(instance.state, InstanceState::AwaitingArrivals) {
                continue;
            }
            let missing = instance.missing(live);
            debug!(
                target: "echobeats::barrier",
                group = self.group,
                tick,
                missing = ?missing,
                "sync group abandoned"
            );
            instance.state = InstanceState::Partial { missing };
            abandoned += 1;
            highest = Some(highest.map_or(tick, |through| through.max(tick)));
        }
        state.instances.retain(|_, instance| instance.waiters > 0);
        state.partial_through = highest;
        state.partial_releases += abandoned;
        if abandoned > 0 {
            self.cvar.notify_all();
        }
    }

    pub fn phase(&self, tick: u64) -> BarrierPhase {
        let state = self.state.lock();
        match state.instances.get(&tick).map(|instance| &instance.state) {
            None => BarrierPhase::Empty,
            Some(InstanceState::AwaitingArrivals) => BarrierPhase::AwaitingArrivals,
            Some(InstanceState::Released) | Some(InstanceState::Partial { .. }) => {
                BarrierPhase::Released
            }
        }
    }

    /// Streams that have arrived at `tick` and are still waiting for peers.
    pub fn arrived(&self, tick: u64) -> Vec<usize> {
        let state = self.state.lock();
        state
            .instances
            .get(&tick)
            .map(|instance| {
                instance
                    .readiness
                    .iter()
                    .enumerate()
                    .filter_map(|(stream, ready)| ready.map(|_| stream))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn waiting(&self) -> usize {
        let state = self.state.lock();
        state.instances.values().map(|instance| instance.waiters).sum()
    }

    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }

    pub fn partial_releases(&self) -> u64 {
        self.state.lock().partial_releases
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
