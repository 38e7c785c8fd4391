//! Tensional couplings between the `(term, mode)` pairs that streams hold at
//! the same rendezvous.

use crate::state::SharedState;
use crate::step::{Mode, StepDescriptor, terms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingKind {
    /// T4E with T7R: memory-guided perception.
    PerceptionMemory,
    /// T1R with T2E: simulation-based planning.
    AssessmentPlanning,
    /// T8E on any stream.
    BalancedIntegration,
}

impl CouplingKind {
    pub const ALL: [CouplingKind; 3] = [
        CouplingKind::PerceptionMemory,
        CouplingKind::AssessmentPlanning,
        CouplingKind::BalancedIntegration,
    ];

    /// Pairs that must all be held by some participant for the coupling to fire.
    pub fn requires(self) -> &'static [(&'static str, Mode)] {
        match self {
            CouplingKind::PerceptionMemory => &[
                (terms::SENSORY_INPUT, Mode::Expressive),
                (terms::MEMORY_ENCODING, Mode::Reflective),
            ],
            CouplingKind::AssessmentPlanning => &[
                (terms::PERCEPTION, Mode::Reflective),
                (terms::IDEA_FORMATION, Mode::Expressive),
            ],
            CouplingKind::BalancedIntegration => &[(terms::BALANCED_RESPONSE, Mode::Expressive)],
        }
    }

    pub fn strength(self) -> f64 {
        match self {
            CouplingKind::PerceptionMemory => 0.8,
            CouplingKind::AssessmentPlanning => 0.7,
            CouplingKind::BalancedIntegration => 0.9,
        }
    }
}

impl fmt::Display for CouplingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CouplingKind::PerceptionMemory => "perception_memory",
            CouplingKind::AssessmentPlanning => "assessment_planning",
            CouplingKind::BalancedIntegration => "balanced_integration",
        };
        f.write_str(name)
    }
}

/// One coupling observed at a group release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coupling {
    pub kind: CouplingKind,
    pub strength: f64,
    pub group: usize,
    /// Streams holding one of the required pairs, ascending.
    pub streams: Vec<usize>,
}

/// Couplings formed by the steps released together at `group`.
/// `participants` is `(stream_id, descriptor)` for every released stream.
pub fn detect_couplings(group: usize, participants: &[(usize, &StepDescriptor)]) -> Vec<Coupling> {
    let holds = |term: &str, mode: Mode| -> Vec<usize> {
        participants
            .iter()
            .filter(|(_, step)| step.term.as_str() == term && step.mode == mode)
            .map(|(stream, _)| *stream)
            .collect()
    };
    CouplingKind::ALL
        .iter()
        .filter_map(|&kind| {
            let mut streams = Vec::new();
            for &(term, mode) in kind.requires() {
                let holders = holds(term, mode);
                if holders.is_empty() {
                    return None;
                }
                streams.extend(holders);
            }
            streams.sort_unstable();
            streams.dedup();
            Some(Coupling {
                kind,
                strength: kind.strength(),
                group,
                streams,
            })
        })
        .collect()
}

pub trait CouplingHandler: Send + Sync {
    fn on_coupling(&self, coupling: &Coupling, state: &SharedState);
}

impl<F> CouplingHandler for F
where
    F: Fn(&Coupling, &SharedState) + Send + Sync,
{
    fn on_coupling(&self, coupling: &Coupling, state: &SharedState) {
        self(coupling, state)
    }
}

#[derive(Default)]
pub struct CouplingRegistry {
    handlers: HashMap<CouplingKind, Vec<Arc<dyn CouplingHandler>>>,
}

impl CouplingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: CouplingKind, handler: Arc<dyn CouplingHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: CouplingKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Runs the handlers for `coupling.kind`. A panicking handler is logged
    /// and does not stop the others.
    pub fn fire(&self, coupling: &Coupling, state: &SharedState) {
        let Some(handlers) = self.handlers.get(&coupling.kind) else {
            return;
        };
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_coupling(coupling, state)));
            if outcome.is_err() {
                warn!(
                    target: "echobeats::coupling",
                    kind = %coupling.kind,
                    group = coupling.group,
                    "coupling handler panicked"
                );
            }
        }
        debug!(
            target: "echobeats::coupling",
            kind = %coupling.kind,
            group = coupling.group,
            streams = ?coupling.streams,
            handlers = handlers.len(),
            "coupling handled"
        );
    }
}
