//! Static step descriptors for the N-step cycle.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque category label attached to a step; half of the handler dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermId(String);

impl TermId {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TermId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TermId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Terms of the built-in twelve-step table.
pub mod terms {
    pub const PERCEPTION: &str = "T1_Perception";
    pub const IDEA_FORMATION: &str = "T2_IdeaFormation";
    pub const SENSORY_INPUT: &str = "T4_SensoryInput";
    pub const ACTION_SEQUENCE: &str = "T5_ActionSequence";
    pub const MEMORY_ENCODING: &str = "T7_MemoryEncoding";
    pub const BALANCED_RESPONSE: &str = "T8_BalancedResponse";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Expressive,
    Reflective,
    RelevanceRealization,
    MetaCognitive,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::Expressive,
        Mode::Reflective,
        Mode::RelevanceRealization,
        Mode::MetaCognitive,
    ];

    pub fn index(self) -> usize {
        match self {
            Mode::Expressive => 0,
            Mode::Reflective => 1,
            Mode::RelevanceRealization => 2,
            Mode::MetaCognitive => 3,
        }
    }

    pub fn short(self) -> &'static str {
        match self {
            Mode::Expressive => "E",
            Mode::Reflective => "R",
            Mode::RelevanceRealization => "RR",
            Mode::MetaCognitive => "MC",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub index: usize,
    pub term: TermId,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StepDescriptor {
    pub fn new(index: usize, term: impl Into<TermId>, mode: Mode) -> Self {
        Self {
            index,
            term: term.into(),
            mode,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Dense, immutable lookup from cycle index to descriptor.
#[derive(Debug, Clone)]
pub struct StepTable {
    steps: Vec<StepDescriptor>,
}

impl StepTable {
    /// Builds the table, accepting descriptors in any order as long as they
    /// cover `0..cycle_length` exactly once.
    pub fn new(cycle_length: usize, steps: Vec<StepDescriptor>) -> SchedulerResult<Self> {
        if steps.len() != cycle_length {
            return Err(SchedulerError::StepTableLength {
                expected: cycle_length,
                actual: steps.len(),
            });
        }
        let mut slots: Vec<Option<StepDescriptor>> = vec![None; cycle_length];
        for step in steps {
            // Out-of-range with a correct length leaves a gap reported below.
            let Some(slot) = slots.get_mut(step.index) else {
                continue;
            };
            if slot.is_some() {
                return Err(SchedulerError::DuplicateStepIndex(step.index));
            }
            *slot = Some(step);
        }
        let mut ordered = Vec::with_capacity(cycle_length);
        for (index, slot) in slots.into_iter().enumerate() {
            ordered.push(slot.ok_or(SchedulerError::StepIndexGap(index))?);
        }
        Ok(Self { steps: ordered })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Constant-time lookup. `step_index` is reduced modulo the cycle length.
    pub fn descriptor_for(&self, step_index: usize) -> &StepDescriptor {
        &self.steps[step_index % self.steps.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.iter()
    }
}

/// The twelve-step EchoBeats matrix used when no table is configured.
pub fn default_step_table() -> Vec<StepDescriptor> {
    use terms::*;
    let rows: [(&str, Mode, &str); 12] = [
        (SENSORY_INPUT, Mode::Expressive, "Perception & Attention"),
        (PERCEPTION, Mode::Reflective, "Memory Activation"),
        (IDEA_FORMATION, Mode::Expressive, "Action Generation"),
        (MEMORY_ENCODING, Mode::Reflective, "Action Execution"),
        (SENSORY_INPUT, Mode::Expressive, "Relevance Realization (Present)"),
        (PERCEPTION, Mode::Reflective, "Scenario Simulation"),
        (IDEA_FORMATION, Mode::Expressive, "Outcome Evaluation"),
        (ACTION_SEQUENCE, Mode::Expressive, "Model Update"),
        (BALANCED_RESPONSE, Mode::Expressive, "Learning Consolidation"),
        (BALANCED_RESPONSE, Mode::Expressive, "Insight Generation"),
        (MEMORY_ENCODING, Mode::Reflective, "Relevance Realization (Future)"),
        (ACTION_SEQUENCE, Mode::Expressive, "Meta-Cognitive Reflection"),
    ];
    rows.iter()
        .enumerate()
        .map(|(index, (term, mode, label))| {
            StepDescriptor::new(index, *term, *mode).with_label(*label)
        })
        .collect()
}

/// Synchronization group of a step: `step mod (N / S)`.
pub fn sync_group(step_index: usize, group_count: usize) -> usize {
    step_index % group_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(n: usize) -> Vec<StepDescriptor> {
        (0..n)
            .map(|index| StepDescriptor::new(index, "t", Mode::Expressive))
            .collect()
    }

    #[test]
    fn default_table_is_dense() {
        let table = StepTable::new(12, default_step_table()).expect("default table");
        assert_eq!(table.len(), 12);
        for (index, step) in table.iter().enumerate() {
            assert_eq!(step.index, index);
        }
        assert_eq!(table.descriptor_for(0).term.as_str(), terms::SENSORY_INPUT);
        assert_eq!(table.descriptor_for(7).term.as_str(), terms::ACTION_SEQUENCE);
        assert_eq!(table.descriptor_for(10).mode, Mode::Reflective);
    }

    #[test]
    fn accepts_unordered_descriptors() {
        let mut steps = uniform(4);
        steps.reverse();
        let table = StepTable::new(4, steps).expect("table");
        assert_eq!(table.descriptor_for(2).index, 2);
        assert_eq!(table.descriptor_for(6).index, 2);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = StepTable::new(12, uniform(11)).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::StepTableLength {
                expected: 12,
                actual: 11
            }
        );
    }

    #[test]
    fn rejects_duplicates_and_gaps() {
        let mut steps = uniform(4);
        steps[3].index = 1;
        assert_eq!(
            StepTable::new(4, steps).unwrap_err(),
            SchedulerError::DuplicateStepIndex(1)
        );

        let mut steps = uniform(4);
        steps[3].index = 9;
        assert_eq!(
            StepTable::new(4, steps).unwrap_err(),
            SchedulerError::StepIndexGap(3)
        );
    }

    #[test]
    fn sync_groups_follow_modulus() {
        let groups: Vec<usize> = (0..12).map(|step| sync_group(step, 4)).collect();
        assert_eq!(groups, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
