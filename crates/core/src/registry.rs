//! `(term, mode)` keyed handler dispatch.

use crate::state::SharedState;
use crate::step::{Mode, TermId};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// What a handler hands back to its stream after one step.
///
/// `context` replaces the stream's published context in [`SharedState`];
/// `perceived` lists the streams whose latest context the handler observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    pub context: Option<Value>,
    pub perceived: Vec<usize>,
    pub note: Option<String>,
}

impl HandlerResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_context(context: Value) -> Self {
        Self {
            context: Some(context),
            ..Self::default()
        }
    }

    pub fn perceiving(mut self, streams: impl IntoIterator<Item = usize>) -> Self {
        self.perceived.extend(streams);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Work attached to a step descriptor.
///
/// Handlers run on their stream's own thread with no scheduler lock held and
/// must not keep references to scheduler internals past the call.
pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        stream_id: usize,
        step_index: usize,
        state: &SharedState,
    ) -> anyhow::Result<HandlerResult>;
}

impl<F> StepHandler for F
where
    F: Fn(usize, usize, &SharedState) -> anyhow::Result<HandlerResult> + Send + Sync,
{
    fn handle(
        &self,
        stream_id: usize,
        step_index: usize,
        state: &SharedState,
    ) -> anyhow::Result<HandlerResult> {
        self(stream_id, step_index, state)
    }
}

pub type Handler = Arc<dyn StepHandler>;

/// Outcome of dispatching one step.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub results: Vec<HandlerResult>,
    pub handlers_run: usize,
    pub error: Option<String>,
}

impl Dispatch {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TermId, HashMap<Mode, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler; several handlers per pair run in registration order.
    pub fn register<F>(&mut self, term: TermId, mode: Mode, handler: F)
    where
        F: Fn(usize, usize, &SharedState) -> anyhow::Result<HandlerResult> + Send + Sync + 'static,
    {
        self.register_shared(term, mode, Arc::new(handler));
    }

    pub fn register_shared(&mut self, term: TermId, mode: Mode, handler: Handler) {
        self.handlers
            .entry(term)
            .or_default()
            .entry(mode)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, term: &TermId, mode: Mode) -> usize {
        self.handlers
            .get(term)
            .and_then(|modes| modes.get(&mode))
            .map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler for `(term, mode)` even after one fails; the first
    /// error (or panic) is kept and later ones are dropped.
    pub fn dispatch(
        &self,
        term: &TermId,
        mode: Mode,
        stream_id: usize,
        step_index: usize,
        state: &SharedState,
    ) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some(handlers) = self.handlers.get(term).and_then(|modes| modes.get(&mode)) else {
            return dispatch;
        };
        for handler in handlers {
            dispatch.handlers_run += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.handle(stream_id, step_index, state)
            }));
            let failure = match outcome {
                Ok(Ok(result)) => {
                    dispatch.results.push(result);
                    None
                }
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(format!("handler panicked: {}", panic_message(&panic))),
            };
            if let Some(message) = failure {
                dispatch.error.get_or_insert(message);
            }
        }
        dispatch
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
