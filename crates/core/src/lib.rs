pub mod barrier;
pub mod cancel;
pub mod config;
pub mod coupling;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod step;
pub mod stream;

pub use config::{LoggingConfig, SchedulerConfig, SyncPolicy};
pub use coupling::{Coupling, CouplingKind};
pub use error::{SchedulerError, SchedulerResult};
pub use metrics::{MetricsSnapshot, ModeCounts, SchedulerState};
pub use registry::{HandlerRegistry, HandlerResult, StepHandler};
pub use scheduler::Scheduler;
pub use state::{CoherenceMetrics, CoherenceModel, SharedState};
pub use step::{Mode, StepDescriptor, StepTable, TermId, default_step_table};
pub use stream::{StepExecutionRecord, StreamSnapshot};
