use thiserror::Error;

/// Errors surfaced synchronously by scheduler construction and lifecycle calls.
///
/// Handler failures and barrier partial-synchronization events never show up
/// here; they are recorded per step and aggregated into metrics instead.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("stream_count must be > 0")]
    InvalidStreamCount,
    #[error("cycle_length must be > 0")]
    ZeroCycleLength,
    #[error("cycle_length {cycle_length} is not divisible by stream_count {stream_count}")]
    IndivisibleCycle {
        cycle_length: usize,
        stream_count: usize,
    },
    #[error("step table has {actual} descriptors, expected {expected}")]
    StepTableLength { expected: usize, actual: usize },
    #[error("step table is missing index {0}")]
    StepIndexGap(usize),
    #[error("step table contains index {0} more than once")]
    DuplicateStepIndex(usize),
    #[error("sync group {group} is out of range (0..{group_count})")]
    UnknownSyncGroup { group: usize, group_count: usize },
    #[error("step_period must be > 0")]
    ZeroPeriod,
    #[error("history_capacity must be > 0")]
    ZeroHistoryCapacity,
    #[error("handlers must be registered before start")]
    LateRegistration,
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler has been stopped and cannot be restarted")]
    AlreadyStopped,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("unknown stream {0}")]
    UnknownStream(usize),
    #[error("failed to spawn runner for stream {stream}: {message}")]
    Spawn { stream: usize, message: String },
    #[error("streams {streams:?} did not exit within the grace period and were force-terminated")]
    ShutdownTimeout { streams: Vec<usize> },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
