use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// A parameter is out of range (zero interval, interval below the
    /// supported minimum, and so on).
    #[error("invalid timer parameter")]
    InvalidParameter,

    /// The timer is already running.
    #[error("timer is already active")]
    TimerActive,

    /// The timer is not running.
    #[error("timer is suspended")]
    TimerSuspended,

    /// A sub-timer is still winding down from a previous stop; try again.
    #[error("timer is busy")]
    TimerBusy,

    /// The requested CPU does not exist or could not be reached.
    #[error("CPU not found")]
    CpuNotFound,

    /// The requested mode is recognized but not implemented (one-shot
    /// all-CPU timers).
    #[error("not implemented")]
    NotImplemented,

    /// The operation is not supported in the timer's current mode.
    #[error("not supported")]
    NotSupported,

    /// A sub-timer was observed in a state the operation cannot legally
    /// meet. Indicates misuse or an internal fault.
    #[error("unexpected internal timer state")]
    InternalState,
}

pub type Result<T> = std::result::Result<T, TimerError>;
