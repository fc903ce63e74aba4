//! Client-visible error taxonomy.
//!
//! Every fallible public operation returns [`Error`]. Driver or global-memory
//! failures on paths where the library cannot recover (register cache flush,
//! resume-mode state changes) surface as [`Error::Fatal`]; after a fatal
//! error the process state is unreliable and the client should detach.

use crate::types::{EventId, ProcessId, WaveId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The library has not been initialized.
    #[error("library is not initialized")]
    NotInitialized,

    /// The wave handle is unknown, or the wave exited between calls.
    #[error("invalid wave id {0}")]
    InvalidWaveId(WaveId),

    /// The process handle is unknown.
    #[error("invalid process id {0}")]
    InvalidProcessId(ProcessId),

    /// The event handle is unknown.
    #[error("invalid event id {0}")]
    InvalidEventId(EventId),

    /// A query, resume mode, or exception bit set was not recognized.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A register access used an incompatible size or offset.
    #[error("register size or offset is incompatible with the register")]
    InvalidArgumentCompatibility,

    /// A swizzled transfer used a missing or out-of-range lane id.
    #[error("invalid lane id")]
    InvalidLaneId,

    /// A stop was requested for a wave that is already stopped.
    #[error("{0} is already stopped")]
    WaveStopped(WaveId),

    /// The operation requires the wave to be stopped.
    #[error("{0} is not stopped")]
    WaveNotStopped(WaveId),

    /// A stop request is already outstanding for this wave.
    #[error("{0} already has an outstanding stop request")]
    WaveOutstandingStop(WaveId),

    /// The wave's last stop event has not yet been processed by the client.
    #[error("{0} is not resumable until its stop event is processed")]
    WaveNotResumable(WaveId),

    /// A displaced-stepping wave was resumed with a mode other than
    /// single-step.
    #[error("a displaced-stepping wave can only be resumed by single-stepping")]
    ResumeDisplacedStepping,

    /// The instruction can neither be displaced-stepped nor simulated.
    #[error("instruction cannot be displaced-stepped or simulated")]
    IllegalInstruction,

    /// A memory transfer was entirely out of range.
    #[error("memory access out of range")]
    MemoryAccess,

    /// The queried field is not present (e.g. the wave has no dispatch).
    #[error("requested information is not available")]
    NotAvailable,

    /// A client-supplied callback (e.g. the instruction buffer allocator)
    /// reported failure.
    #[error("client callback failed")]
    ClientCallback,

    /// Unrecoverable driver or memory failure; process state is unreliable.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Build an [`Error::Fatal`] with a formatted message.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::Error::Fatal(format!($($arg)*))
    };
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_handle() {
        let err = Error::WaveStopped(WaveId(3));
        assert!(err.to_string().contains("wave_3"));
    }

    #[test]
    fn fatal_macro_formats() {
        let err = fatal!("could not write the '{}' register", "pc");
        assert!(matches!(err, Error::Fatal(_)));
        assert!(err.to_string().contains("'pc'"));
    }
}
