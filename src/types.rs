//! Core handle and value types shared across the crate.
//!
//! Every entity a client can refer to (wave, queue, agent, process, event,
//! watchpoint, displaced stepping) is addressed by an opaque `u64` handle.
//! Handles are allocated monotonically and are never reused for the lifetime
//! of the library, so a stale handle reliably fails lookup instead of
//! silently aliasing a new object.

use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Address in the process' global (virtual) address space.
pub type GlobalAddress = u64;

/// Address within one of the wave-relative segment address spaces.
pub type SegmentAddress = u64;

/// Lane index within a wave (0..lane_count).
pub type LaneId = u32;

/// OS-level watchpoint slot number, assigned by the driver.
pub type OsWatchId = u32;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(pub u64);

        impl $name {
            /// Allocate the next handle. Monotonic, never reused.
            pub(crate) fn allocate() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                $name(NEXT.fetch_add(1, Ordering::Relaxed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Handle for a wave. Stable for the wave's lifetime.
    WaveId,
    "wave"
);
handle_type!(
    /// Handle for a hardware queue.
    QueueId,
    "queue"
);
handle_type!(
    /// Handle for an agent (GPU device).
    AgentId,
    "agent"
);
handle_type!(
    /// Handle for a debugged process.
    ProcessId,
    "process"
);
handle_type!(
    /// Handle for a kernel dispatch.
    DispatchId,
    "dispatch"
);
handle_type!(
    /// Handle for an architecture descriptor.
    ArchitectureId,
    "arch"
);
handle_type!(
    /// Handle for an event raised by the library.
    EventId,
    "event"
);
handle_type!(
    /// Handle for a data watchpoint.
    WatchpointId,
    "watchpoint"
);
handle_type!(
    /// Handle for a displaced-stepping buffer.
    DisplacedSteppingId,
    "displaced_stepping"
);

/// Execution state of a wave as driven by the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveState {
    /// The wave is executing normally.
    Run,
    /// The wave executes one instruction, then stops.
    SingleStep,
    /// The wave is halted and its context is inspectable.
    Stop,
}

impl fmt::Display for WaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveState::Run => write!(f, "RUN"),
            WaveState::SingleStep => write!(f, "SINGLE_STEP"),
            WaveState::Stop => write!(f, "STOP"),
        }
    }
}

/// Whether a wave is reported to the client.
///
/// Hidden waves still exist in hardware but never appear in wave lists and
/// never raise events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Reported to the client.
    Visible,
    /// Halted at launch, not yet associated with a dispatch.
    HiddenHaltedAtLaunch,
    /// Released at an immutable terminating instruction; the hardware will
    /// retire the wave and it is never reported again.
    HiddenAtTerminatingInstruction,
}

/// How a stopped wave should be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Resume normal execution.
    Normal,
    /// Execute a single instruction, then stop again.
    SingleStep,
}

bitflags! {
    /// Reasons a wave is stopped. Several bits may combine (e.g. a single
    /// step that also tripped a watchpoint).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StopReasons: u32 {
        const SINGLE_STEP        = 1 << 0;
        const BREAKPOINT         = 1 << 1;
        const MEMORY_VIOLATION   = 1 << 2;
        const MATH_ERROR         = 1 << 3;
        const ILLEGAL_INSTRUCTION = 1 << 4;
        const APERTURE_VIOLATION = 1 << 5;
        const TRAP               = 1 << 6;
        const WATCHPOINT         = 1 << 7;
    }
}

bitflags! {
    /// Exceptions a client can deliver to a wave when resuming it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Exceptions: u32 {
        const ABORT               = 1 << 0;
        const TRAP                = 1 << 1;
        const MATH_ERROR          = 1 << 2;
        const ILLEGAL_INSTRUCTION = 1 << 3;
        const MEMORY_VIOLATION    = 1 << 4;
        const APERTURE_VIOLATION  = 1 << 5;
    }
}

bitflags! {
    /// Exception mask understood by the OS driver.
    ///
    /// Queue-scoped bits are delivered to the queue's exception handler;
    /// `DEVICE_MEMORY_VIOLATION` is an agent-scoped bit that rides along
    /// with a queue memory violation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OsExceptionMask: u32 {
        const QUEUE_WAVE_ABORT               = 1 << 0;
        const QUEUE_WAVE_TRAP                = 1 << 1;
        const QUEUE_WAVE_MATH_ERROR          = 1 << 2;
        const QUEUE_WAVE_ILLEGAL_INSTRUCTION = 1 << 3;
        const QUEUE_WAVE_MEMORY_VIOLATION    = 1 << 4;
        const QUEUE_WAVE_APERTURE_VIOLATION  = 1 << 5;
        const DEVICE_MEMORY_VIOLATION        = 1 << 8;
    }
}

impl OsExceptionMask {
    /// All queue-scoped exception bits.
    pub const QUEUE_MASK: OsExceptionMask = OsExceptionMask::QUEUE_WAVE_ABORT
        .union(OsExceptionMask::QUEUE_WAVE_TRAP)
        .union(OsExceptionMask::QUEUE_WAVE_MATH_ERROR)
        .union(OsExceptionMask::QUEUE_WAVE_ILLEGAL_INSTRUCTION)
        .union(OsExceptionMask::QUEUE_WAVE_MEMORY_VIOLATION)
        .union(OsExceptionMask::QUEUE_WAVE_APERTURE_VIOLATION);
}

/// Segment address spaces a wave can transfer memory in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceKind {
    /// The process' flat virtual address space.
    Global,
    /// Per-workgroup local data share, stored in the context save area.
    Local,
    /// Per-lane scratch with dword-interleaved (swizzled) layout.
    PrivateSwizzled,
    /// Flat per-wave scratch.
    PrivateUnswizzled,
}

/// An address space descriptor: a kind plus the declared width of its
/// segment addresses. Segment addresses are zero-extended to `address_bits`
/// before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub kind: AddressSpaceKind,
    pub address_bits: u32,
}

impl AddressSpace {
    pub const fn new(kind: AddressSpaceKind, address_bits: u32) -> Self {
        Self { kind, address_bits }
    }

    /// Zero-extend (truncate) a segment address to this space's width.
    pub fn extend(&self, segment_address: SegmentAddress) -> SegmentAddress {
        if self.address_bits >= 64 {
            segment_address
        } else {
            segment_address & ((1u64 << self.address_bits) - 1)
        }
    }
}

/// Queries answered by `wave_get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveInfo {
    State,
    StopReason,
    Dispatch,
    Queue,
    Agent,
    Process,
    Architecture,
    Pc,
    ExecMask,
    WorkGroupCoord,
    WaveNumberInWorkGroup,
    Watchpoints,
    LaneCount,
}

/// Typed answers for `wave_get_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveInfoValue {
    State(WaveState),
    StopReason(StopReasons),
    Dispatch(DispatchId),
    Queue(QueueId),
    Agent(AgentId),
    Process(ProcessId),
    Architecture(ArchitectureId),
    Pc(GlobalAddress),
    ExecMask(u64),
    WorkGroupCoord([u32; 3]),
    WaveNumberInWorkGroup(u32),
    Watchpoints(Vec<WatchpointId>),
    LaneCount(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_monotonic() {
        let a = WaveId::allocate();
        let b = WaveId::allocate();
        assert!(b.0 > a.0);
        assert_ne!(a, b);
    }

    #[test]
    fn handle_display_uses_prefix() {
        let id = QueueId(7);
        assert_eq!(id.to_string(), "queue_7");
    }

    #[test]
    fn address_space_zero_extends() {
        let space = AddressSpace::new(AddressSpaceKind::Local, 32);
        assert_eq!(space.extend(0x1_0000_0004), 0x4);

        let flat = AddressSpace::new(AddressSpaceKind::Global, 64);
        assert_eq!(flat.extend(u64::MAX), u64::MAX);
    }

    #[test]
    fn queue_mask_covers_all_queue_bits() {
        assert!(OsExceptionMask::QUEUE_MASK.contains(OsExceptionMask::QUEUE_WAVE_ABORT));
        assert!(OsExceptionMask::QUEUE_MASK.contains(OsExceptionMask::QUEUE_WAVE_APERTURE_VIOLATION));
        assert!(!OsExceptionMask::QUEUE_MASK.contains(OsExceptionMask::DEVICE_MEMORY_VIOLATION));
    }
}
