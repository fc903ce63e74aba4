//! Register numbering for context-saved wave state.
//!
//! The debugger addresses architected registers through [`Regnum`]. Hardware
//! registers (pc, exec, status, ...) and trap-temporary registers occupy
//! fixed slots in the context save record and form one contiguous window
//! that the register cache covers; scalar and vector registers live in
//! separate variable-sized blocks.
//!
//! # Cached window
//!
//! ```text
//! [ hwreg slots: 16 x 4 bytes ][ ttmp slots: 16 x 4 bytes ]
//!   ^ FIRST_CACHED (pc lo)                       ^ LAST_CACHED (ttmp15)
//! ```
//!
//! Aliased registers (`WaveId`, `DispatchGrid`, `WaveInGroup`) resolve to
//! ttmp storage but are distinct regnums: the ttmp privilege gate applies
//! only to `Regnum::Ttmp(_)` accesses, which is what lets the library
//! maintain its own bookkeeping in ttmp space on behalf of the trap handler.

use std::fmt;

/// Number of 4-byte hardware register slots in a context save record.
pub const HWREG_COUNT: usize = 16;

/// Number of trap-temporary registers.
pub const TTMP_COUNT: usize = 16;

/// Hardware register slot indices within the hwreg block.
pub(crate) mod hwreg_slot {
    pub const PC_LO: usize = 0;
    pub const PC_HI: usize = 1;
    pub const EXEC_LO: usize = 2;
    pub const EXEC_HI: usize = 3;
    pub const STATUS: usize = 4;
    pub const TRAPSTS: usize = 5;
    pub const MODE: usize = 6;
    pub const M0: usize = 7;
}

/// Ttmp slots reserved for debugger bookkeeping.
pub(crate) mod ttmp_slot {
    /// ttmp[4:5] hold the wave handle.
    pub const WAVE_ID: usize = 4;
    /// ttmp[8:10] hold the workgroup coordinates.
    pub const DISPATCH_GRID: usize = 8;
    /// ttmp11 holds the wave's position in its workgroup.
    pub const WAVE_IN_GROUP: usize = 11;
}

/// A register number, as seen by clients and by the architecture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Regnum {
    /// Program counter (8 bytes, hwreg slots 0-1).
    Pc,
    /// Execution mask for 32-lane waves (4 bytes).
    Exec32,
    /// Execution mask for 64-lane waves (8 bytes, hwreg slots 2-3).
    Exec64,
    /// Hardware status register.
    Status,
    /// Trap status register.
    Trapsts,
    /// Mode register (single-step enable lives here).
    Mode,
    /// Memory-addressing register.
    M0,
    /// Scalar general-purpose register.
    Sgpr(u16),
    /// Vector general-purpose register; one dword per lane.
    Vgpr(u16),
    /// Trap-temporary register; reads as zero without trap privilege.
    Ttmp(u8),
    /// Wave handle stored in ttmp[4:5] (not privilege-gated).
    WaveId,
    /// Workgroup coordinates stored in ttmp[8:10] (not privilege-gated).
    DispatchGrid,
    /// Wave index within the workgroup, ttmp11 (not privilege-gated).
    WaveInGroup,
    /// Base of the workgroup's local data share in the context save area.
    /// Address-only; not readable as a register value.
    Lds,
    /// Width-independent view of the execution mask; dispatched through the
    /// architecture's pseudo-register hooks.
    PseudoExec,
}

impl Regnum {
    /// Whether this regnum is a pseudo register (no backing storage of its
    /// own; the architecture synthesizes it).
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Regnum::PseudoExec)
    }

    /// Size in bytes of the register's value, or `None` for address-only
    /// regnums. Vector registers hold one dword per lane.
    pub fn size(&self, lane_count: u32) -> Option<usize> {
        match self {
            Regnum::Pc | Regnum::Exec64 | Regnum::WaveId | Regnum::PseudoExec => Some(8),
            Regnum::Exec32
            | Regnum::Status
            | Regnum::Trapsts
            | Regnum::Mode
            | Regnum::M0
            | Regnum::Sgpr(_)
            | Regnum::Ttmp(_)
            | Regnum::WaveInGroup => Some(4),
            Regnum::DispatchGrid => Some(12),
            Regnum::Vgpr(_) => Some(lane_count as usize * 4),
            Regnum::Lds => None,
        }
    }
}

impl fmt::Display for Regnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regnum::Pc => write!(f, "pc"),
            Regnum::Exec32 | Regnum::Exec64 => write!(f, "exec"),
            Regnum::Status => write!(f, "status"),
            Regnum::Trapsts => write!(f, "trapsts"),
            Regnum::Mode => write!(f, "mode"),
            Regnum::M0 => write!(f, "m0"),
            Regnum::Sgpr(i) => write!(f, "s{}", i),
            Regnum::Vgpr(i) => write!(f, "v{}", i),
            Regnum::Ttmp(i) => write!(f, "ttmp{}", i),
            Regnum::WaveId => write!(f, "wave_id"),
            Regnum::DispatchGrid => write!(f, "dispatch_grid"),
            Regnum::WaveInGroup => write!(f, "wave_in_group"),
            Regnum::Lds => write!(f, "lds"),
            Regnum::PseudoExec => write!(f, "pseudo_exec"),
        }
    }
}
