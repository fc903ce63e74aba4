//! Architecture capability table.
//!
//! Everything the core needs to know about a GPU generation is funneled
//! through the [`Architecture`] trait: how to decode a wave's saved state
//! into a debugger state, whether stopped waves must be parked, which
//! instructions terminate a wave, which can be simulated instead of
//! executed, and how pseudo registers are synthesized. One `Arc<dyn
//! Architecture>` is selected per agent and shared by its waves.
//!
//! Implementations live with the embedder; the core only calls through the
//! table. `register_size` and `register_name` have default implementations
//! derived from the canonical record layout, which architectures may
//! override.

use crate::error::Result;
use crate::process::Process;
use crate::regs::Regnum;
use crate::types::{ArchitectureId, Exceptions, GlobalAddress, OsWatchId, StopReasons, WaveState};
use crate::wave::Wave;
use smallvec::SmallVec;
use std::fmt;

/// Upper bound on instruction encoding size, in bytes.
pub const MAX_INSTRUCTION_BYTES: usize = 16;

/// A raw instruction encoding read from process memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    bytes: SmallVec<[u8; MAX_INSTRUCTION_BYTES]>,
}

impl Instruction {
    pub fn new(bytes: impl IntoIterator<Item = u8>) -> Self {
        Self {
            bytes: bytes.into_iter().collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

pub trait Architecture: Send + Sync {
    /// Stable handle for this architecture descriptor.
    fn id(&self) -> ArchitectureId;

    /// Short architecture name for logs.
    fn name(&self) -> &str;

    /// Decode the wave's saved status into `(state, stop_reason)`.
    fn wave_get_state(
        &self,
        wave: &mut Wave,
        process: &mut Process,
    ) -> Result<(WaveState, StopReasons)>;

    /// Encode a requested state (and exceptions to deliver on release) into
    /// the wave's saved status.
    fn wave_set_state(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        state: WaveState,
        exceptions: Exceptions,
    ) -> Result<()>;

    /// Read the hardware halt override bit.
    fn wave_get_halt(&self, wave: &mut Wave, process: &mut Process) -> Result<bool>;

    /// Set or clear the hardware halt override bit.
    fn wave_set_halt(&self, wave: &mut Wave, process: &mut Process, halt: bool) -> Result<()>;

    /// Whether this instruction can be simulated by the debugger instead of
    /// being executed by hardware (e.g. instructions that manipulate the
    /// program counter).
    fn can_simulate(&self, wave: &Wave, instruction: &Instruction) -> bool;

    /// Simulate one instruction at `pc`. Returns `true` if the instruction
    /// was simulated, `false` if it must be executed by hardware.
    fn simulate(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        pc: GlobalAddress,
        instruction: &Instruction,
    ) -> Result<bool>;

    /// Whether this instruction may be copied to a scratch buffer and
    /// executed from there.
    fn can_execute_displaced(&self, wave: &Wave, instruction: &Instruction) -> bool;

    /// Whether this instruction terminates the wave.
    fn is_terminating_instruction(&self, instruction: &Instruction) -> bool;

    /// Size in bytes of the largest instruction encoding.
    fn largest_instruction_size(&self) -> usize;

    /// The breakpoint instruction encoding.
    fn breakpoint_instruction(&self) -> &[u8];

    /// Whether stopped waves must be parked at an immutable trap
    /// instruction because the hardware cannot reliably halt everywhere.
    fn park_stopped_waves(&self) -> bool;

    /// OS watchpoint slots whose trigger bits are set in the wave's saved
    /// trap status.
    fn triggered_watchpoints(
        &self,
        wave: &mut Wave,
        process: &mut Process,
    ) -> Result<Vec<OsWatchId>>;

    /// Size in bytes of a register's value. Vector registers hold one dword
    /// per lane.
    fn register_size(&self, regnum: Regnum, lane_count: u32) -> Option<usize> {
        regnum.size(lane_count)
    }

    /// Register name for logs and error messages.
    fn register_name(&self, regnum: Regnum) -> String {
        regnum.to_string()
    }

    /// Whether a pseudo register can be synthesized for this wave.
    fn is_pseudo_register_available(&self, wave: &Wave, regnum: Regnum) -> bool;

    /// Synthesize `dst.len()` bytes of a pseudo register at `offset`.
    fn read_pseudo_register(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()>;

    /// Store `src` into a pseudo register at `offset`.
    fn write_pseudo_register(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        src: &[u8],
    ) -> Result<()>;
}
