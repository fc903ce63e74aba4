//! Displaced-stepping buffers.
//!
//! To step over a breakpoint without removing it, the original instruction
//! is reconstructed and either copied to a scratch buffer (the wave's pc is
//! redirected there) or, when the architecture can simulate it, marked for
//! simulation with no scratch allocation at all.
//!
//! Buffers are shared: every wave of one queue stopped at the same pc uses
//! the same buffer, tracked with an explicit reference count. The process
//! owns the arena; waves hold buffer ids, never the buffers themselves.

use crate::arch::Instruction;
use crate::types::{DisplacedSteppingId, GlobalAddress, QueueId};

/// A scratch allocation for one displaced instruction, produced by the
/// queue's `allocate_instruction_buffer` callback and returned to it when
/// the buffer is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionBuffer {
    /// Global address of the scratch bytes.
    pub address: GlobalAddress,
    /// Usable size of the allocation.
    pub capacity: usize,
}

#[derive(Debug)]
pub struct DisplacedStepping {
    id: DisplacedSteppingId,
    queue: QueueId,
    /// The pc the instruction was displaced from.
    from: GlobalAddress,
    /// The scratch pc the instruction executes at; `None` when simulated.
    to: Option<GlobalAddress>,
    original_instruction: Instruction,
    is_simulated: bool,
    instruction_buffer: Option<InstructionBuffer>,
    refcount: u32,
}

impl DisplacedStepping {
    pub(crate) fn new(
        queue: QueueId,
        from: GlobalAddress,
        original_instruction: Instruction,
        is_simulated: bool,
        instruction_buffer: Option<InstructionBuffer>,
    ) -> Self {
        assert!(
            is_simulated == instruction_buffer.is_none(),
            "exactly one of simulation or a scratch buffer"
        );
        Self {
            id: DisplacedSteppingId::allocate(),
            queue,
            from,
            to: instruction_buffer.map(|buffer| buffer.address),
            original_instruction,
            is_simulated,
            instruction_buffer,
            refcount: 1,
        }
    }

    pub fn id(&self) -> DisplacedSteppingId {
        self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn from(&self) -> GlobalAddress {
        self.from
    }

    /// The scratch pc. Only valid when the buffer is not simulated.
    pub fn to(&self) -> Option<GlobalAddress> {
        self.to
    }

    pub fn original_instruction(&self) -> &Instruction {
        &self.original_instruction
    }

    pub fn is_simulated(&self) -> bool {
        self.is_simulated
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub(crate) fn retain(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference. Returns the scratch buffer to free when the
    /// count reaches zero.
    pub(crate) fn release(&mut self) -> Option<Option<InstructionBuffer>> {
        assert!(self.refcount > 0, "releasing a dead displaced stepping");
        self.refcount -= 1;
        if self.refcount == 0 {
            Some(self.instruction_buffer.take())
        } else {
            None
        }
    }
}
