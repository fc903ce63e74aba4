//! Context Wave State Restore (CWSR) records.
//!
//! When the trap handler context-saves a wave, it writes every architected
//! register plus the workgroup's local data share into a per-wave record in
//! global memory. A [`CwsrRecord`] locates that saved state. The record is
//! replaced on every queue suspension while the wave is running; once the
//! wave is stopped the record's contents are authoritative and only its
//! address may change between suspensions.
//!
//! # Record layout
//!
//! ```text
//! base ┬ vgprs   vgpr_count x lane_count x 4 bytes
//!      ├ sgprs   sgpr_count x 4 bytes
//!      ├ hwregs  HWREG_COUNT x 4 bytes   ─┐ contiguous cached window
//!      ├ ttmps   TTMP_COUNT x 4 bytes    ─┘
//!      └ lds     lds_size bytes (group leader's record only)
//! ```

use crate::regs::{hwreg_slot, ttmp_slot, Regnum, HWREG_COUNT, TTMP_COUNT};
use crate::types::GlobalAddress;

/// Raw description of one context-saved wave, as reported by the OS driver
/// for a suspended queue.
#[derive(Debug, Clone)]
pub struct CwsrDescriptor {
    /// First byte of the record in global memory.
    pub base: GlobalAddress,
    /// Lanes in the wave: 32 or 64.
    pub lane_count: u32,
    /// Allocated scalar registers.
    pub sgpr_count: u16,
    /// Allocated vector registers.
    pub vgpr_count: u16,
    /// Size of the saved local data share; non-zero only on the workgroup
    /// leader's record.
    pub lds_size: u64,
    /// Whether the wave was saved in trap-privileged mode.
    pub is_priv: bool,
}

/// Locates the architected state of one context-saved wave.
#[derive(Debug, Clone)]
pub struct CwsrRecord {
    base: GlobalAddress,
    lane_count: u32,
    sgpr_count: u16,
    vgpr_count: u16,
    lds_size: u64,
    is_priv: bool,
}

impl CwsrRecord {
    pub fn new(descriptor: &CwsrDescriptor) -> Self {
        assert!(
            descriptor.lane_count == 32 || descriptor.lane_count == 64,
            "lane_count must be 32 or 64"
        );
        Self {
            base: descriptor.base,
            lane_count: descriptor.lane_count,
            sgpr_count: descriptor.sgpr_count,
            vgpr_count: descriptor.vgpr_count,
            lds_size: descriptor.lds_size,
            is_priv: descriptor.is_priv,
        }
    }

    /// First byte of the record in global memory.
    pub fn begin(&self) -> GlobalAddress {
        self.base
    }

    /// One past the last byte of the record.
    pub fn end(&self) -> GlobalAddress {
        self.lds_offset() + self.lds_size
    }

    pub fn lane_count(&self) -> u32 {
        self.lane_count
    }

    /// Size of the saved local data share.
    pub fn lds_size(&self) -> u64 {
        self.lds_size
    }

    /// Whether the wave was saved in trap-privileged mode. Ttmp registers
    /// read as zero and ignore writes when this is false.
    pub fn is_priv(&self) -> bool {
        self.is_priv
    }

    fn sgpr_offset(&self) -> GlobalAddress {
        self.base + self.vgpr_count as u64 * self.lane_count as u64 * 4
    }

    fn hwreg_offset(&self) -> GlobalAddress {
        self.sgpr_offset() + self.sgpr_count as u64 * 4
    }

    fn ttmp_offset(&self) -> GlobalAddress {
        self.hwreg_offset() + (HWREG_COUNT as u64) * 4
    }

    fn lds_offset(&self) -> GlobalAddress {
        self.ttmp_offset() + (TTMP_COUNT as u64) * 4
    }

    /// Global address of a register's saved value.
    ///
    /// Returns `None` for registers outside the wave's allocation
    /// (out-of-range sgpr/vgpr, exec of the wrong width, lds when this
    /// record carries none).
    pub fn register_address(&self, regnum: Regnum) -> Option<GlobalAddress> {
        let hwreg = |slot: usize| self.hwreg_offset() + slot as u64 * 4;
        let ttmp = |slot: usize| self.ttmp_offset() + slot as u64 * 4;

        match regnum {
            Regnum::Pc => Some(hwreg(hwreg_slot::PC_LO)),
            Regnum::Exec32 if self.lane_count == 32 => Some(hwreg(hwreg_slot::EXEC_LO)),
            Regnum::Exec64 if self.lane_count == 64 => Some(hwreg(hwreg_slot::EXEC_LO)),
            Regnum::Exec32 | Regnum::Exec64 => None,
            Regnum::Status => Some(hwreg(hwreg_slot::STATUS)),
            Regnum::Trapsts => Some(hwreg(hwreg_slot::TRAPSTS)),
            Regnum::Mode => Some(hwreg(hwreg_slot::MODE)),
            Regnum::M0 => Some(hwreg(hwreg_slot::M0)),
            Regnum::Sgpr(i) if i < self.sgpr_count => Some(self.sgpr_offset() + i as u64 * 4),
            Regnum::Sgpr(_) => None,
            Regnum::Vgpr(i) if i < self.vgpr_count => {
                Some(self.base + i as u64 * self.lane_count as u64 * 4)
            }
            Regnum::Vgpr(_) => None,
            Regnum::Ttmp(i) if (i as usize) < TTMP_COUNT => Some(ttmp(i as usize)),
            Regnum::Ttmp(_) => None,
            Regnum::WaveId => Some(ttmp(ttmp_slot::WAVE_ID)),
            Regnum::DispatchGrid => Some(ttmp(ttmp_slot::DISPATCH_GRID)),
            Regnum::WaveInGroup => Some(ttmp(ttmp_slot::WAVE_IN_GROUP)),
            Regnum::Lds if self.lds_size != 0 => Some(self.lds_offset()),
            Regnum::Lds => None,
            Regnum::PseudoExec => None,
        }
    }

    /// The contiguous `[hwregs..ttmps]` window covered by the register
    /// cache, as `(begin, length)`.
    pub fn cached_window(&self) -> (GlobalAddress, usize) {
        (self.hwreg_offset(), (HWREG_COUNT + TTMP_COUNT) * 4)
    }
}
