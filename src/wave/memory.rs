//! Segment memory transfer.
//!
//! A stopped wave can move bytes in four address spaces: the process' flat
//! global space, the workgroup's local data share (saved in the context
//! save area), and per-wave scratch in either its flat (unswizzled) or
//! lane-interleaved (swizzled) layout.
//!
//! Swizzled scratch interleaves the lanes dword by dword: the global byte
//! for `(lane, address)` lives at
//! `scratch_base + (address / 4) * lane_count * 4 + lane * 4 + address % 4`,
//! so transfers proceed one dword-aligned chunk per lane stride.

use super::Wave;
use crate::error::{fatal, Error, Result};
use crate::process::Process;
use crate::regs::Regnum;
use crate::types::{AddressSpace, AddressSpaceKind, LaneId, SegmentAddress, WaveState};

/// Direction plus buffer for one transfer.
pub(crate) enum Xfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Xfer<'_> {
    fn len(&self) -> usize {
        match self {
            Xfer::Read(buf) => buf.len(),
            Xfer::Write(buf) => buf.len(),
        }
    }

    /// Transfer up to `size` bytes of the buffer at `position` from/to
    /// `address`. Returns the number of bytes moved.
    fn transfer(
        &mut self,
        process: &mut Process,
        address: u64,
        position: usize,
        size: usize,
    ) -> Result<usize> {
        match self {
            Xfer::Read(buf) => process
                .memory
                .read_global_memory_partial(address, &mut buf[position..position + size]),
            Xfer::Write(buf) => process
                .memory
                .write_global_memory_partial(address, &buf[position..position + size]),
        }
    }
}

impl Wave {
    /// Read from a segment address space into `buf`. Returns the number of
    /// bytes read, which may be short when the range straddles the end of
    /// the segment.
    pub fn read_segment_memory(
        &mut self,
        process: &mut Process,
        address_space: AddressSpace,
        lane_id: Option<LaneId>,
        segment_address: SegmentAddress,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.xfer_segment_memory(process, address_space, lane_id, segment_address, Xfer::Read(buf))
    }

    /// Write `buf` to a segment address space. Returns the number of bytes
    /// written.
    pub fn write_segment_memory(
        &mut self,
        process: &mut Process,
        address_space: AddressSpace,
        lane_id: Option<LaneId>,
        segment_address: SegmentAddress,
        buf: &[u8],
    ) -> Result<usize> {
        self.xfer_segment_memory(process, address_space, lane_id, segment_address, Xfer::Write(buf))
    }

    pub(crate) fn xfer_segment_memory(
        &mut self,
        process: &mut Process,
        address_space: AddressSpace,
        lane_id: Option<LaneId>,
        segment_address: SegmentAddress,
        mut xfer: Xfer<'_>,
    ) -> Result<usize> {
        assert!(
            self.state == WaveState::Stop,
            "the wave must be stopped to read/write memory"
        );

        let segment_address = address_space.extend(segment_address);

        match address_space.kind {
            AddressSpaceKind::PrivateSwizzled => {
                self.xfer_private_memory_swizzled(process, segment_address, lane_id, xfer)
            }
            AddressSpaceKind::PrivateUnswizzled => {
                self.xfer_private_memory_unswizzled(process, segment_address, xfer)
            }
            AddressSpaceKind::Local => self.xfer_local_memory(process, segment_address, xfer),
            AddressSpaceKind::Global => {
                let size = xfer.len();
                xfer.transfer(process, segment_address, 0, size)
            }
        }
    }

    /// Per-lane scratch with the dword-interleaved layout. Transfers one
    /// dword-aligned chunk at a time; the first and last chunk may be short
    /// to cover unaligned edges.
    fn xfer_private_memory_swizzled(
        &mut self,
        process: &mut Process,
        segment_address: SegmentAddress,
        lane_id: Option<LaneId>,
        mut xfer: Xfer<'_>,
    ) -> Result<usize> {
        let lane_id = match lane_id {
            Some(lane) if lane < self.lane_count => lane as u64,
            _ => return Err(Error::InvalidLaneId),
        };

        let (scratch_base, scratch_size) = self.callbacks.scratch_memory_region(self.cwsr()?);
        let lane_count = self.lane_count as u64;

        let total = xfer.len();
        let mut segment_address = segment_address;
        let mut bytes = total;

        while bytes > 0 {
            let request_size = ((4 - (segment_address % 4)) as usize).min(bytes);
            let mut xfer_size = request_size;

            let offset = (segment_address / 4) * lane_count * 4
                + lane_id * 4
                + (segment_address % 4);

            if offset + xfer_size as u64 > scratch_size {
                xfer_size = if offset < scratch_size {
                    (scratch_size - offset) as usize
                } else {
                    0
                };
                if xfer_size == 0 {
                    return Err(Error::MemoryAccess);
                }
            }

            let global_address = scratch_base + offset;
            let moved = xfer.transfer(process, global_address, total - bytes, xfer_size)?;

            bytes -= moved;
            if moved != request_size {
                break;
            }
            segment_address += moved as u64;
        }

        if bytes != 0 && bytes == total {
            return Err(Error::MemoryAccess);
        }
        Ok(total - bytes)
    }

    /// Flat per-wave scratch: one bounds check, one partial transfer.
    fn xfer_private_memory_unswizzled(
        &mut self,
        process: &mut Process,
        segment_address: SegmentAddress,
        mut xfer: Xfer<'_>,
    ) -> Result<usize> {
        let (scratch_base, scratch_size) = self.callbacks.scratch_memory_region(self.cwsr()?);

        let mut size = xfer.len();
        if segment_address + size as u64 > scratch_size {
            let max_size = if segment_address < scratch_size {
                (scratch_size - segment_address) as usize
            } else {
                0
            };
            if max_size == 0 && size != 0 {
                return Err(Error::MemoryAccess);
            }
            size = max_size;
        }

        xfer.transfer(process, scratch_base + segment_address, 0, size)
    }

    /// The local data share is stored in the group leader's context save
    /// record; the queue must be suspended for its contents to be stable.
    fn xfer_local_memory(
        &mut self,
        process: &mut Process,
        segment_address: SegmentAddress,
        mut xfer: Xfer<'_>,
    ) -> Result<usize> {
        assert!(
            process.queue(self.queue)?.is_suspended(),
            "local memory access requires a suspended queue"
        );

        let limit = self.cwsr()?.lds_size();

        let mut size = xfer.len();
        if segment_address + size as u64 > limit {
            let max_size = if segment_address < limit {
                (limit - segment_address) as usize
            } else {
                0
            };
            if max_size == 0 && size != 0 {
                return Err(Error::MemoryAccess);
            }
            size = max_size;
        }

        let base = {
            let leader_record = if self.group_leader == self.id {
                self.cwsr()?
            } else {
                process
                    .find_wave(self.group_leader)
                    .ok_or_else(|| fatal!("group leader {} not found", self.group_leader))?
                    .cwsr()?
            };
            leader_record
                .register_address(Regnum::Lds)
                .ok_or_else(|| fatal!("local memory is not accessible"))?
        };

        xfer.transfer(process, base + segment_address, 0, size)
    }
}
