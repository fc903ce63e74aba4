//! Global-memory access contract.
//!
//! The library never touches process memory directly; the embedder supplies
//! an implementation of [`ProcessMemory`] backed by whatever transport the
//! OS driver provides. Partial transfers are the primitive: a short count
//! is a valid outcome (the far end of the range is unmapped), an `Err` means
//! the transfer could not start at all.

use crate::error::{Error, Result};
use crate::types::GlobalAddress;

pub trait ProcessMemory {
    /// Read up to `buf.len()` bytes at `address`. Returns the number of
    /// bytes actually read.
    fn read_global_memory_partial(
        &mut self,
        address: GlobalAddress,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Write up to `buf.len()` bytes at `address`. Returns the number of
    /// bytes actually written.
    fn write_global_memory_partial(&mut self, address: GlobalAddress, buf: &[u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes; a short read is an error.
    fn read_global_memory(&mut self, address: GlobalAddress, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        match self.read_global_memory_partial(address, buf)? {
            n if n == len => Ok(()),
            _ => Err(Error::MemoryAccess),
        }
    }

    /// Write exactly `buf.len()` bytes; a short write is an error.
    fn write_global_memory(&mut self, address: GlobalAddress, buf: &[u8]) -> Result<()> {
        match self.write_global_memory_partial(address, buf)? {
            n if n == buf.len() => Ok(()),
            _ => Err(Error::MemoryAccess),
        }
    }
}
