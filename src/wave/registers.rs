//! Lane- and range-aware register I/O.
//!
//! Register traffic is layered: pseudo registers dispatch through the
//! architecture table; the parked pc is served from the wave object; ttmp
//! registers are privilege-gated; everything inside the cached hwreg/ttmp
//! window goes through the write-back cache; and anything else is a direct
//! global-memory access that requires the owning queue to be suspended.
//!
//! Out-of-range scalar and vector register numbers follow the hardware's
//! aliasing rules: reads alias the first register of the file, writes are
//! silently dropped.

use super::Wave;
use crate::cache::CachePolicy;
use crate::error::{fatal, Error, Result};
use crate::process::Process;
use crate::regs::Regnum;
use byteorder::{ByteOrder, LittleEndian};

impl Wave {
    /// Whether the register exists for this wave.
    pub fn is_register_available(&self, regnum: Regnum) -> bool {
        if regnum.is_pseudo() {
            return self.architecture.is_pseudo_register_available(self, regnum);
        }
        match &self.cwsr {
            Some(record) => record.register_address(regnum).is_some(),
            None => false,
        }
    }

    /// Caching policy applied to a register's storage: write-back inside
    /// the cached hwreg/ttmp window, uncached everywhere else.
    pub fn register_cache_policy(&self, regnum: Regnum) -> Result<CachePolicy> {
        assert!(!regnum.is_pseudo(), "pseudo registers have no cache policy");
        let record = self.cwsr()?;
        let reg_addr = record
            .register_address(regnum)
            .ok_or_else(|| fatal!("{} has no saved address", regnum))?;
        let size = self
            .architecture
            .register_size(regnum, self.lane_count)
            .ok_or_else(|| fatal!("{} has no value size", regnum))?;
        Ok(if self.register_cache.contains(reg_addr, size) {
            self.register_cache.policy()
        } else {
            CachePolicy::Uncached
        })
    }

    /// Whether an access to this register bypasses both the wave object and
    /// the register cache and therefore needs the queue suspended.
    pub(crate) fn register_access_is_direct(&self, regnum: Regnum) -> bool {
        if regnum.is_pseudo() {
            return false;
        }
        let Some(record) = &self.cwsr else {
            return false;
        };
        if self.is_parked && regnum == Regnum::Pc {
            return false;
        }
        if matches!(regnum, Regnum::Ttmp(_)) && !record.is_priv() {
            return false;
        }
        let Some(size) = self.architecture.register_size(regnum, self.lane_count) else {
            return false;
        };
        let address = record.register_address(regnum).or(match regnum {
            Regnum::Sgpr(_) => record.register_address(Regnum::Sgpr(0)),
            Regnum::Vgpr(_) => record.register_address(Regnum::Vgpr(0)),
            _ => None,
        });
        match address {
            Some(address) => !self.register_cache.contains(address, size),
            None => false,
        }
    }

    /// Read `value.len()` bytes of a register starting at `offset`.
    pub fn read_register(
        &mut self,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        value: &mut [u8],
    ) -> Result<()> {
        let architecture = self.architecture();

        if regnum.is_pseudo() {
            return architecture.read_pseudo_register(self, process, regnum, offset, value);
        }

        let size = architecture
            .register_size(regnum, self.lane_count)
            .ok_or(Error::InvalidArgument("register has no value"))?;
        if value.is_empty() || offset + value.len() > size {
            return Err(Error::InvalidArgumentCompatibility);
        }

        let record = self.cwsr()?;
        let mut reg_addr = record.register_address(regnum);

        // Out of range sgpr/vgpr: read the first register of the file.
        if reg_addr.is_none() {
            reg_addr = match regnum {
                Regnum::Sgpr(_) => record.register_address(Regnum::Sgpr(0)),
                Regnum::Vgpr(_) => record.register_address(Regnum::Vgpr(0)),
                _ => None,
            };
        }
        let reg_addr = reg_addr.ok_or_else(|| fatal!("{} has no saved address", regnum))?;

        // Ttmp reads without trap privilege return zeros.
        if matches!(regnum, Regnum::Ttmp(_)) && !record.is_priv() {
            value.fill(0);
            return Ok(());
        }

        if self.is_parked && regnum == Regnum::Pc {
            let bytes = self.parked_pc.to_le_bytes();
            value.copy_from_slice(&bytes[offset..offset + value.len()]);
            return Ok(());
        }

        let address = reg_addr + offset as u64;
        if self.register_cache.contains(address, value.len()) {
            self.register_cache
                .read(&mut *process.memory, address, value)?;
        } else {
            assert!(
                process.queue(self.queue)?.is_suspended(),
                "direct register access requires a suspended queue"
            );
            process
                .memory
                .read_global_memory(address, value)
                .map_err(|_| {
                    fatal!(
                        "could not read the '{}' register",
                        architecture.register_name(regnum)
                    )
                })?;
        }
        Ok(())
    }

    /// Write `value` into a register starting at `offset`.
    pub fn write_register(
        &mut self,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        value: &[u8],
    ) -> Result<()> {
        let architecture = self.architecture();

        if regnum.is_pseudo() {
            return architecture.write_pseudo_register(self, process, regnum, offset, value);
        }

        let size = architecture
            .register_size(regnum, self.lane_count)
            .ok_or(Error::InvalidArgument("register has no value"))?;
        if value.is_empty() || offset + value.len() > size {
            return Err(Error::InvalidArgumentCompatibility);
        }

        let record = self.cwsr()?;
        let reg_addr = record.register_address(regnum);

        // Out of range sgpr/vgpr writes are dropped.
        if reg_addr.is_none() && matches!(regnum, Regnum::Sgpr(_) | Regnum::Vgpr(_)) {
            return Ok(());
        }
        let reg_addr = reg_addr.ok_or_else(|| fatal!("{} has no saved address", regnum))?;

        // Ttmp writes without trap privilege are dropped.
        if matches!(regnum, Regnum::Ttmp(_)) && !record.is_priv() {
            return Ok(());
        }

        if self.is_parked && regnum == Regnum::Pc {
            let mut bytes = self.parked_pc.to_le_bytes();
            bytes[offset..offset + value.len()].copy_from_slice(value);
            self.parked_pc = u64::from_le_bytes(bytes);
            return Ok(());
        }

        let address = reg_addr + offset as u64;
        if self.register_cache.contains(address, value.len()) {
            self.register_cache
                .write(&mut *process.memory, address, value)?;

            // The queue flushes this cache before it resumes.
            if self.register_cache.is_dirty() {
                let id = self.id;
                process.queue_mut(self.queue)?.register_dirty_cache(id);
            }
        } else {
            assert!(
                process.queue(self.queue)?.is_suspended(),
                "direct register access requires a suspended queue"
            );
            process
                .memory
                .write_global_memory(address, value)
                .map_err(|_| {
                    fatal!(
                        "could not write the '{}' register",
                        architecture.register_name(regnum)
                    )
                })?;
        }
        Ok(())
    }

    pub fn read_register_u32(&mut self, process: &mut Process, regnum: Regnum) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_register(process, regnum, 0, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_register_u64(&mut self, process: &mut Process, regnum: Regnum) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_register(process, regnum, 0, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn write_register_u32(
        &mut self,
        process: &mut Process,
        regnum: Regnum,
        value: u32,
    ) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_register(process, regnum, 0, &buf)
    }

    pub fn write_register_u64(
        &mut self,
        process: &mut Process,
        regnum: Regnum,
        value: u64,
    ) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_register(process, regnum, 0, &buf)
    }
}
