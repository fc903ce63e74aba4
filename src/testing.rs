//! Test harness: in-memory implementations of the embedder contracts.
//!
//! These doubles let the core run without a GPU or an OS driver:
//!
//! - [`SparseMemory`]: page-granular sparse global memory
//! - [`StubDriver`]: queue control with scriptable context-save snapshots
//! - [`StubArchitecture`]: a tiny fixed-width ISA with a status/trapsts
//!   encoding the core can drive end to end
//! - [`StubCallbacks`]: park/terminate trap addresses, a bump allocator for
//!   displaced-stepping buffers, and a fixed scratch region
//! - [`Fixture`]: a ready-made session with one process, agent, queue and
//!   dispatch, plus helpers to seed context-saved waves
//!
//! The stub ISA uses 4-byte instructions tagged by their first byte:
//! `0xBB` breakpoint, `0xEE` terminating, `0x51` branch (simulatable, not
//! displaced-steppable), `0x77` neither, anything else displaced-steppable.

use crate::arch::{Architecture, Instruction};
use crate::cwsr::{CwsrDescriptor, CwsrRecord};
use crate::displaced::InstructionBuffer;
use crate::error::{fatal, Error, Result};
use crate::mem::ProcessMemory;
use crate::process::{OsDriver, Process, WaveCallbacks, WaveSnapshot};
use crate::regs::Regnum;
use crate::session::DebugSession;
use crate::types::{
    AgentId, ArchitectureId, DispatchId, Exceptions, GlobalAddress, OsExceptionMask, OsWatchId,
    ProcessId, QueueId, StopReasons, WaveId, WaveState,
};
use crate::wave::Wave;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a stub's shared state. A panicking test poisons the mutex; the data
/// under it is still usable, so recover the guard instead of panicking too.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Global address of a register's saved value in a seeded record.
fn saved_register_address(record: &CwsrRecord, regnum: Regnum) -> Result<GlobalAddress> {
    record
        .register_address(regnum)
        .ok_or_else(|| fatal!("{} has no saved address", regnum))
}

// ---- sparse memory --------------------------------------------------------

const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

#[derive(Default)]
struct SparseMemoryInner {
    /// Sparse storage: page address -> page bytes. Unallocated pages read
    /// as zero.
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    /// Mapped ranges as `(base, size)`. Empty means everything is mapped.
    mapped: Vec<(u64, u64)>,
}

impl SparseMemoryInner {
    fn mapped_len(&self, address: u64, len: usize) -> Option<usize> {
        if self.mapped.is_empty() {
            return Some(len);
        }
        self.mapped
            .iter()
            .find(|(base, size)| address >= *base && address < base + size)
            .map(|(base, size)| len.min((base + size - address) as usize))
    }

    fn read(&self, address: u64, buf: &mut [u8]) {
        let mut current = address;
        let mut offset = 0;
        while offset < buf.len() {
            let page_offset = (current & !PAGE_MASK) as usize;
            let take = (buf.len() - offset).min(PAGE_SIZE - page_offset);
            match self.pages.get(&(current & PAGE_MASK)) {
                Some(page) => {
                    buf[offset..offset + take]
                        .copy_from_slice(&page[page_offset..page_offset + take]);
                }
                None => buf[offset..offset + take].fill(0),
            }
            current += take as u64;
            offset += take;
        }
    }

    fn write(&mut self, address: u64, data: &[u8]) {
        let mut current = address;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page = self
                .pages
                .entry(current & PAGE_MASK)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            let page_offset = (current & !PAGE_MASK) as usize;
            let take = remaining.len().min(PAGE_SIZE - page_offset);
            page[page_offset..page_offset + take].copy_from_slice(&remaining[..take]);
            current += take as u64;
            remaining = &remaining[take..];
        }
    }
}

/// Sparse global memory, shared between the process and the test body.
#[derive(Clone, Default)]
pub struct SparseMemory {
    inner: Arc<Mutex<SparseMemoryInner>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict valid addresses to explicitly mapped ranges. Before the
    /// first call, the whole address space is considered mapped.
    pub fn map_region(&self, base: u64, size: u64) {
        lock(&self.inner).mapped.push((base, size));
    }

    /// Direct write, bypassing the mapped-range check.
    pub fn write(&self, address: u64, data: &[u8]) {
        lock(&self.inner).write(address, data);
    }

    /// Direct read, bypassing the mapped-range check.
    pub fn read(&self, address: u64, buf: &mut [u8]) {
        lock(&self.inner).read(address, buf);
    }

    pub fn write_u32(&self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u64(&self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, address: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf);
        u64::from_le_bytes(buf)
    }
}

impl ProcessMemory for SparseMemory {
    fn read_global_memory_partial(
        &mut self,
        address: GlobalAddress,
        buf: &mut [u8],
    ) -> Result<usize> {
        let inner = lock(&self.inner);
        let len = inner
            .mapped_len(address, buf.len())
            .ok_or(Error::MemoryAccess)?;
        inner.read(address, &mut buf[..len]);
        Ok(len)
    }

    fn write_global_memory_partial(&mut self, address: GlobalAddress, buf: &[u8]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        let len = inner
            .mapped_len(address, buf.len())
            .ok_or(Error::MemoryAccess)?;
        inner.write(address, &buf[..len]);
        Ok(len)
    }
}

// ---- driver ---------------------------------------------------------------

#[derive(Default)]
pub struct DriverState {
    pub snapshots: BTreeMap<QueueId, Vec<WaveSnapshot>>,
    pub suspended: BTreeSet<QueueId>,
    pub suspend_calls: Vec<Vec<QueueId>>,
    pub resume_calls: Vec<Vec<QueueId>>,
    pub sent_exceptions: Vec<(OsExceptionMask, QueueId)>,
}

/// Queue-control stub; tests mutate `state` to script snapshots and inspect
/// the calls the core made.
#[derive(Clone, Default)]
pub struct StubDriver {
    pub state: Arc<Mutex<DriverState>>,
}

impl OsDriver for StubDriver {
    fn suspend_queues(&mut self, queues: &[QueueId]) -> Result<()> {
        let mut state = lock(&self.state);
        state.suspend_calls.push(queues.to_vec());
        state.suspended.extend(queues.iter().copied());
        Ok(())
    }

    fn resume_queues(&mut self, queues: &[QueueId]) -> Result<()> {
        let mut state = lock(&self.state);
        state.resume_calls.push(queues.to_vec());
        for queue in queues {
            state.suspended.remove(queue);
        }
        Ok(())
    }

    fn queue_snapshot(&mut self, queue: QueueId) -> Result<Vec<WaveSnapshot>> {
        let state = lock(&self.state);
        Ok(state.snapshots.get(&queue).cloned().unwrap_or_default())
    }

    fn send_exceptions(&mut self, exceptions: OsExceptionMask, queue: QueueId) -> Result<()> {
        lock(&self.state).sent_exceptions.push((exceptions, queue));
        Ok(())
    }
}

// ---- architecture ---------------------------------------------------------

/// Status register bit: the wave is halted.
pub const STATUS_HALTED: u32 = 1 << 0;
/// Status register bit: halt override (halted at launch).
pub const STATUS_HALT: u32 = 1 << 1;
/// Mode register bit: single-step on the next instruction.
pub const MODE_DEBUG_EN: u32 = 1 << 0;

/// Stub ISA opcodes (first byte of a 4-byte instruction).
pub const OP_BREAKPOINT: u8 = 0xBB;
pub const OP_ENDPGM: u8 = 0xEE;
pub const OP_BRANCH: u8 = 0x51;
pub const OP_NO_DISPLACED: u8 = 0x77;

pub struct StubArchitecture {
    id: ArchitectureId,
    park: bool,
}

impl StubArchitecture {
    pub fn new(park_stopped_waves: bool) -> Self {
        Self {
            id: ArchitectureId::allocate(),
            park: park_stopped_waves,
        }
    }

    fn opcode(instruction: &Instruction) -> u8 {
        instruction.data().first().copied().unwrap_or(0)
    }
}

impl Architecture for StubArchitecture {
    fn id(&self) -> ArchitectureId {
        self.id
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn wave_get_state(
        &self,
        wave: &mut Wave,
        process: &mut Process,
    ) -> Result<(WaveState, StopReasons)> {
        let status = wave.read_register_u32(process, Regnum::Status)?;
        if status & STATUS_HALTED != 0 {
            let trapsts = wave.read_register_u32(process, Regnum::Trapsts)?;
            Ok((
                WaveState::Stop,
                StopReasons::from_bits_truncate(trapsts & 0xFFFF),
            ))
        } else {
            let mode = wave.read_register_u32(process, Regnum::Mode)?;
            if mode & MODE_DEBUG_EN != 0 {
                Ok((WaveState::SingleStep, StopReasons::empty()))
            } else {
                Ok((WaveState::Run, StopReasons::empty()))
            }
        }
    }

    fn wave_set_state(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        state: WaveState,
        _exceptions: Exceptions,
    ) -> Result<()> {
        let mut status = wave.read_register_u32(process, Regnum::Status)?;
        let mut mode = wave.read_register_u32(process, Regnum::Mode)?;
        match state {
            WaveState::Stop => status |= STATUS_HALTED,
            WaveState::Run => {
                status &= !STATUS_HALTED;
                mode &= !MODE_DEBUG_EN;
                wave.write_register_u32(process, Regnum::Trapsts, 0)?;
            }
            WaveState::SingleStep => {
                status &= !STATUS_HALTED;
                mode |= MODE_DEBUG_EN;
                wave.write_register_u32(process, Regnum::Trapsts, 0)?;
            }
        }
        wave.write_register_u32(process, Regnum::Status, status)?;
        wave.write_register_u32(process, Regnum::Mode, mode)
    }

    fn wave_get_halt(&self, wave: &mut Wave, process: &mut Process) -> Result<bool> {
        Ok(wave.read_register_u32(process, Regnum::Status)? & STATUS_HALT != 0)
    }

    fn wave_set_halt(&self, wave: &mut Wave, process: &mut Process, halt: bool) -> Result<()> {
        let mut status = wave.read_register_u32(process, Regnum::Status)?;
        if halt {
            status |= STATUS_HALT;
        } else {
            status &= !STATUS_HALT;
        }
        wave.write_register_u32(process, Regnum::Status, status)
    }

    fn can_simulate(&self, _wave: &Wave, instruction: &Instruction) -> bool {
        Self::opcode(instruction) == OP_BRANCH
    }

    fn simulate(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        pc: GlobalAddress,
        instruction: &Instruction,
    ) -> Result<bool> {
        if Self::opcode(instruction) != OP_BRANCH {
            return Ok(false);
        }
        // Forward branch: pc + 4 + imm8 * 4.
        let imm = instruction.data().get(1).copied().unwrap_or(0) as u64;
        let target = pc + 4 + imm * 4;
        wave.write_register_u64(process, Regnum::Pc, target)?;

        let status = wave.read_register_u32(process, Regnum::Status)?;
        wave.write_register_u32(process, Regnum::Status, status | STATUS_HALTED)?;
        wave.write_register_u32(process, Regnum::Trapsts, StopReasons::SINGLE_STEP.bits())?;
        Ok(true)
    }

    fn can_execute_displaced(&self, _wave: &Wave, instruction: &Instruction) -> bool {
        !matches!(
            Self::opcode(instruction),
            OP_BRANCH | OP_ENDPGM | OP_NO_DISPLACED
        )
    }

    fn is_terminating_instruction(&self, instruction: &Instruction) -> bool {
        Self::opcode(instruction) == OP_ENDPGM
    }

    fn largest_instruction_size(&self) -> usize {
        8
    }

    fn breakpoint_instruction(&self) -> &[u8] {
        &[OP_BREAKPOINT, 0, 0, 0]
    }

    fn park_stopped_waves(&self) -> bool {
        self.park
    }

    fn triggered_watchpoints(
        &self,
        wave: &mut Wave,
        process: &mut Process,
    ) -> Result<Vec<OsWatchId>> {
        let trapsts = wave.read_register_u32(process, Regnum::Trapsts)?;
        Ok((0..8).filter(|id| trapsts >> 16 & (1 << id) != 0).collect())
    }

    fn is_pseudo_register_available(&self, _wave: &Wave, regnum: Regnum) -> bool {
        regnum == Regnum::PseudoExec
    }

    fn read_pseudo_register(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        assert_eq!(regnum, Regnum::PseudoExec);
        if dst.is_empty() || offset + dst.len() > 8 {
            return Err(Error::InvalidArgumentCompatibility);
        }
        let exec = wave.exec_mask(process)?.to_le_bytes();
        dst.copy_from_slice(&exec[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_pseudo_register(
        &self,
        wave: &mut Wave,
        process: &mut Process,
        regnum: Regnum,
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        assert_eq!(regnum, Regnum::PseudoExec);
        if src.is_empty() || offset + src.len() > 8 {
            return Err(Error::InvalidArgumentCompatibility);
        }
        let mut exec = wave.exec_mask(process)?.to_le_bytes();
        exec[offset..offset + src.len()].copy_from_slice(src);
        let exec = u64::from_le_bytes(exec);
        match wave.lane_count() {
            32 => wave.write_register_u32(process, Regnum::Exec32, exec as u32),
            _ => wave.write_register_u64(process, Regnum::Exec64, exec),
        }
    }
}

// ---- wave callbacks -------------------------------------------------------

/// Immutable trap instruction addresses used by the stub environment.
pub const PARK_ADDRESS: GlobalAddress = 0xFFF0_0000;
pub const TERMINATE_ADDRESS: GlobalAddress = 0xFFF0_0800;
/// Base of the displaced-stepping scratch allocator.
pub const BUFFER_BASE: GlobalAddress = 0xF0000;
/// Scratch (private memory) backing region.
pub const SCRATCH_BASE: GlobalAddress = 0x40_0000;

pub struct StubCallbacks {
    scratch_size: u64,
    next_buffer: AtomicU64,
    fail_allocation: AtomicBool,
    freed: Mutex<Vec<InstructionBuffer>>,
}

impl StubCallbacks {
    pub fn new(scratch_size: u64) -> Self {
        Self {
            scratch_size,
            next_buffer: AtomicU64::new(BUFFER_BASE),
            fail_allocation: AtomicBool::new(false),
            freed: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `allocate_instruction_buffer` call fail.
    pub fn fail_next_allocation(&self) {
        self.fail_allocation.store(true, Ordering::Relaxed);
    }

    /// Buffers returned through `free_instruction_buffer`.
    pub fn freed(&self) -> Vec<InstructionBuffer> {
        lock(&self.freed).clone()
    }
}

impl WaveCallbacks for StubCallbacks {
    fn park_instruction_address(&self) -> GlobalAddress {
        PARK_ADDRESS
    }

    fn terminating_instruction_address(&self) -> GlobalAddress {
        TERMINATE_ADDRESS
    }

    fn allocate_instruction_buffer(&self, size: usize) -> Result<InstructionBuffer> {
        if self.fail_allocation.swap(false, Ordering::Relaxed) {
            return Err(Error::ClientCallback);
        }
        assert!(size <= 64);
        Ok(InstructionBuffer {
            address: self.next_buffer.fetch_add(64, Ordering::Relaxed),
            capacity: 64,
        })
    }

    fn free_instruction_buffer(&self, buffer: InstructionBuffer) {
        lock(&self.freed).push(buffer);
    }

    fn scratch_memory_region(&self, _record: &CwsrRecord) -> (GlobalAddress, u64) {
        (SCRATCH_BASE, self.scratch_size)
    }
}

// ---- fixture --------------------------------------------------------------

/// Base address of the first seeded context save record.
const RECORD_BASE: GlobalAddress = 0x1_0000;
/// Stride between seeded records.
const RECORD_STRIDE: GlobalAddress = 0x1000;

/// One seeded wave in the scripted queue snapshot.
struct Slot {
    descriptor: CwsrDescriptor,
    present: bool,
    group_leader: usize,
    dispatch: Option<DispatchId>,
    halted_at_launch: bool,
}

/// A ready-made debug session over the stub environment: one process, one
/// agent, one queue, one dispatch.
pub struct Fixture {
    pub session: DebugSession,
    pub process_id: ProcessId,
    pub agent_id: AgentId,
    pub queue_id: QueueId,
    pub dispatch_id: DispatchId,
    pub memory: SparseMemory,
    pub driver: StubDriver,
    pub architecture: Arc<StubArchitecture>,
    pub callbacks: Arc<StubCallbacks>,
    lane_count: u32,
    slots: Vec<Slot>,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Self::with_options(false, 32)
    }

    /// A fixture whose architecture parks stopped waves.
    pub fn parked() -> Result<Self> {
        Self::with_options(true, 32)
    }

    pub fn with_options(park_stopped_waves: bool, lane_count: u32) -> Result<Self> {
        let mut session = DebugSession::new();
        session.initialize()?;

        let memory = SparseMemory::new();
        let driver = StubDriver::default();
        let architecture = Arc::new(StubArchitecture::new(park_stopped_waves));
        let callbacks = Arc::new(StubCallbacks::new(0x10000));

        let process_id =
            session.attach_process(Box::new(memory.clone()), Box::new(driver.clone()))?;
        let process = session.process_mut(process_id)?;
        let agent_id = process.add_agent(architecture.clone());
        let queue_id = process.add_queue(agent_id, callbacks.clone());
        let dispatch_id = process.add_dispatch(queue_id);

        Ok(Self {
            session,
            process_id,
            agent_id,
            queue_id,
            dispatch_id,
            memory,
            driver,
            architecture,
            callbacks,
            lane_count,
            slots: Vec::new(),
        })
    }

    /// Seed a context-saved wave. Returns its slot index. The wave is its
    /// own group leader and carries a 256-byte LDS.
    pub fn add_wave(&mut self, pc: u64, stopped: Option<StopReasons>) -> Result<usize> {
        let slot = self.slots.len();
        let descriptor = CwsrDescriptor {
            base: RECORD_BASE + slot as u64 * RECORD_STRIDE,
            lane_count: self.lane_count,
            sgpr_count: 16,
            vgpr_count: 4,
            lds_size: 256,
            is_priv: true,
        };
        let record = CwsrRecord::new(&descriptor);
        self.memory
            .write_u64(saved_register_address(&record, Regnum::Pc)?, pc);
        let (status, trapsts) = match stopped {
            Some(reasons) => (STATUS_HALTED, reasons.bits()),
            None => (0, 0),
        };
        self.memory
            .write_u32(saved_register_address(&record, Regnum::Status)?, status);
        self.memory
            .write_u32(saved_register_address(&record, Regnum::Trapsts)?, trapsts);

        self.slots.push(Slot {
            descriptor,
            present: true,
            group_leader: slot,
            dispatch: Some(self.dispatch_id),
            halted_at_launch: false,
        });
        self.publish_snapshot();
        Ok(slot)
    }

    /// Seed a wave that launched halted and has no dispatch association
    /// yet. It stays hidden until `provide_dispatch` is called.
    pub fn add_wave_halted_at_launch(&mut self, pc: u64) -> Result<usize> {
        let slot = self.add_wave(pc, None)?;
        let record = self.record(slot);
        self.memory
            .write_u32(saved_register_address(&record, Regnum::Status)?, STATUS_HALT);
        self.slots[slot].dispatch = None;
        self.slots[slot].halted_at_launch = true;
        self.publish_snapshot();
        Ok(slot)
    }

    /// Associate a previously launch-halted wave with the dispatch.
    pub fn provide_dispatch(&mut self, slot: usize) {
        self.slots[slot].dispatch = Some(self.dispatch_id);
        self.slots[slot].halted_at_launch = false;
        self.publish_snapshot();
    }

    /// Make `slot` report `leader` as its group leader.
    pub fn set_group_leader(&mut self, slot: usize, leader: usize) {
        self.slots[slot].group_leader = leader;
        self.publish_snapshot();
    }

    /// Change whether `slot` was saved in trap-privileged mode.
    pub fn set_priv(&mut self, slot: usize, is_priv: bool) {
        self.slots[slot].descriptor.is_priv = is_priv;
        self.publish_snapshot();
    }

    /// The context save record of a seeded slot.
    pub fn record(&self, slot: usize) -> CwsrRecord {
        CwsrRecord::new(&self.slots[slot].descriptor)
    }

    /// Emulate the hardware stopping a wave: write halt status and stop
    /// reason into its saved state. Takes effect at the next refresh.
    pub fn stop_in_hardware(&mut self, slot: usize, reasons: StopReasons) -> Result<()> {
        self.stop_in_hardware_at(slot, reasons, None)
    }

    /// Like `stop_in_hardware`, but also move the saved pc (the wave ran).
    pub fn stop_in_hardware_at(
        &mut self,
        slot: usize,
        reasons: StopReasons,
        pc: Option<u64>,
    ) -> Result<()> {
        let record = self.record(slot);
        self.memory
            .write_u32(saved_register_address(&record, Regnum::Status)?, STATUS_HALTED);
        self.memory.write_u32(
            saved_register_address(&record, Regnum::Trapsts)?,
            reasons.bits(),
        );
        if let Some(pc) = pc {
            self.memory
                .write_u64(saved_register_address(&record, Regnum::Pc)?, pc);
        }
        Ok(())
    }

    /// Emulate the wave exiting: it disappears from the next snapshot.
    pub fn retire_in_hardware(&mut self, slot: usize) {
        self.slots[slot].present = false;
        self.publish_snapshot();
    }

    fn publish_snapshot(&mut self) {
        // Positions shift when slots retire; remap leader indices onto the
        // surviving entries.
        let position: BTreeMap<usize, usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.present)
            .enumerate()
            .map(|(position, (index, _))| (index, position))
            .collect();

        let snapshot: Vec<WaveSnapshot> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.present)
            .map(|(index, slot)| WaveSnapshot {
                cwsr: slot.descriptor.clone(),
                group_leader: position.get(&slot.group_leader).copied().unwrap_or_else(|| {
                    position[&index]
                }),
                dispatch: slot.dispatch,
                halted_at_launch: slot.halted_at_launch,
            })
            .collect();

        lock(&self.driver.state)
            .snapshots
            .insert(self.queue_id, snapshot);
    }

    /// Refresh and return the visible wave list.
    pub fn wave_list(&mut self) -> Result<Vec<WaveId>> {
        Ok(self.session.wave_list(Some(self.process_id))?.0)
    }

    /// Drain the event queue until empty, marking everything processed.
    pub fn drain_events(&mut self) -> Result<Vec<EventRecord>> {
        let mut drained = Vec::new();
        while let Some((id, kind)) = self.session.next_pending_event(self.process_id)? {
            self.session.event_processed(self.process_id, id)?;
            drained.push(EventRecord { id, kind });
        }
        Ok(drained)
    }
}

/// An event the fixture drained for later assertions.
pub struct EventRecord {
    pub id: crate::types::EventId,
    pub kind: EventKind,
}

use crate::event::EventKind;
