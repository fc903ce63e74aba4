//! The wave state machine.
//!
//! A wave is one SIMD thread group (32 or 64 lanes) that the trap handler
//! has context-saved into a CWSR record. This module drives everything a
//! client can do to a wave: refresh it from a new context save, stop and
//! resume it, park it at an immutable trap instruction, displaced-step it
//! over a breakpoint, terminate it, and answer info queries.
//!
//! Mutating operations run with the wave taken out of the process arena,
//! so every method receives `&mut Process` for memory access, queue state,
//! event creation and the displaced-stepping arena.

mod memory;
mod registers;

use crate::arch::{Architecture, Instruction};
use crate::cache::{CachePolicy, RegisterCache};
use crate::cwsr::CwsrRecord;
use crate::displaced::DisplacedStepping;
use crate::error::{fatal, Error, Result};
use crate::event::{Event, EventKind, EventState};
use crate::mem::ProcessMemory;
use crate::process::{Process, WaveCallbacks};
use crate::regs::{Regnum, TTMP_COUNT};
pub use crate::types::Visibility;
use crate::types::{
    AgentId, DispatchId, DisplacedSteppingId, EventId, Exceptions, GlobalAddress, OsExceptionMask,
    QueueId, StopReasons, WatchpointId, WaveId, WaveInfo, WaveInfoValue, WaveState,
};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

pub struct Wave {
    id: WaveId,
    queue: QueueId,
    agent: AgentId,
    dispatch: Option<DispatchId>,
    architecture: Arc<dyn Architecture>,
    callbacks: Arc<dyn WaveCallbacks>,
    lane_count: u32,
    state: WaveState,
    visibility: Visibility,
    stop_reason: StopReasons,
    stop_requested: bool,
    cwsr: Option<CwsrRecord>,
    group_leader: WaveId,
    register_cache: RegisterCache,
    is_parked: bool,
    parked_pc: GlobalAddress,
    group_ids: [u32; 3],
    wave_in_group: u32,
    last_stopped_pc: GlobalAddress,
    last_stop_event: Option<EventId>,
    displaced_stepping: Option<DisplacedSteppingId>,
}

impl Wave {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: WaveId,
        queue: QueueId,
        agent: AgentId,
        dispatch: Option<DispatchId>,
        architecture: Arc<dyn Architecture>,
        callbacks: Arc<dyn WaveCallbacks>,
        lane_count: u32,
        visibility: Visibility,
    ) -> Self {
        assert!(lane_count == 32 || lane_count == 64);
        Self {
            id,
            queue,
            agent,
            dispatch,
            architecture,
            callbacks,
            lane_count,
            state: WaveState::Run,
            visibility,
            stop_reason: StopReasons::empty(),
            stop_requested: false,
            cwsr: None,
            group_leader: id,
            register_cache: RegisterCache::new(CachePolicy::WriteBack),
            is_parked: false,
            parked_pc: 0,
            group_ids: [0; 3],
            wave_in_group: 0,
            last_stopped_pc: 0,
            last_stop_event: None,
            displaced_stepping: None,
        }
    }

    pub fn id(&self) -> WaveId {
        self.id
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent
    }

    pub fn dispatch_id(&self) -> Option<DispatchId> {
        self.dispatch
    }

    pub fn lane_count(&self) -> u32 {
        self.lane_count
    }

    pub fn state(&self) -> WaveState {
        self.state
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn stop_reason(&self) -> StopReasons {
        self.stop_reason
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_parked(&self) -> bool {
        self.is_parked
    }

    pub fn displaced_stepping_id(&self) -> Option<DisplacedSteppingId> {
        self.displaced_stepping
    }

    pub fn last_stopped_pc(&self) -> GlobalAddress {
        self.last_stopped_pc
    }

    pub(crate) fn architecture(&self) -> Arc<dyn Architecture> {
        Arc::clone(&self.architecture)
    }

    pub(crate) fn cwsr(&self) -> Result<&CwsrRecord> {
        self.cwsr
            .as_ref()
            .ok_or_else(|| fatal!("{} has not been updated yet", self.id))
    }

    pub(crate) fn assign_dispatch(&mut self, dispatch: Option<DispatchId>) {
        self.dispatch = dispatch;
    }

    pub(crate) fn flush_register_cache(&mut self, memory: &mut dyn ProcessMemory) -> Result<()> {
        self.register_cache.flush(memory)
    }

    // ---- derived state --------------------------------------------------

    /// The wave's program counter. Served from the parked pc while parked.
    pub fn pc(&mut self, process: &mut Process) -> Result<GlobalAddress> {
        self.read_register_u64(process, Regnum::Pc)
    }

    /// The execution mask, one bit per lane.
    pub fn exec_mask(&mut self, process: &mut Process) -> Result<u64> {
        match self.lane_count {
            32 => Ok(self.read_register_u32(process, Regnum::Exec32)? as u64),
            64 => self.read_register_u64(process, Regnum::Exec64),
            lanes => Err(fatal!("not a valid lane count for the exec mask: {}", lanes)),
        }
    }

    /// The instruction at `pc + pc_adjust`, or `None` when the bytes cannot
    /// be read (e.g. the pc points at unmapped memory).
    pub fn instruction_at_pc(
        &mut self,
        process: &mut Process,
        pc_adjust: u64,
    ) -> Result<Option<Instruction>> {
        let size = self.architecture.largest_instruction_size();
        let mut bytes = vec![0u8; size];
        let pc = self.pc(process)?;
        match process
            .memory
            .read_global_memory_partial(pc.wrapping_add(pc_adjust), &mut bytes)
        {
            Ok(0) | Err(_) => Ok(None),
            Ok(read) => {
                bytes.truncate(read);
                Ok(Some(Instruction::new(bytes)))
            }
        }
    }

    // ---- visibility -----------------------------------------------------

    /// Change whether the wave is reported to the client. Leaving the
    /// halted-at-launch state clears the hardware halt bit so the wave can
    /// start executing.
    pub(crate) fn set_visibility(
        &mut self,
        process: &mut Process,
        visibility: Visibility,
    ) -> Result<()> {
        if self.visibility == visibility {
            return Ok(());
        }

        if self.visibility == Visibility::HiddenHaltedAtLaunch {
            let architecture = self.architecture();
            assert!(
                self.state == WaveState::Run && architecture.wave_get_halt(self, process)?,
                "a wave hidden at launch is halted and in the run state"
            );
            architecture.wave_set_halt(self, process, false)?;
        }

        self.visibility = visibility;

        // The set of waves reported by the process changed with this wave's
        // visibility.
        process.set_waves_changed();
        Ok(())
    }

    // ---- parking --------------------------------------------------------

    /// Redirect a stopped wave's pc to an immutable trap instruction. From
    /// here on pc reads and writes are served from the parked pc and the
    /// saved pc in the CWSR record is untouched.
    pub(crate) fn park(&mut self, process: &mut Process) -> Result<()> {
        assert!(self.state == WaveState::Stop, "cannot park a running wave");
        assert!(!self.is_parked, "already parked");

        self.parked_pc = self.pc(process)?;

        let parked_pc = self.callbacks.park_instruction_address();
        self.write_register_u64(process, Regnum::Pc, parked_pc)?;

        self.is_parked = true;
        log::debug!("parked {} (pc={:#x})", self.id, self.parked_pc);
        Ok(())
    }

    /// Restore the real pc into the CWSR record before the wave runs again.
    pub(crate) fn unpark(&mut self, process: &mut Process) -> Result<()> {
        assert!(self.state != WaveState::Stop, "cannot unpark a stopped wave");
        assert!(self.is_parked, "not parked");

        let saved_pc = self.pc(process)?;
        self.is_parked = false;
        self.write_register_u64(process, Regnum::Pc, saved_pc)?;

        log::debug!("unparked {} (pc={:#x})", self.id, saved_pc);
        Ok(())
    }

    // ---- termination ----------------------------------------------------

    /// Release the wave at an immutable terminating instruction and hide
    /// it. The hardware retires the wave; it is never reported again.
    pub(crate) fn terminate(&mut self, process: &mut Process) -> Result<()> {
        if let Some(id) = self.displaced_stepping.take() {
            process.displaced_release(id)?;
        }

        let terminate_pc = self.callbacks.terminating_instruction_address();
        self.write_register_u64(process, Regnum::Pc, terminate_pc)?;

        self.set_visibility(process, Visibility::HiddenAtTerminatingInstruction)?;
        self.set_state(process, WaveState::Run, Exceptions::empty())
    }

    // ---- displaced stepping ---------------------------------------------

    /// Begin stepping over the breakpoint at the current pc.
    ///
    /// `saved_instruction_bytes` are the bytes the breakpoint displaced;
    /// the rest of the original instruction is read from memory behind the
    /// breakpoint. An existing buffer for the same `(queue, pc)` is shared.
    pub(crate) fn displaced_stepping_start(
        &mut self,
        process: &mut Process,
        saved_instruction_bytes: &[u8],
    ) -> Result<()> {
        assert!(self.displaced_stepping.is_none(), "already displaced stepping");
        assert!(self.state == WaveState::Stop, "not stopped");

        let architecture = self.architecture();
        let pc = self.pc(process)?;

        let id = match process.find_displaced(self.queue, pc) {
            Some(id) => {
                process.displaced_retain(id)?;
                id
            }
            None => {
                // Reconstitute the original instruction: the client's saved
                // bytes, then whatever follows the breakpoint in memory.
                let breakpoint_size = architecture.breakpoint_instruction().len();
                assert!(saved_instruction_bytes.len() >= breakpoint_size);

                let mut bytes = vec![0u8; architecture.largest_instruction_size()];
                bytes[..breakpoint_size]
                    .copy_from_slice(&saved_instruction_bytes[..breakpoint_size]);
                let read = process.memory.read_global_memory_partial(
                    pc + breakpoint_size as u64,
                    &mut bytes[breakpoint_size..],
                )?;
                bytes.truncate(breakpoint_size + read);

                let original_instruction = Instruction::new(bytes);
                let simulate = architecture.can_simulate(self, &original_instruction);

                if !architecture.can_execute_displaced(self, &original_instruction) && !simulate {
                    // Neither displaced-steppable nor simulatable; the
                    // client has to inline-step it.
                    return Err(Error::IllegalInstruction);
                }

                let instruction_buffer = if simulate {
                    None
                } else {
                    let buffer = self
                        .callbacks
                        .allocate_instruction_buffer(original_instruction.size())?;
                    process
                        .memory
                        .write_global_memory(buffer.address, original_instruction.data())
                        .map_err(|_| fatal!("could not write the displaced instruction"))?;
                    Some(buffer)
                };

                process.insert_displaced(DisplacedStepping::new(
                    self.queue,
                    pc,
                    original_instruction,
                    simulate,
                    instruction_buffer,
                ))
            }
        };

        let (is_simulated, from, to) = {
            let ds = process.displaced(id)?;
            (ds.is_simulated(), ds.from(), ds.to())
        };
        if !is_simulated {
            let to = to.ok_or_else(|| fatal!("{} has no scratch pc", id))?;
            self.write_register_u64(process, Regnum::Pc, to)?;
            log::info!(
                "changing {}'s pc from {:#x} to {:#x} (started {})",
                self.id,
                from,
                to,
                id
            );
        }

        self.displaced_stepping = Some(id);
        Ok(())
    }

    /// Finish a displaced step: map the pc back from the scratch buffer to
    /// the original instruction stream and release the buffer.
    pub(crate) fn displaced_stepping_complete(&mut self, process: &mut Process) -> Result<()> {
        let id = self
            .displaced_stepping
            .ok_or_else(|| fatal!("{} is not displaced stepping", self.id))?;
        assert!(self.state == WaveState::Stop, "not stopped");

        let (is_simulated, from, to) = {
            let ds = process.displaced(id)?;
            (ds.is_simulated(), ds.from(), ds.to())
        };
        if !is_simulated {
            let to = to.ok_or_else(|| fatal!("{} has no scratch pc", id))?;

            let displaced_pc = self.pc(process)?;
            let restored_pc = displaced_pc.wrapping_add(from).wrapping_sub(to);
            self.write_register_u64(process, Regnum::Pc, restored_pc)?;

            log::info!(
                "changing {}'s pc from {:#x} to {:#x} ({} {})",
                self.id,
                displaced_pc,
                restored_pc,
                if displaced_pc == to { "aborted" } else { "completed" },
                id
            );
        }

        process.displaced_release(id)?;
        self.displaced_stepping = None;
        Ok(())
    }

    // ---- context-save refresh -------------------------------------------

    /// Adopt a new context-save record. Called by the queue refresh path
    /// every time the owning queue is suspended.
    pub(crate) fn update(
        &mut self,
        process: &mut Process,
        group_leader: WaveId,
        record: CwsrRecord,
    ) -> Result<()> {
        assert!(process.queue(self.queue)?.is_suspended());
        let first_update = self.cwsr.is_none();

        let (cache_begin, cache_len) = record.cached_window();
        let (record_begin, record_end) = (record.begin(), record.end());
        self.cwsr = Some(record);
        self.group_leader = group_leader;

        let prev_state = self.state;
        if prev_state != WaveState::Stop {
            // The wave was running since the last suspension; its saved
            // registers may all have changed.
            self.register_cache.reset(cache_begin, cache_len);

            // Zero-initialize the ttmp registers if the hardware didn't.
            // Some of them decide whether the trap handler stopped the wave
            // for an exception or a trap.
            if !process.ttmps_setup_enabled() && first_update {
                for ttmp in 0..TTMP_COUNT as u8 {
                    self.write_register_u32(process, Regnum::Ttmp(ttmp), 0)?;
                }
            }

            let architecture = self.architecture();
            let (state, stop_reason) = architecture.wave_get_state(self, process)?;
            self.state = state;
            self.stop_reason = stop_reason;
        } else {
            // The wave was stopped, so the cached window is authoritative;
            // only the record's address may have moved.
            self.register_cache.relocate(cache_begin);
        }

        let pc = self.pc(process)?;
        log::debug!(
            "{} {}{} (pc={:#x}, state={}) context_save:[{:#x}..{:#x}), register_cache=cache_{}",
            if first_update { "created" } else { "updated" },
            if self.visibility != Visibility::Visible {
                "invisible "
            } else {
                ""
            },
            self.id,
            pc,
            self.state,
            record_begin,
            record_end,
            self.register_cache.id()
        );

        // The wave was running, and this update discovered it stopped.
        if prev_state != WaveState::Stop && self.state == WaveState::Stop {
            if self.architecture.park_stopped_waves() {
                self.park(process)?;
            }

            if self.visibility == Visibility::Visible && !self.stop_reason.is_empty() {
                self.raise_event(process, EventKind::WaveStop(self.id));
            }
        }

        // First sight of this wave: persist its handle for re-association
        // and latch the immutable ttmp state.
        if first_update {
            let wave_id = self.id.0;
            self.write_register_u64(process, Regnum::WaveId, wave_id)?;

            let mut grid = [0u8; 12];
            self.read_register(process, Regnum::DispatchGrid, 0, &mut grid)?;
            for (i, chunk) in grid.chunks_exact(4).enumerate() {
                self.group_ids[i] = LittleEndian::read_u32(chunk);
            }

            self.wave_in_group = self.read_register_u32(process, Regnum::WaveInGroup)?;
        }
        Ok(())
    }

    // ---- state transitions ----------------------------------------------

    /// Drive the wave to a new state, optionally delivering exceptions on
    /// release.
    pub(crate) fn set_state(
        &mut self,
        process: &mut Process,
        state: WaveState,
        exceptions: Exceptions,
    ) -> Result<()> {
        assert!(
            exceptions.is_empty() || state != WaveState::Stop,
            "raising an exception requires the wave to be resumed"
        );

        let architecture = self.architecture();
        let prev_state = self.state;

        if state == prev_state && exceptions.is_empty() {
            return Ok(());
        }

        assert!(
            self.displaced_stepping.is_none() || state != WaveState::Run,
            "displaced-stepping waves can only be stopped or single-stepped"
        );

        self.stop_requested = state == WaveState::Stop;

        let instruction = if state == WaveState::SingleStep && exceptions.is_empty() {
            self.instruction_at_pc(process, 0)?
        } else {
            None
        };

        // Single-stepping a terminating instruction does not trap on
        // completion, so the wave is terminated right away and the command
        // reported as terminated.
        if state == WaveState::SingleStep && exceptions.is_empty() {
            let terminating = if let Some(id) = self.displaced_stepping {
                architecture
                    .is_terminating_instruction(process.displaced(id)?.original_instruction())
            } else {
                instruction
                    .as_ref()
                    .map_or(false, |i| architecture.is_terminating_instruction(i))
            };
            if terminating {
                self.terminate(process)?;
                self.raise_event(process, EventKind::WaveCommandTerminated(self.id));
                return Ok(());
            }
        }

        if self.visibility == Visibility::Visible {
            let pc = self.pc(process)?;
            log::info!(
                "changing {}'s state from {} to {}{} (pc={:#x})",
                self.id,
                prev_state,
                state,
                if exceptions.is_empty() {
                    String::new()
                } else {
                    format!(" with {:?}", exceptions)
                },
                pc
            );
        }

        architecture.wave_set_state(self, process, state, exceptions)?;
        self.state = state;

        if architecture.park_stopped_waves() {
            if state == WaveState::Stop {
                self.park(process)?;
            } else {
                self.unpark(process)?;
            }
        }

        if state != WaveState::Stop {
            assert!(
                prev_state == WaveState::Stop,
                "cannot resume an already running wave"
            );

            // The last known pc before release; used to tell genuine
            // single-step completions from spurious trap re-entries.
            self.last_stopped_pc = self.pc(process)?;
            self.stop_reason = StopReasons::empty();
        } else if prev_state != WaveState::Stop {
            // A stop was requested and the wave was not already stopped;
            // acknowledge with an event.
            self.stop_reason = StopReasons::empty();

            assert!(
                self.visibility == Visibility::Visible,
                "cannot request a hidden wave to stop"
            );

            self.raise_event(
                process,
                if prev_state == WaveState::SingleStep {
                    EventKind::WaveCommandTerminated(self.id)
                } else {
                    EventKind::WaveStop(self.id)
                },
            );
        }

        // A single-stepped instruction that the architecture can simulate
        // never reaches hardware.
        if state == WaveState::SingleStep && exceptions.is_empty() {
            let simulated = if let Some(id) = self.displaced_stepping {
                let (is_simulated, from, original) = {
                    let ds = process.displaced(id)?;
                    (ds.is_simulated(), ds.from(), ds.original_instruction().clone())
                };
                if is_simulated {
                    architecture.simulate(self, process, from, &original)?
                } else {
                    false
                }
            } else if let Some(instruction) = &instruction {
                if architecture.can_simulate(self, instruction) {
                    let pc = self.pc(process)?;
                    architecture.simulate(self, process, pc, instruction)?
                } else {
                    false
                }
            } else {
                false
            };

            if simulated {
                let (new_state, stop_reason) = architecture.wave_get_state(self, process)?;
                self.state = new_state;
                self.stop_reason = stop_reason;

                if architecture.park_stopped_waves() {
                    self.park(process)?;
                }

                self.raise_event(process, EventKind::WaveStop(self.id));
            }
        }

        if !exceptions.is_empty() {
            let mut os_exceptions = OsExceptionMask::empty();
            let mut remaining = exceptions.bits();
            while remaining != 0 {
                let one = remaining ^ (remaining & (remaining - 1));
                os_exceptions |=
                    self.convert_one_exception(process, Exceptions::from_bits_retain(one))?;
                remaining ^= one;
            }

            // A wave only sends queue exceptions, sometimes combined with a
            // device memory violation.
            assert!(os_exceptions.intersects(OsExceptionMask::QUEUE_MASK));
            process.send_exceptions(os_exceptions, self.queue)?;
        }

        // If no stopped wave on this agent holds a memory violation any
        // more, clear the device-scoped bit so it isn't attributed to the
        // command processor or a DMA engine.
        if process
            .agent(self.agent)?
            .exceptions()
            .contains(OsExceptionMask::DEVICE_MEMORY_VIOLATION)
            && state != WaveState::Stop
        {
            let still_held = process.waves().any(|wave| {
                wave.agent_id() == self.agent
                    && wave.state() == WaveState::Stop
                    && wave.stop_reason().contains(StopReasons::MEMORY_VIOLATION)
            });
            if !still_held {
                process
                    .agent_mut(self.agent)?
                    .clear_exceptions(OsExceptionMask::DEVICE_MEMORY_VIOLATION);
            }
        }

        Ok(())
    }

    fn convert_one_exception(
        &self,
        process: &Process,
        exception: Exceptions,
    ) -> Result<OsExceptionMask> {
        if exception == Exceptions::ABORT {
            return Ok(OsExceptionMask::QUEUE_WAVE_ABORT);
        }
        if exception == Exceptions::TRAP {
            return Ok(OsExceptionMask::QUEUE_WAVE_TRAP);
        }
        if exception == Exceptions::MATH_ERROR {
            return Ok(OsExceptionMask::QUEUE_WAVE_MATH_ERROR);
        }
        if exception == Exceptions::ILLEGAL_INSTRUCTION {
            return Ok(OsExceptionMask::QUEUE_WAVE_ILLEGAL_INSTRUCTION);
        }
        if exception == Exceptions::MEMORY_VIOLATION {
            return Ok(OsExceptionMask::QUEUE_WAVE_MEMORY_VIOLATION
                | (process.agent(self.agent)?.exceptions()
                    & OsExceptionMask::DEVICE_MEMORY_VIOLATION));
        }
        if exception == Exceptions::APERTURE_VIOLATION {
            return Ok(OsExceptionMask::QUEUE_WAVE_APERTURE_VIOLATION);
        }
        Err(fatal!("not a valid exception"))
    }

    // ---- events & client-visible state ----------------------------------

    pub(crate) fn raise_event(&mut self, process: &mut Process, kind: EventKind) {
        let id = process.create_event(kind);
        if matches!(
            kind,
            EventKind::WaveStop(_) | EventKind::WaveCommandTerminated(_)
        ) {
            self.last_stop_event = Some(id);
        }
    }

    pub(crate) fn last_stop_event<'a>(&self, process: &'a Process) -> Option<&'a Event> {
        assert!(self.state == WaveState::Stop);
        self.last_stop_event.and_then(|id| process.event(id))
    }

    /// The state the client sees. A stop is only visible once its event has
    /// been reported; until then the wave appears to still be in its
    /// pre-stop state.
    pub fn client_visible_state(&self, process: &Process) -> WaveState {
        if self.state != WaveState::Stop {
            return self.state;
        }

        match self.last_stop_event(process) {
            None => WaveState::Stop,
            Some(event) if event.state() >= EventState::Reported => WaveState::Stop,
            Some(_) => {
                if self.stop_reason.contains(StopReasons::SINGLE_STEP) {
                    WaveState::SingleStep
                } else {
                    WaveState::Run
                }
            }
        }
    }

    // ---- info queries ---------------------------------------------------

    pub(crate) fn get_info(
        &mut self,
        process: &mut Process,
        query: WaveInfo,
    ) -> Result<WaveInfoValue> {
        match query {
            WaveInfo::State => Ok(WaveInfoValue::State(self.client_visible_state(process))),
            WaveInfo::StopReason => Ok(WaveInfoValue::StopReason(self.stop_reason)),
            WaveInfo::Dispatch => match self.dispatch.and_then(|id| process.dispatch(id)) {
                Some(dispatch) => Ok(WaveInfoValue::Dispatch(dispatch.id())),
                None => Err(Error::NotAvailable),
            },
            WaveInfo::Queue => Ok(WaveInfoValue::Queue(self.queue)),
            WaveInfo::Agent => Ok(WaveInfoValue::Agent(self.agent)),
            WaveInfo::Process => Ok(WaveInfoValue::Process(process.id())),
            WaveInfo::Architecture => Ok(WaveInfoValue::Architecture(self.architecture.id())),
            WaveInfo::Pc => Ok(WaveInfoValue::Pc(self.pc(process)?)),
            WaveInfo::ExecMask => Ok(WaveInfoValue::ExecMask(self.exec_mask(process)?)),
            WaveInfo::WorkGroupCoord => {
                if self.dispatch.is_none() {
                    return Err(Error::NotAvailable);
                }
                Ok(WaveInfoValue::WorkGroupCoord(self.group_ids))
            }
            WaveInfo::WaveNumberInWorkGroup => {
                if self.dispatch.is_none() {
                    return Err(Error::NotAvailable);
                }
                Ok(WaveInfoValue::WaveNumberInWorkGroup(self.wave_in_group))
            }
            WaveInfo::Watchpoints => {
                let architecture = self.architecture();
                let os_watch_ids = architecture.triggered_watchpoints(self, process)?;
                let watchpoints: Result<Vec<WatchpointId>> = os_watch_ids
                    .iter()
                    .map(|&os_watch_id| {
                        process.find_watchpoint(os_watch_id).ok_or_else(|| {
                            fatal!("watch_{} is not bound on {}", os_watch_id, self.agent)
                        })
                    })
                    .collect();
                Ok(WaveInfoValue::Watchpoints(watchpoints?))
            }
            WaveInfo::LaneCount => Ok(WaveInfoValue::LaneCount(self.lane_count)),
        }
    }
}
