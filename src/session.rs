//! Public API surface.
//!
//! A [`DebugSession`] is the library instance: it owns every attached
//! process and exposes the client-facing verbs (stop, resume, info queries,
//! wave enumeration, register and memory access, displaced stepping, event
//! consumption). Every verb validates its preconditions against the
//! client-visible wave state, suspends the owning queue for the mutating
//! part, and re-looks the wave up after suspension because the wave may
//! have exited while the queue was still running.

use crate::error::{Error, Result};
use crate::event::{EventKind, EventState};
use crate::mem::ProcessMemory;
use crate::process::{OsDriver, Process};
use crate::regs::Regnum;
use crate::types::{
    AddressSpace, AddressSpaceKind, EventId, Exceptions, LaneId, ProcessId, ResumeMode,
    SegmentAddress, WaveId, WaveInfo, WaveInfoValue, WaveState,
};
use std::collections::BTreeMap;

#[derive(Default)]
pub struct DebugSession {
    initialized: bool,
    processes: BTreeMap<ProcessId, Process>,
}

impl DebugSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the library. All other verbs fail until this is called.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::InvalidArgument("already initialized"));
        }
        self.initialized = true;
        log::debug!("initialized");
        Ok(())
    }

    /// Tear the library down, detaching every process.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        for id in ids {
            self.detach_process(id)?;
        }
        self.initialized = false;
        log::debug!("finalized");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    // ---- process attachment ---------------------------------------------

    pub fn attach_process(
        &mut self,
        memory: Box<dyn ProcessMemory>,
        driver: Box<dyn OsDriver>,
    ) -> Result<ProcessId> {
        self.ensure_initialized()?;
        let process = Process::new(memory, driver);
        let id = process.id();
        log::debug!("attached {}", id);
        self.processes.insert(id, process);
        Ok(id)
    }

    /// Detach a process: queues become invalid and all waves are retired.
    /// Outstanding displaced-stepping buffers are released on this path.
    pub fn detach_process(&mut self, id: ProcessId) -> Result<()> {
        self.ensure_initialized()?;
        let mut process = self
            .processes
            .remove(&id)
            .ok_or(Error::InvalidProcessId(id))?;
        process.detach()?;
        log::debug!("detached {}", id);
        Ok(())
    }

    /// Access a process for topology setup (agents, queues, dispatches,
    /// watchpoints, flags).
    pub fn process_mut(&mut self, id: ProcessId) -> Result<&mut Process> {
        self.ensure_initialized()?;
        self.processes
            .get_mut(&id)
            .ok_or(Error::InvalidProcessId(id))
    }

    fn find_wave_process(&self, wave: WaveId) -> Option<ProcessId> {
        self.processes
            .values()
            .find(|process| process.find_wave(wave).is_some())
            .map(Process::id)
    }

    fn wave_process_mut(&mut self, wave: WaveId) -> Result<&mut Process> {
        let id = self
            .find_wave_process(wave)
            .ok_or(Error::InvalidWaveId(wave))?;
        self.processes
            .get_mut(&id)
            .ok_or(Error::InvalidWaveId(wave))
    }

    // ---- wave control ---------------------------------------------------

    /// Request a wave to stop. The stop is acknowledged by a `WaveStop`
    /// event once the hardware has halted the wave.
    pub fn wave_stop(&mut self, wave_id: WaveId) -> Result<()> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) == WaveState::Stop {
                return Err(Error::WaveStopped(wave_id));
            }
            if wave.stop_requested() {
                return Err(Error::WaveOutstandingStop(wave_id));
            }
            wave.queue_id()
        };

        process.with_suspended_queue(queue, "stop wave", |process| {
            // The wave may have exited while its queue was still running.
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result = wave.set_state(process, WaveState::Stop, Exceptions::empty());
            process.put_wave(wave);
            result
        })
    }

    /// Resume a stopped wave, optionally delivering exceptions.
    pub fn wave_resume(
        &mut self,
        wave_id: WaveId,
        resume_mode: ResumeMode,
        exceptions: Exceptions,
    ) -> Result<()> {
        self.ensure_initialized()?;

        if exceptions.bits() & !Exceptions::all().bits() != 0 {
            return Err(Error::InvalidArgument("unrecognized exception bits"));
        }

        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;

            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }

            // The wave is not resumable while its stop event is unprocessed;
            // resuming would lose the stop.
            if let Some(event) = wave.last_stop_event(process) {
                if event.state() < EventState::Processed {
                    return Err(Error::WaveNotResumable(wave_id));
                }
            }

            if wave.displaced_stepping_id().is_some() && resume_mode != ResumeMode::SingleStep {
                return Err(Error::ResumeDisplacedStepping);
            }

            wave.queue_id()
        };

        process.with_suspended_queue(queue, "resume wave", |process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let state = match resume_mode {
                ResumeMode::Normal => WaveState::Run,
                ResumeMode::SingleStep => WaveState::SingleStep,
            };
            let result = wave.set_state(process, state, exceptions);
            process.put_wave(wave);
            result
        })
    }

    /// Answer an info query about a wave.
    pub fn wave_get_info(&mut self, wave_id: WaveId, query: WaveInfo) -> Result<WaveInfoValue> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            match query {
                WaveInfo::StopReason
                | WaveInfo::Pc
                | WaveInfo::ExecMask
                | WaveInfo::Watchpoints => {
                    if wave.client_visible_state(process) != WaveState::Stop {
                        return Err(Error::WaveNotStopped(wave_id));
                    }
                }
                _ => {}
            }
        }

        let mut wave = process.take_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
        let result = wave.get_info(process, query);
        process.put_wave(wave);
        result
    }

    /// Enumerate the waves of one process (or all processes), refreshing
    /// the wave lists from the hardware first. Returns the wave handles and
    /// whether the set changed since the last enumeration.
    pub fn wave_list(&mut self, process: Option<ProcessId>) -> Result<(Vec<WaveId>, bool)> {
        self.ensure_initialized()?;

        let ids: Vec<ProcessId> = match process {
            Some(id) => {
                if !self.processes.contains_key(&id) {
                    return Err(Error::InvalidProcessId(id));
                }
                vec![id]
            }
            None => self.processes.keys().copied().collect(),
        };

        let mut waves = Vec::new();
        let mut changed = false;

        for id in ids {
            let process = self.processes.get_mut(&id).ok_or(Error::InvalidProcessId(id))?;
            process.update_queues()?;

            let queues = process.running_queues();
            process.suspend_queues(&queues, "refresh wave list")?;

            changed |= process.take_waves_changed();
            waves.extend(
                process
                    .waves()
                    .filter(|wave| wave.visibility() == crate::wave::Visibility::Visible)
                    .map(|wave| wave.id()),
            );

            if process.forward_progress_needed() {
                process.resume_queues(&queues, "refresh wave list")?;
            }
        }

        waves.sort();
        Ok((waves, changed))
    }

    // ---- register access ------------------------------------------------

    /// Read part of a register of a stopped wave.
    pub fn read_register(
        &mut self,
        wave_id: WaveId,
        regnum: Regnum,
        offset: usize,
        value: &mut [u8],
    ) -> Result<()> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let (queue, direct) = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            if !wave.is_register_available(regnum) && !matches!(regnum, Regnum::Sgpr(_) | Regnum::Vgpr(_)) {
                return Err(Error::InvalidArgument("register is not available"));
            }
            (wave.queue_id(), wave.register_access_is_direct(regnum))
        };

        let mut read = |process: &mut Process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result = wave.read_register(process, regnum, offset, value);
            process.put_wave(wave);
            result
        };

        if direct {
            process.with_suspended_queue(queue, "read register", read)
        } else {
            read(process)
        }
    }

    /// Write part of a register of a stopped wave.
    pub fn write_register(
        &mut self,
        wave_id: WaveId,
        regnum: Regnum,
        offset: usize,
        value: &[u8],
    ) -> Result<()> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let (queue, direct) = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            if !wave.is_register_available(regnum) && !matches!(regnum, Regnum::Sgpr(_) | Regnum::Vgpr(_)) {
                return Err(Error::InvalidArgument("register is not available"));
            }
            (wave.queue_id(), wave.register_access_is_direct(regnum))
        };

        let write = |process: &mut Process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result = wave.write_register(process, regnum, offset, value);
            process.put_wave(wave);
            result
        };

        if direct {
            process.with_suspended_queue(queue, "write register", write)
        } else {
            write(process)
        }
    }

    // ---- memory access --------------------------------------------------

    /// Read from one of a stopped wave's segment address spaces. Returns
    /// the number of bytes read.
    pub fn read_segment_memory(
        &mut self,
        wave_id: WaveId,
        address_space: AddressSpace,
        lane_id: Option<LaneId>,
        segment_address: SegmentAddress,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            wave.queue_id()
        };

        let mut xfer = |process: &mut Process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result =
                wave.read_segment_memory(process, address_space, lane_id, segment_address, buf);
            process.put_wave(wave);
            result
        };

        // Local memory lives in the context save area and is only coherent
        // while the queue is suspended.
        if address_space.kind == AddressSpaceKind::Local {
            process.with_suspended_queue(queue, "read memory", xfer)
        } else {
            xfer(process)
        }
    }

    /// Write to one of a stopped wave's segment address spaces. Returns the
    /// number of bytes written.
    pub fn write_segment_memory(
        &mut self,
        wave_id: WaveId,
        address_space: AddressSpace,
        lane_id: Option<LaneId>,
        segment_address: SegmentAddress,
        buf: &[u8],
    ) -> Result<usize> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            wave.queue_id()
        };

        let xfer = |process: &mut Process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result =
                wave.write_segment_memory(process, address_space, lane_id, segment_address, buf);
            process.put_wave(wave);
            result
        };

        if address_space.kind == AddressSpaceKind::Local {
            process.with_suspended_queue(queue, "write memory", xfer)
        } else {
            xfer(process)
        }
    }

    // ---- displaced stepping ---------------------------------------------

    /// Begin displaced-stepping a stopped wave over the breakpoint at its
    /// pc. `saved_instruction_bytes` are the original bytes the breakpoint
    /// replaced.
    pub fn displaced_stepping_start(
        &mut self,
        wave_id: WaveId,
        saved_instruction_bytes: &[u8],
    ) -> Result<()> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            if wave.displaced_stepping_id().is_some() {
                return Err(Error::InvalidArgument("displaced stepping already active"));
            }
            wave.queue_id()
        };

        process.with_suspended_queue(queue, "displaced stepping start", |process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result = wave.displaced_stepping_start(process, saved_instruction_bytes);
            process.put_wave(wave);
            result
        })
    }

    /// Complete a displaced step: restore the wave's pc into the original
    /// instruction stream and release the shared buffer.
    pub fn displaced_stepping_complete(&mut self, wave_id: WaveId) -> Result<()> {
        self.ensure_initialized()?;
        let process = self.wave_process_mut(wave_id)?;

        let queue = {
            let wave = process.find_wave(wave_id).ok_or(Error::InvalidWaveId(wave_id))?;
            if wave.client_visible_state(process) != WaveState::Stop {
                return Err(Error::WaveNotStopped(wave_id));
            }
            if wave.displaced_stepping_id().is_none() {
                return Err(Error::InvalidArgument("no displaced stepping in progress"));
            }
            wave.queue_id()
        };

        process.with_suspended_queue(queue, "displaced stepping complete", |process| {
            let Some(mut wave) = process.take_wave(wave_id) else {
                return Err(Error::InvalidWaveId(wave_id));
            };
            let result = wave.displaced_stepping_complete(process);
            process.put_wave(wave);
            result
        })
    }

    // ---- events ---------------------------------------------------------

    /// Dequeue the next pending event of a process, marking it reported.
    pub fn next_pending_event(
        &mut self,
        process: ProcessId,
    ) -> Result<Option<(EventId, EventKind)>> {
        self.ensure_initialized()?;
        let process = self
            .processes
            .get_mut(&process)
            .ok_or(Error::InvalidProcessId(process))?;
        Ok(process.next_pending_event())
    }

    /// Acknowledge a reported event.
    pub fn event_processed(&mut self, process: ProcessId, event: EventId) -> Result<()> {
        self.ensure_initialized()?;
        let process = self
            .processes
            .get_mut(&process)
            .ok_or(Error::InvalidProcessId(process))?;
        if process.mark_event_processed(event) {
            Ok(())
        } else {
            Err(Error::InvalidEventId(event))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::testing::{
        Fixture, OP_BRANCH, OP_BREAKPOINT, OP_ENDPGM, OP_NO_DISPLACED, PARK_ADDRESS,
        SCRATCH_BASE, TERMINATE_ADDRESS,
    };
    use crate::types::{OsExceptionMask, StopReasons};

    fn pc_of(fx: &mut Fixture, wave: WaveId) -> u64 {
        match fx.session.wave_get_info(wave, WaveInfo::Pc).unwrap() {
            WaveInfoValue::Pc(pc) => pc,
            other => panic!("unexpected info value {:?}", other),
        }
    }

    fn state_of(fx: &mut Fixture, wave: WaveId) -> WaveState {
        match fx.session.wave_get_info(wave, WaveInfo::State).unwrap() {
            WaveInfoValue::State(state) => state,
            other => panic!("unexpected info value {:?}", other),
        }
    }

    #[test]
    fn uninitialized_session_rejects_all_verbs() {
        let mut session = DebugSession::new();
        assert!(matches!(session.wave_list(None), Err(Error::NotInitialized)));
        assert!(matches!(
            session.wave_stop(WaveId(1)),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn unknown_wave_is_rejected() {
        let mut fx = Fixture::new().unwrap();
        assert!(matches!(
            fx.session.wave_stop(WaveId(0xDEAD)),
            Err(Error::InvalidWaveId(_))
        ));
    }

    // S1: breakpoint stop, then resume.
    #[test]
    fn breakpoint_stop_then_resume() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x1000, Some(StopReasons::BREAKPOINT)).unwrap();

        let (waves, changed) = fx.session.wave_list(Some(fx.process_id)).unwrap();
        assert_eq!(waves.len(), 1);
        assert!(changed);
        let wave = waves[0];

        // The stop is not client-visible until the event is reported.
        assert_eq!(state_of(&mut fx, wave), WaveState::Run);

        let (event, kind) = fx.session.next_pending_event(fx.process_id).unwrap().unwrap();
        assert_eq!(kind, EventKind::WaveStop(wave));

        assert_eq!(state_of(&mut fx, wave), WaveState::Stop);
        assert_eq!(pc_of(&mut fx, wave), 0x1000);
        match fx.session.wave_get_info(wave, WaveInfo::StopReason).unwrap() {
            WaveInfoValue::StopReason(reasons) => {
                assert!(reasons.contains(StopReasons::BREAKPOINT))
            }
            other => panic!("unexpected info value {:?}", other),
        }

        fx.session.event_processed(fx.process_id, event).unwrap();
        fx.session
            .wave_resume(wave, ResumeMode::Normal, Exceptions::empty())
            .unwrap();

        assert_eq!(state_of(&mut fx, wave), WaveState::Run);
        assert!(fx.session.next_pending_event(fx.process_id).unwrap().is_none());

        let process = fx.session.process_mut(fx.process_id).unwrap();
        let wave = process.find_wave(wave).unwrap();
        assert_eq!(wave.last_stopped_pc(), 0x1000);
        assert!(wave.stop_reason().is_empty());
    }

    // S5: resume is blocked until the stop event is processed.
    #[test]
    fn resume_blocked_until_event_processed() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x1000, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];

        // Event not even reported: the stop is not client-visible yet.
        assert!(matches!(
            fx.session
                .wave_resume(wave, ResumeMode::Normal, Exceptions::empty()),
            Err(Error::WaveNotStopped(_))
        ));

        let (event, _) = fx.session.next_pending_event(fx.process_id).unwrap().unwrap();
        assert!(matches!(
            fx.session
                .wave_resume(wave, ResumeMode::Normal, Exceptions::empty()),
            Err(Error::WaveNotResumable(_))
        ));

        fx.session.event_processed(fx.process_id, event).unwrap();
        fx.session
            .wave_resume(wave, ResumeMode::Normal, Exceptions::empty())
            .unwrap();
    }

    #[test]
    fn stop_request_on_running_wave() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x1000, None).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        assert_eq!(state_of(&mut fx, wave), WaveState::Run);

        fx.session.wave_stop(wave).unwrap();

        // The acknowledgment event is queued; until it is reported the wave
        // still appears running, and a second stop is an outstanding stop.
        assert!(matches!(
            fx.session.wave_stop(wave),
            Err(Error::WaveOutstandingStop(_))
        ));

        let drained = fx.drain_events().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, EventKind::WaveStop(wave));

        assert_eq!(state_of(&mut fx, wave), WaveState::Stop);
        assert!(matches!(fx.session.wave_stop(wave), Err(Error::WaveStopped(_))));
    }

    #[test]
    fn stopping_a_single_stepping_wave_terminates_the_command() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x1000, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .wave_resume(wave, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();

        fx.session.wave_stop(wave).unwrap();
        let drained = fx.drain_events().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, EventKind::WaveCommandTerminated(wave));
    }

    // S2: two waves of one queue share a displaced-stepping buffer.
    #[test]
    fn displaced_stepping_shares_buffers_per_pc() {
        let mut fx = Fixture::new().unwrap();
        let slot_a = fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        let slot_b = fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        // The breakpoint sits at 0x2000; the original second half follows.
        fx.memory.write(0x2000, &[OP_BREAKPOINT, 0, 0, 0]);
        fx.memory.write(0x2004, &[0x02, 0, 0, 0]);

        let waves = fx.wave_list().unwrap();
        let (a, b) = (waves[0], waves[1]);
        fx.drain_events().unwrap();

        let saved = [0x01, 0, 0, 0];
        fx.session.displaced_stepping_start(a, &saved).unwrap();
        assert_eq!(pc_of(&mut fx, a), 0xF0000);

        fx.session.displaced_stepping_start(b, &saved).unwrap();
        assert_eq!(pc_of(&mut fx, b), 0xF0000);

        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let ds = process.find_wave(a).unwrap().displaced_stepping_id().unwrap();
            assert_eq!(
                process.find_wave(b).unwrap().displaced_stepping_id(),
                Some(ds)
            );
            assert_eq!(process.displaced(ds).unwrap().refcount(), 2);
        }

        // Only single-step resumes are allowed while displaced.
        assert!(matches!(
            fx.session
                .wave_resume(a, ResumeMode::Normal, Exceptions::empty()),
            Err(Error::ResumeDisplacedStepping)
        ));

        fx.session
            .wave_resume(a, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();
        fx.stop_in_hardware_at(slot_a, StopReasons::SINGLE_STEP, Some(0xF0004)).unwrap();
        fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        fx.session.displaced_stepping_complete(a).unwrap();
        assert_eq!(pc_of(&mut fx, a), 0x2004);
        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let ds = process.find_wave(b).unwrap().displaced_stepping_id().unwrap();
            assert_eq!(process.displaced(ds).unwrap().refcount(), 1);
            assert!(process.find_wave(a).unwrap().displaced_stepping_id().is_none());
        }

        fx.session
            .wave_resume(b, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();
        fx.stop_in_hardware_at(slot_b, StopReasons::SINGLE_STEP, Some(0xF0004)).unwrap();
        fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        fx.session.displaced_stepping_complete(b).unwrap();
        assert_eq!(pc_of(&mut fx, b), 0x2004);

        // Both references are gone: the scratch buffer went back to the
        // allocator.
        let freed = fx.callbacks.freed();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].address, 0xF0000);
    }

    #[test]
    fn displaced_stepping_aborted_restores_original_pc() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.memory.write(0x2004, &[0x02, 0, 0, 0]);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .displaced_stepping_start(wave, &[0x01, 0, 0, 0])
            .unwrap();
        fx.session
            .wave_resume(wave, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();

        // The wave stopped again without executing: pc still at the buffer.
        fx.stop_in_hardware_at(slot, StopReasons::SINGLE_STEP, Some(0xF0000)).unwrap();
        fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        fx.session.displaced_stepping_complete(wave).unwrap();
        assert_eq!(pc_of(&mut fx, wave), 0x2000);
    }

    #[test]
    fn displaced_stepping_simulated_instruction() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.memory.write(0x2000, &[OP_BREAKPOINT, 0, 0, 0]);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        // The original instruction is a branch: simulated, no scratch
        // buffer, pc untouched.
        fx.session
            .displaced_stepping_start(wave, &[OP_BRANCH, 2, 0, 0])
            .unwrap();
        assert_eq!(pc_of(&mut fx, wave), 0x2000);

        fx.session
            .wave_resume(wave, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();

        // The branch was simulated: the wave is stopped at the target
        // without hardware involvement.
        let drained = fx.drain_events().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, EventKind::WaveStop(wave));
        assert_eq!(state_of(&mut fx, wave), WaveState::Stop);
        assert_eq!(pc_of(&mut fx, wave), 0x2000 + 4 + 2 * 4);

        fx.session.displaced_stepping_complete(wave).unwrap();
        assert!(fx.callbacks.freed().is_empty());
    }

    #[test]
    fn displaced_stepping_rejects_illegal_instructions() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        assert!(matches!(
            fx.session
                .displaced_stepping_start(wave, &[OP_NO_DISPLACED, 0, 0, 0]),
            Err(Error::IllegalInstruction)
        ));
        // The error path still released the queue.
        assert!(fx.driver.state.lock().unwrap().suspended.is_empty());
        let process = fx.session.process_mut(fx.process_id).unwrap();
        assert!(process.find_wave(wave).unwrap().displaced_stepping_id().is_none());
    }

    #[test]
    fn displaced_stepping_allocator_failure_is_client_callback() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.memory.write(0x2004, &[0x02, 0, 0, 0]);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.callbacks.fail_next_allocation();
        assert!(matches!(
            fx.session.displaced_stepping_start(wave, &[0x01, 0, 0, 0]),
            Err(Error::ClientCallback)
        ));
    }

    #[test]
    fn detach_releases_outstanding_displaced_stepping() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x2000, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.memory.write(0x2004, &[0x02, 0, 0, 0]);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .displaced_stepping_start(wave, &[0x01, 0, 0, 0])
            .unwrap();
        fx.session.detach_process(fx.process_id).unwrap();

        assert_eq!(fx.callbacks.freed().len(), 1);
    }

    // S3: single-stepping a terminating instruction terminates the wave.
    #[test]
    fn single_step_of_terminating_instruction() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x3000, Some(StopReasons::TRAP)).unwrap();
        fx.memory.write(0x3000, &[OP_ENDPGM, 0, 0, 0]);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .wave_resume(wave, ResumeMode::SingleStep, Exceptions::empty())
            .unwrap();

        let drained = fx.drain_events().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, EventKind::WaveCommandTerminated(wave));

        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let w = process.find_wave(wave).unwrap();
            assert_eq!(w.visibility(), crate::wave::Visibility::HiddenAtTerminatingInstruction);
            assert_eq!(w.state(), WaveState::Run);
        }

        // The wave's pc points at the immutable terminating instruction.
        let record = fx.record(slot);
        fx.wave_list().unwrap();
        assert_eq!(
            fx.memory
                .read_u64(record.register_address(crate::regs::Regnum::Pc).unwrap()),
            TERMINATE_ADDRESS
        );

        // Hidden waves are never enumerated, before or after retirement.
        assert!(fx.wave_list().unwrap().is_empty());
        fx.retire_in_hardware(slot);
        assert!(fx.wave_list().unwrap().is_empty());
        assert!(matches!(
            fx.session.wave_get_info(wave, WaveInfo::State),
            Err(Error::InvalidWaveId(_))
        ));
    }

    // S6: parked-pc coherence on a parking architecture.
    #[test]
    fn parked_pc_reads_and_writes_are_coherent() {
        let mut fx = Fixture::parked().unwrap();
        let slot = fx.add_wave(0x3000, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let w = process.find_wave(wave).unwrap();
            assert!(w.is_parked());
            assert_eq!(w.state(), WaveState::Stop);
        }

        // The saved pc in the record is the park instruction; the client
        // still reads the real pc.
        let record = fx.record(slot);
        let pc_address = record.register_address(crate::regs::Regnum::Pc).unwrap();
        assert_eq!(pc_of(&mut fx, wave), 0x3000);

        fx.session
            .write_register(wave, crate::regs::Regnum::Pc, 0, &0x3100u64.to_le_bytes())
            .unwrap();
        assert_eq!(pc_of(&mut fx, wave), 0x3100);

        fx.session
            .wave_resume(wave, ResumeMode::Normal, Exceptions::empty())
            .unwrap();

        // Unparking wrote the client's pc back into the record.
        assert_eq!(fx.memory.read_u64(pc_address), 0x3100);
        let process = fx.session.process_mut(fx.process_id).unwrap();
        assert!(!process.find_wave(wave).unwrap().is_parked());
    }

    #[test]
    fn parked_wave_record_holds_park_instruction_address() {
        let mut fx = Fixture::parked().unwrap();
        let slot = fx.add_wave(0x3000, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        // Force the dirty cache out by letting the queue resume, then look
        // at the saved pc the hardware would see.
        let record = fx.record(slot);
        assert_eq!(
            fx.memory
                .read_u64(record.register_address(crate::regs::Regnum::Pc).unwrap()),
            PARK_ADDRESS
        );
    }

    // S4: swizzled private reads cross lane strides dword by dword.
    #[test]
    fn swizzled_read_crosses_lane_strides() {
        let mut fx = Fixture::with_options(false, 64).unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        // lane_count=64, lane=7, segment address 3, six bytes: one byte at
        // dword 0, four at dword 1, one at dword 2.
        fx.memory.write(SCRATCH_BASE + 31, &[0xAA]);
        fx.memory.write(SCRATCH_BASE + 284, &[1, 2, 3, 4]);
        fx.memory.write(SCRATCH_BASE + 540, &[0xBB]);

        let space = AddressSpace::new(AddressSpaceKind::PrivateSwizzled, 32);
        let mut buf = [0u8; 6];
        let read = fx
            .session
            .read_segment_memory(wave, space, Some(7), 3, &mut buf)
            .unwrap();
        assert_eq!(read, 6);
        assert_eq!(buf, [0xAA, 1, 2, 3, 4, 0xBB]);
    }

    #[test]
    fn swizzled_transfer_validates_lane_and_bounds() {
        let mut fx = Fixture::with_options(false, 64).unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        let space = AddressSpace::new(AddressSpaceKind::PrivateSwizzled, 32);
        let mut buf = [0u8; 4];
        assert!(matches!(
            fx.session.read_segment_memory(wave, space, None, 0, &mut buf),
            Err(Error::InvalidLaneId)
        ));
        assert!(matches!(
            fx.session.read_segment_memory(wave, space, Some(64), 0, &mut buf),
            Err(Error::InvalidLaneId)
        ));

        // Entirely past the end of scratch.
        assert!(matches!(
            fx.session
                .read_segment_memory(wave, space, Some(0), 0x2_0000, &mut buf),
            Err(Error::MemoryAccess)
        ));
    }

    #[test]
    fn local_memory_transfer_uses_group_leader_record() {
        let mut fx = Fixture::new().unwrap();
        let leader = fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let member = fx.add_wave(0x200, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.set_group_leader(member, leader);
        let waves = fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        let space = AddressSpace::new(AddressSpaceKind::Local, 32);
        fx.session
            .write_segment_memory(waves[1], space, None, 0x10, &[7, 8, 9])
            .unwrap();

        // The bytes landed in the leader's saved LDS.
        let leader_lds = fx
            .record(leader)
            .register_address(crate::regs::Regnum::Lds)
            .unwrap();
        let mut probe = [0u8; 3];
        fx.memory.read(leader_lds + 0x10, &mut probe);
        assert_eq!(probe, [7, 8, 9]);

        let mut back = [0u8; 3];
        let read = fx
            .session
            .read_segment_memory(waves[1], space, None, 0x10, &mut back)
            .unwrap();
        assert_eq!(read, 3);
        assert_eq!(back, [7, 8, 9]);
    }

    #[test]
    fn local_memory_transfer_truncates_at_lds_size() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        let space = AddressSpace::new(AddressSpaceKind::Local, 32);

        // Straddles the 256-byte LDS: truncated.
        let mut buf = [0u8; 16];
        let read = fx
            .session
            .read_segment_memory(wave, space, None, 248, &mut buf)
            .unwrap();
        assert_eq!(read, 8);

        // Zero bytes in bounds: size-0 succeeds, anything more fails.
        let read = fx
            .session
            .read_segment_memory(wave, space, None, 256, &mut [])
            .unwrap();
        assert_eq!(read, 0);
        assert!(matches!(
            fx.session.read_segment_memory(wave, space, None, 256, &mut buf),
            Err(Error::MemoryAccess)
        ));
    }

    #[test]
    fn global_transfer_zero_extends_segment_addresses() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.memory.write(0x10, &[0x42]);
        let space = AddressSpace::new(AddressSpaceKind::Global, 32);
        let mut buf = [0u8; 1];
        // Bits above the space's 32-bit width are dropped.
        fx.session
            .read_segment_memory(wave, space, None, 0x1_0000_0000 + 0x10, &mut buf)
            .unwrap();
        assert_eq!(buf, [0x42]);
    }

    #[test]
    fn unswizzled_transfer_roundtrip() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        let space = AddressSpace::new(AddressSpaceKind::PrivateUnswizzled, 32);
        fx.session
            .write_segment_memory(wave, space, None, 0x80, &[5, 6, 7, 8])
            .unwrap();
        let mut buf = [0u8; 4];
        let read = fx
            .session
            .read_segment_memory(wave, space, None, 0x80, &mut buf)
            .unwrap();
        assert_eq!(read, 4);
        assert_eq!(buf, [5, 6, 7, 8]);
        assert_eq!(fx.memory.read_u32(SCRATCH_BASE + 0x80), 0x0807_0605);
    }

    #[test]
    fn memory_transfer_requires_stopped_wave() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, None).unwrap();
        let wave = fx.wave_list().unwrap()[0];

        let space = AddressSpace::new(AddressSpaceKind::Global, 64);
        let mut buf = [0u8; 4];
        assert!(matches!(
            fx.session.read_segment_memory(wave, space, None, 0, &mut buf),
            Err(Error::WaveNotStopped(_))
        ));
    }

    // Invariant 4: register writes read back.
    #[test]
    fn register_write_read_roundtrip() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        let value = 0xDEAD_BEEFu32.to_le_bytes();
        fx.session
            .write_register(wave, crate::regs::Regnum::Sgpr(3), 0, &value)
            .unwrap();
        let mut back = [0u8; 4];
        fx.session
            .read_register(wave, crate::regs::Regnum::Sgpr(3), 0, &mut back)
            .unwrap();
        assert_eq!(back, value);

        // Cached hwreg roundtrip with a sub-register offset.
        fx.session
            .write_register(wave, crate::regs::Regnum::M0, 2, &[0x12, 0x34])
            .unwrap();
        let mut m0 = [0u8; 4];
        fx.session
            .read_register(wave, crate::regs::Regnum::M0, 0, &mut m0)
            .unwrap();
        assert_eq!(m0[2..], [0x12, 0x34]);
    }

    #[test]
    fn out_of_range_sgpr_aliases_s0_on_read_and_drops_writes() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .write_register(wave, crate::regs::Regnum::Sgpr(0), 0, &0x1111_2222u32.to_le_bytes())
            .unwrap();

        // The fixture allocates 16 sgprs; s100 reads as s0.
        let mut buf = [0u8; 4];
        fx.session
            .read_register(wave, crate::regs::Regnum::Sgpr(100), 0, &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1111_2222);

        // Out-of-range writes vanish.
        fx.session
            .write_register(wave, crate::regs::Regnum::Sgpr(100), 0, &0x9999_9999u32.to_le_bytes())
            .unwrap();
        fx.session
            .read_register(wave, crate::regs::Regnum::Sgpr(0), 0, &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1111_2222);
    }

    #[test]
    fn register_size_and_offset_are_validated() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            fx.session
                .read_register(wave, crate::regs::Regnum::Pc, 4, &mut buf),
            Err(Error::InvalidArgumentCompatibility)
        ));
        assert!(matches!(
            fx.session.read_register(wave, crate::regs::Regnum::Pc, 0, &mut []),
            Err(Error::InvalidArgumentCompatibility)
        ));

        // Exec of the wrong width does not exist on this wave.
        assert!(matches!(
            fx.session
                .read_register(wave, crate::regs::Regnum::Exec64, 0, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn pseudo_exec_follows_the_exec_mask() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let record = fx.record(slot);
        fx.memory.write_u32(
            record.register_address(crate::regs::Regnum::Exec32).unwrap(),
            0xF0F0_00FF,
        );
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        match fx.session.wave_get_info(wave, WaveInfo::ExecMask).unwrap() {
            WaveInfoValue::ExecMask(mask) => assert_eq!(mask, 0xF0F0_00FF),
            other => panic!("unexpected info value {:?}", other),
        }

        let mut buf = [0u8; 8];
        fx.session
            .read_register(wave, crate::regs::Regnum::PseudoExec, 0, &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xF0F0_00FF);

        fx.session
            .write_register(wave, crate::regs::Regnum::PseudoExec, 0, &1u64.to_le_bytes())
            .unwrap();
        let mut exec = [0u8; 4];
        fx.session
            .read_register(wave, crate::regs::Regnum::Exec32, 0, &mut exec)
            .unwrap();
        assert_eq!(u32::from_le_bytes(exec), 1);
    }

    #[test]
    fn ttmp_access_is_privilege_gated() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.set_priv(slot, false);
        let record = fx.record(slot);
        let ttmp0 = record.register_address(crate::regs::Regnum::Ttmp(0)).unwrap();
        fx.memory.write_u32(ttmp0, 0x5555_5555);
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        // Reads return zeros, writes are dropped.
        let mut buf = [0u8; 4];
        fx.session
            .read_register(wave, crate::regs::Regnum::Ttmp(0), 0, &mut buf)
            .unwrap();
        assert_eq!(buf, [0; 4]);

        fx.session
            .write_register(wave, crate::regs::Regnum::Ttmp(0), 0, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(fx.memory.read_u32(ttmp0), 0x5555_5555);
    }

    #[test]
    fn info_queries_gated_on_stop() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, None).unwrap();
        let wave = fx.wave_list().unwrap()[0];

        assert!(matches!(
            fx.session.wave_get_info(wave, WaveInfo::Pc),
            Err(Error::WaveNotStopped(_))
        ));
        assert!(matches!(
            fx.session.wave_get_info(wave, WaveInfo::StopReason),
            Err(Error::WaveNotStopped(_))
        ));
        // Ungated queries answer on a running wave.
        match fx.session.wave_get_info(wave, WaveInfo::LaneCount).unwrap() {
            WaveInfoValue::LaneCount(lanes) => assert_eq!(lanes, 32),
            other => panic!("unexpected info value {:?}", other),
        }
        match fx.session.wave_get_info(wave, WaveInfo::Queue).unwrap() {
            WaveInfoValue::Queue(queue) => assert_eq!(queue, fx.queue_id),
            other => panic!("unexpected info value {:?}", other),
        }
    }

    #[test]
    fn triggered_watchpoints_map_to_client_handles() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x100, None).unwrap();
        let record = fx.record(slot);
        fx.memory.write_u32(
            record.register_address(crate::regs::Regnum::Status).unwrap(),
            crate::testing::STATUS_HALTED,
        );
        fx.memory.write_u32(
            record.register_address(crate::regs::Regnum::Trapsts).unwrap(),
            StopReasons::WATCHPOINT.bits() | (0b101 << 16),
        );

        let (watch0, watch2) = {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            (process.add_watchpoint(0), process.add_watchpoint(2))
        };

        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        match fx.session.wave_get_info(wave, WaveInfo::Watchpoints).unwrap() {
            WaveInfoValue::Watchpoints(ids) => assert_eq!(ids, vec![watch0, watch2]),
            other => panic!("unexpected info value {:?}", other),
        }
    }

    #[test]
    fn resume_rejects_unknown_exception_bits() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        assert!(matches!(
            fx.session.wave_resume(
                wave,
                ResumeMode::Normal,
                Exceptions::from_bits_retain(1 << 30)
            ),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn resume_exceptions_translate_to_os_masks() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.session
            .wave_resume(
                wave,
                ResumeMode::Normal,
                Exceptions::TRAP | Exceptions::MATH_ERROR,
            )
            .unwrap();

        let sent = fx.driver.state.lock().unwrap().sent_exceptions.clone();
        assert_eq!(
            sent,
            vec![(
                OsExceptionMask::QUEUE_WAVE_TRAP | OsExceptionMask::QUEUE_WAVE_MATH_ERROR,
                fx.queue_id
            )]
        );
    }

    #[test]
    fn device_memory_violation_rides_along_and_clears() {
        let mut fx = Fixture::new().unwrap();
        let slot_a = fx.add_wave(0x100, Some(StopReasons::MEMORY_VIOLATION)).unwrap();
        let slot_b = fx.add_wave(0x200, Some(StopReasons::MEMORY_VIOLATION)).unwrap();
        let _ = (slot_a, slot_b);
        let waves = fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let agent = fx.agent_id;
            process
                .agent_mut(agent)
                .unwrap()
                .set_exceptions(OsExceptionMask::DEVICE_MEMORY_VIOLATION);
        }

        fx.session
            .wave_resume(waves[0], ResumeMode::Normal, Exceptions::MEMORY_VIOLATION)
            .unwrap();

        // The agent-scoped bit rode along with the queue exception, and it
        // stays latched while another stopped wave holds a violation.
        let sent = fx.driver.state.lock().unwrap().sent_exceptions.clone();
        assert_eq!(
            sent,
            vec![(
                OsExceptionMask::QUEUE_WAVE_MEMORY_VIOLATION
                    | OsExceptionMask::DEVICE_MEMORY_VIOLATION,
                fx.queue_id
            )]
        );
        {
            let process = fx.session.process_mut(fx.process_id).unwrap();
            let agent = fx.agent_id;
            assert!(process
                .agent(agent)
                .unwrap()
                .exceptions()
                .contains(OsExceptionMask::DEVICE_MEMORY_VIOLATION));
        }

        // Resuming the last violating wave clears the device bit.
        fx.session
            .wave_resume(waves[1], ResumeMode::Normal, Exceptions::empty())
            .unwrap();
        let process = fx.session.process_mut(fx.process_id).unwrap();
        let agent = fx.agent_id;
        assert!(!process
            .agent(agent)
            .unwrap()
            .exceptions()
            .contains(OsExceptionMask::DEVICE_MEMORY_VIOLATION));
    }

    #[test]
    fn wave_exit_is_noticed_on_the_next_suspension() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        let wave = fx.wave_list().unwrap()[0];
        fx.drain_events().unwrap();

        fx.retire_in_hardware(slot);
        assert!(matches!(
            fx.session
                .wave_resume(wave, ResumeMode::Normal, Exceptions::empty()),
            Err(Error::InvalidWaveId(_))
        ));

        let (waves, changed) = fx.session.wave_list(Some(fx.process_id)).unwrap();
        assert!(waves.is_empty());
        assert!(changed);
    }

    #[test]
    fn wave_list_changed_flag_resets() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, None).unwrap();

        let (_, changed) = fx.session.wave_list(Some(fx.process_id)).unwrap();
        assert!(changed);
        let (_, changed) = fx.session.wave_list(Some(fx.process_id)).unwrap();
        assert!(!changed);
    }

    #[test]
    fn wave_identity_is_stable_across_suspensions() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, None).unwrap();

        let first = fx.wave_list().unwrap();
        let second = fx.wave_list().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn queues_resume_after_each_operation_when_forward_progress_needed() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, Some(StopReasons::BREAKPOINT)).unwrap();
        fx.wave_list().unwrap();
        fx.drain_events().unwrap();

        let state = fx.driver.state.lock().unwrap();
        assert_eq!(state.suspend_calls.len(), state.resume_calls.len());
        assert!(state.suspended.is_empty());
    }

    #[test]
    fn launch_halted_waves_become_visible_with_their_dispatch() {
        let mut fx = Fixture::new().unwrap();
        let slot = fx.add_wave_halted_at_launch(0x100).unwrap();

        // Hidden until the driver can associate a dispatch.
        assert!(fx.wave_list().unwrap().is_empty());

        fx.provide_dispatch(slot);
        let waves = fx.wave_list().unwrap();
        assert_eq!(waves.len(), 1);

        // Becoming visible cleared the hardware halt override.
        let status_address = fx
            .record(slot)
            .register_address(crate::regs::Regnum::Status)
            .unwrap();
        assert_eq!(
            fx.memory.read_u32(status_address) & crate::testing::STATUS_HALT,
            0
        );
        assert_eq!(state_of(&mut fx, waves[0]), WaveState::Run);
    }

    #[test]
    fn queues_stay_suspended_without_forward_progress() {
        let mut fx = Fixture::new().unwrap();
        fx.add_wave(0x100, None).unwrap();
        fx.session
            .process_mut(fx.process_id)
            .unwrap()
            .set_forward_progress_needed(false)
            .unwrap();

        fx.wave_list().unwrap();
        let state = fx.driver.state.lock().unwrap();
        assert!(state.suspended.contains(&fx.queue_id));
        assert!(state.resume_calls.is_empty());
    }
}
