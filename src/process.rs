//! Process-scoped object arenas and the queue-suspension protocol.
//!
//! A [`Process`] owns everything the debugger knows about one debuggee:
//! agents, queues, dispatches, waves, events, watchpoint bindings and the
//! displaced-stepping buffer arena. Objects refer to each other by handle;
//! nothing in the arena owns anything else in the arena.
//!
//! The serialization primitive is queue suspension: any observation or
//! mutation of a wave's saved state outside its register cache requires the
//! owning queue to be suspended by the driver. Suspending a queue also
//! refreshes its wave list from the driver's context-save snapshot, and
//! resuming a queue first flushes every dirty register cache registered
//! with it.

use crate::arch::Architecture;
use crate::config::Config;
use crate::cwsr::{CwsrDescriptor, CwsrRecord};
use crate::displaced::{DisplacedStepping, InstructionBuffer};
use crate::error::{fatal, Result};
use crate::event::{Event, EventKind, EventState};
use crate::mem::ProcessMemory;
use crate::regs::Regnum;
use crate::types::{
    AgentId, DispatchId, DisplacedSteppingId, EventId, GlobalAddress, OsExceptionMask, OsWatchId,
    ProcessId, QueueId, WatchpointId, WaveId,
};
use crate::wave::{Visibility, Wave};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Per-queue services a wave needs from its environment: the immutable trap
/// instructions it can park or terminate at, the scratch allocator used for
/// displaced stepping, and the location of the wave's scratch backing.
pub trait WaveCallbacks: Send + Sync {
    /// Address of an immutable trap instruction stopped waves are parked at.
    fn park_instruction_address(&self) -> GlobalAddress;

    /// Address of an immutable terminating instruction.
    fn terminating_instruction_address(&self) -> GlobalAddress;

    /// Allocate a scratch buffer of at least `size` bytes for a displaced
    /// instruction.
    fn allocate_instruction_buffer(&self, size: usize) -> Result<InstructionBuffer>;

    /// Return a scratch buffer obtained from `allocate_instruction_buffer`.
    fn free_instruction_buffer(&self, buffer: InstructionBuffer);

    /// `(base, size)` of the wave's scratch memory backing.
    fn scratch_memory_region(&self, record: &CwsrRecord) -> (GlobalAddress, u64);
}

/// One context-saved wave in a suspended queue's snapshot.
#[derive(Debug, Clone)]
pub struct WaveSnapshot {
    pub cwsr: CwsrDescriptor,
    /// Index of the wave-group leader within this snapshot.
    pub group_leader: usize,
    /// The dispatch the wave belongs to, when the driver can associate one.
    pub dispatch: Option<DispatchId>,
    /// The wave was created halted at launch and has no dispatch yet.
    pub halted_at_launch: bool,
}

/// OS driver transport contract (queue control and exception delivery).
pub trait OsDriver {
    fn suspend_queues(&mut self, queues: &[QueueId]) -> Result<()>;
    fn resume_queues(&mut self, queues: &[QueueId]) -> Result<()>;

    /// Describe every context-saved wave of a suspended queue.
    fn queue_snapshot(&mut self, queue: QueueId) -> Result<Vec<WaveSnapshot>>;

    /// Deliver an exception mask to a queue's exception handler.
    fn send_exceptions(&mut self, exceptions: OsExceptionMask, queue: QueueId) -> Result<()>;

    /// Synchronize the queue list with the OS. The core calls this before
    /// enumerating waves.
    fn update_queues(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct Agent {
    id: AgentId,
    architecture: Arc<dyn Architecture>,
    exceptions: OsExceptionMask,
}

impl Agent {
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn architecture(&self) -> &Arc<dyn Architecture> {
        &self.architecture
    }

    /// Exceptions currently latched on this agent.
    pub fn exceptions(&self) -> OsExceptionMask {
        self.exceptions
    }

    pub fn set_exceptions(&mut self, exceptions: OsExceptionMask) {
        self.exceptions |= exceptions;
    }

    pub fn clear_exceptions(&mut self, exceptions: OsExceptionMask) {
        self.exceptions &= !exceptions;
    }
}

pub struct Queue {
    id: QueueId,
    agent: AgentId,
    suspended: bool,
    valid: bool,
    callbacks: Arc<dyn WaveCallbacks>,
    /// Waves whose register caches are dirty and must flush before this
    /// queue resumes.
    dirty_caches: BTreeSet<WaveId>,
}

impl Queue {
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// A queue becomes invalid when its process exits or detaches.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn callbacks(&self) -> Arc<dyn WaveCallbacks> {
        Arc::clone(&self.callbacks)
    }

    /// Register a wave whose cache must be flushed before the queue
    /// resumes.
    pub(crate) fn register_dirty_cache(&mut self, wave: WaveId) {
        self.dirty_caches.insert(wave);
    }
}

pub struct Dispatch {
    id: DispatchId,
    queue: QueueId,
}

impl Dispatch {
    pub fn id(&self) -> DispatchId {
        self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }
}

pub struct Process {
    id: ProcessId,
    pub(crate) memory: Box<dyn ProcessMemory>,
    driver: Box<dyn OsDriver>,
    agents: BTreeMap<AgentId, Agent>,
    queues: BTreeMap<QueueId, Queue>,
    dispatches: BTreeMap<DispatchId, Dispatch>,
    waves: BTreeMap<WaveId, Wave>,
    events: BTreeMap<EventId, Event>,
    pending_events: VecDeque<EventId>,
    displaced: BTreeMap<DisplacedSteppingId, DisplacedStepping>,
    watchpoints: BTreeMap<OsWatchId, WatchpointId>,
    /// Whether the OS sets up ttmp registers at wave launch. When false the
    /// library zero-initializes them and matches waves by snapshot order.
    ttmps_setup_enabled: bool,
    /// Whether queues suspended for an operation are resumed before the
    /// operation returns.
    forward_progress_needed: bool,
    /// The set of visible waves changed since the last wave list query.
    waves_changed: bool,
}

impl Process {
    pub fn new(memory: Box<dyn ProcessMemory>, driver: Box<dyn OsDriver>) -> Self {
        let config = Config::get();
        Self {
            id: ProcessId::allocate(),
            memory,
            driver,
            agents: BTreeMap::new(),
            queues: BTreeMap::new(),
            dispatches: BTreeMap::new(),
            waves: BTreeMap::new(),
            events: BTreeMap::new(),
            pending_events: VecDeque::new(),
            displaced: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            ttmps_setup_enabled: config.ttmps_setup(),
            forward_progress_needed: config.forward_progress(),
            waves_changed: false,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn set_ttmps_setup_enabled(&mut self, enabled: bool) {
        self.ttmps_setup_enabled = enabled;
    }

    pub(crate) fn ttmps_setup_enabled(&self) -> bool {
        self.ttmps_setup_enabled
    }

    /// Change the forward-progress policy. Re-enabling it resumes every
    /// queue that stayed suspended while it was off.
    pub fn set_forward_progress_needed(&mut self, needed: bool) -> Result<()> {
        self.forward_progress_needed = needed;
        if needed {
            let suspended: Vec<QueueId> = self
                .queues
                .values()
                .filter(|queue| queue.is_valid() && queue.is_suspended())
                .map(Queue::id)
                .collect();
            if !suspended.is_empty() {
                self.resume_queues(&suspended, "forward progress")?;
            }
        }
        Ok(())
    }

    pub fn forward_progress_needed(&self) -> bool {
        self.forward_progress_needed
    }

    // ---- topology -------------------------------------------------------

    pub fn add_agent(&mut self, architecture: Arc<dyn Architecture>) -> AgentId {
        let id = AgentId::allocate();
        self.agents.insert(
            id,
            Agent {
                id,
                architecture,
                exceptions: OsExceptionMask::empty(),
            },
        );
        id
    }

    pub fn add_queue(&mut self, agent: AgentId, callbacks: Arc<dyn WaveCallbacks>) -> QueueId {
        assert!(self.agents.contains_key(&agent), "unknown agent");
        let id = QueueId::allocate();
        self.queues.insert(
            id,
            Queue {
                id,
                agent,
                suspended: false,
                valid: true,
                callbacks,
                dirty_caches: BTreeSet::new(),
            },
        );
        id
    }

    pub fn add_dispatch(&mut self, queue: QueueId) -> DispatchId {
        assert!(self.queues.contains_key(&queue), "unknown queue");
        let id = DispatchId::allocate();
        self.dispatches.insert(id, Dispatch { id, queue });
        id
    }

    /// Bind an OS watchpoint slot to a client-visible watchpoint handle.
    pub fn add_watchpoint(&mut self, os_watch_id: OsWatchId) -> WatchpointId {
        let id = WatchpointId::allocate();
        self.watchpoints.insert(os_watch_id, id);
        id
    }

    pub(crate) fn find_watchpoint(&self, os_watch_id: OsWatchId) -> Option<WatchpointId> {
        self.watchpoints.get(&os_watch_id).copied()
    }

    // ---- arena accessors ------------------------------------------------

    pub(crate) fn agent(&self, id: AgentId) -> Result<&Agent> {
        self.agents.get(&id).ok_or_else(|| fatal!("unknown {}", id))
    }

    pub(crate) fn agent_mut(&mut self, id: AgentId) -> Result<&mut Agent> {
        self.agents
            .get_mut(&id)
            .ok_or_else(|| fatal!("unknown {}", id))
    }

    pub(crate) fn queue(&self, id: QueueId) -> Result<&Queue> {
        self.queues.get(&id).ok_or_else(|| fatal!("unknown {}", id))
    }

    pub(crate) fn queue_mut(&mut self, id: QueueId) -> Result<&mut Queue> {
        self.queues
            .get_mut(&id)
            .ok_or_else(|| fatal!("unknown {}", id))
    }

    pub(crate) fn dispatch(&self, id: DispatchId) -> Option<&Dispatch> {
        self.dispatches.get(&id)
    }

    pub fn find_wave(&self, id: WaveId) -> Option<&Wave> {
        self.waves.get(&id)
    }

    /// Remove a wave from the arena for the duration of an operation.
    /// While taken, `self.waves()` is exactly the set of *other* waves.
    pub(crate) fn take_wave(&mut self, id: WaveId) -> Option<Wave> {
        self.waves.remove(&id)
    }

    pub(crate) fn put_wave(&mut self, wave: Wave) {
        let prev = self.waves.insert(wave.id(), wave);
        assert!(prev.is_none(), "wave reinserted over a live wave");
    }

    pub(crate) fn waves(&self) -> impl Iterator<Item = &Wave> {
        self.waves.values()
    }

    pub(crate) fn set_waves_changed(&mut self) {
        self.waves_changed = true;
    }

    /// The changed flag for wave list queries; reading it resets it.
    pub(crate) fn take_waves_changed(&mut self) -> bool {
        std::mem::replace(&mut self.waves_changed, false)
    }

    // ---- events ---------------------------------------------------------

    pub(crate) fn create_event(&mut self, kind: EventKind) -> EventId {
        let event = Event::new(kind);
        let id = event.id();
        log::debug!("{}: raised {} ({:?})", self.id, id, kind);
        self.events.insert(id, event);
        self.pending_events.push_back(id);
        id
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub(crate) fn next_pending_event(&mut self) -> Option<(EventId, EventKind)> {
        while let Some(id) = self.pending_events.pop_front() {
            if let Some(event) = self.events.get_mut(&id) {
                event.set_state(EventState::Reported);
                return Some((id, event.kind()));
            }
        }
        None
    }

    pub(crate) fn mark_event_processed(&mut self, id: EventId) -> bool {
        match self.events.get_mut(&id) {
            Some(event) => {
                event.set_state(EventState::Processed);
                true
            }
            None => false,
        }
    }

    // ---- displaced stepping arena ---------------------------------------

    pub(crate) fn find_displaced(
        &self,
        queue: QueueId,
        from: GlobalAddress,
    ) -> Option<DisplacedSteppingId> {
        self.displaced
            .values()
            .find(|ds| ds.queue() == queue && ds.from() == from)
            .map(|ds| ds.id())
    }

    pub(crate) fn displaced(&self, id: DisplacedSteppingId) -> Result<&DisplacedStepping> {
        self.displaced.get(&id).ok_or_else(|| fatal!("unknown {}", id))
    }

    pub(crate) fn insert_displaced(&mut self, ds: DisplacedStepping) -> DisplacedSteppingId {
        let id = ds.id();
        log::debug!(
            "{}: created {} (from={:#x}, {})",
            self.id,
            id,
            ds.from(),
            if ds.is_simulated() { "simulated" } else { "buffered" }
        );
        self.displaced.insert(id, ds);
        id
    }

    pub(crate) fn displaced_retain(&mut self, id: DisplacedSteppingId) -> Result<()> {
        self.displaced
            .get_mut(&id)
            .ok_or_else(|| fatal!("unknown {}", id))?
            .retain();
        Ok(())
    }

    pub(crate) fn displaced_release(&mut self, id: DisplacedSteppingId) -> Result<()> {
        let ds = self
            .displaced
            .get_mut(&id)
            .ok_or_else(|| fatal!("unknown {}", id))?;
        if let Some(buffer) = ds.release() {
            let queue = ds.queue();
            log::debug!("{}: released {}", self.id, id);
            self.displaced.remove(&id);
            if let Some(buffer) = buffer {
                self.queue(queue)?.callbacks().free_instruction_buffer(buffer);
            }
        }
        Ok(())
    }

    // ---- queue suspension -----------------------------------------------

    /// Synchronize the queue list with the OS before enumerating waves.
    /// Failure here means the driver state is unreliable.
    pub(crate) fn update_queues(&mut self) -> Result<()> {
        self.driver
            .update_queues()
            .map_err(|err| fatal!("{}: update_queues failed: {}", self.id, err))
    }

    /// Suspend queues and refresh their wave lists from the context-save
    /// snapshot.
    pub(crate) fn suspend_queues(&mut self, queues: &[QueueId], reason: &str) -> Result<()> {
        log::debug!("{}: suspending {:?} ({})", self.id, queues, reason);
        self.driver.suspend_queues(queues)?;
        for &id in queues {
            self.queue_mut(id)?.suspended = true;
        }
        for &id in queues {
            self.refresh_waves(id)?;
        }
        Ok(())
    }

    /// Flush dirty register caches, then resume the queues.
    pub(crate) fn resume_queues(&mut self, queues: &[QueueId], reason: &str) -> Result<()> {
        log::debug!("{}: resuming {:?} ({})", self.id, queues, reason);
        for &id in queues {
            let dirty: Vec<WaveId> = std::mem::take(&mut self.queue_mut(id)?.dirty_caches)
                .into_iter()
                .collect();
            for wave_id in dirty {
                let Some(mut wave) = self.take_wave(wave_id) else {
                    continue;
                };
                let result = wave.flush_register_cache(&mut *self.memory);
                self.put_wave(wave);
                result?;
            }
        }
        self.driver.resume_queues(queues)?;
        for &id in queues {
            self.queue_mut(id)?.suspended = false;
        }
        Ok(())
    }

    /// Run `f` with `queue` suspended. The queue is suspended on entry if it
    /// is not already, and resumed on every exit path, but only if this call
    /// suspended it and the client requires forward progress.
    pub(crate) fn with_suspended_queue<R>(
        &mut self,
        queue: QueueId,
        reason: &str,
        f: impl FnOnce(&mut Process) -> Result<R>,
    ) -> Result<R> {
        let already_suspended = self.queue(queue)?.is_suspended();
        if !already_suspended {
            self.suspend_queues(&[queue], reason)?;
        }

        let result = f(self);

        if !already_suspended && self.forward_progress_needed {
            let resumed = self.resume_queues(&[queue], reason);
            return match (result, resumed) {
                (Ok(value), Ok(())) => Ok(value),
                (Err(err), _) => Err(err),
                (Ok(_), Err(err)) => Err(err),
            };
        }
        result
    }

    pub(crate) fn send_exceptions(
        &mut self,
        exceptions: OsExceptionMask,
        queue: QueueId,
    ) -> Result<()> {
        self.driver.send_exceptions(exceptions, queue)
    }

    // ---- wave list refresh ----------------------------------------------

    /// Rebuild the wave list of a suspended queue from the driver's
    /// context-save snapshot: match snapshot entries to known waves, create
    /// waves for new entries, update every matched wave, and retire waves
    /// that no longer exist.
    fn refresh_waves(&mut self, queue_id: QueueId) -> Result<()> {
        debug_assert!(self.queue(queue_id).map_or(false, Queue::is_suspended));
        let snapshot = self.driver.queue_snapshot(queue_id)?;

        let (agent_id, callbacks) = {
            let queue = self.queue(queue_id)?;
            (queue.agent(), queue.callbacks())
        };
        let architecture = Arc::clone(self.agent(agent_id)?.architecture());

        let records: Vec<CwsrRecord> = snapshot
            .iter()
            .map(|entry| CwsrRecord::new(&entry.cwsr))
            .collect();

        // Waves of this queue in creation order, for slot-order matching
        // when the ttmps carry no wave id.
        let by_slot: Vec<WaveId> = self
            .waves
            .values()
            .filter(|wave| wave.queue_id() == queue_id)
            .map(|wave| wave.id())
            .collect();

        let mut matched: BTreeSet<WaveId> = BTreeSet::new();
        let mut ids: Vec<WaveId> = Vec::with_capacity(snapshot.len());

        for (index, entry) in snapshot.iter().enumerate() {
            let found = if self.ttmps_setup_enabled {
                let address = records[index]
                    .register_address(Regnum::WaveId)
                    .ok_or_else(|| fatal!("wave_id register is not addressable"))?;
                let mut raw = [0u8; 8];
                self.memory.read_global_memory(address, &mut raw)?;
                let candidate = WaveId(u64::from_le_bytes(raw));
                (candidate.0 != 0
                    && !matched.contains(&candidate)
                    && self
                        .waves
                        .get(&candidate)
                        .map_or(false, |wave| wave.queue_id() == queue_id))
                .then_some(candidate)
            } else {
                by_slot.get(index).copied().filter(|id| !matched.contains(id))
            };

            let id = found.unwrap_or_else(|| {
                let id = WaveId::allocate();
                let visibility = if entry.halted_at_launch {
                    Visibility::HiddenHaltedAtLaunch
                } else {
                    Visibility::Visible
                };
                let wave = Wave::new(
                    id,
                    queue_id,
                    agent_id,
                    entry.dispatch,
                    Arc::clone(&architecture),
                    Arc::clone(&callbacks),
                    entry.cwsr.lane_count,
                    visibility,
                );
                self.waves.insert(id, wave);
                self.waves_changed = true;
                id
            });
            matched.insert(id);
            ids.push(id);
        }

        for (index, entry) in snapshot.iter().enumerate() {
            let leader = ids[entry.group_leader];
            let record = records[index].clone();
            let mut wave = self
                .take_wave(ids[index])
                .ok_or_else(|| fatal!("{} vanished during refresh", ids[index]))?;
            let result = wave.update(self, leader, record).and_then(|_| {
                // A wave halted at launch becomes visible once the driver
                // can associate it with a dispatch.
                if wave.visibility() == Visibility::HiddenHaltedAtLaunch
                    && entry.dispatch.is_some()
                {
                    wave.assign_dispatch(entry.dispatch);
                    wave.set_visibility(self, Visibility::Visible)?;
                }
                Ok(())
            });
            self.put_wave(wave);
            result?;
        }

        let exited: Vec<WaveId> = self
            .waves
            .values()
            .filter(|wave| wave.queue_id() == queue_id && !matched.contains(&wave.id()))
            .map(|wave| wave.id())
            .collect();
        for id in exited {
            self.destroy_wave(id)?;
        }
        Ok(())
    }

    /// Retire a wave. A wave may only carry an outstanding displaced
    /// stepping to its destruction when its queue is invalid (process exit);
    /// otherwise the operation must have been completed or cancelled first.
    pub(crate) fn destroy_wave(&mut self, id: WaveId) -> Result<()> {
        let Some(wave) = self.waves.remove(&id) else {
            return Ok(());
        };
        log::debug!("{}: destroyed {}", self.id, id);
        if let Some(ds) = wave.displaced_stepping_id() {
            let queue_valid = self
                .queues
                .get(&wave.queue_id())
                .map_or(false, Queue::is_valid);
            assert!(
                !queue_valid,
                "wave destroyed with an outstanding displaced stepping"
            );
            self.displaced_release(ds)?;
        }
        if let Some(queue) = self.queues.get_mut(&wave.queue_id()) {
            queue.dirty_caches.remove(&id);
        }
        self.waves_changed = true;
        Ok(())
    }

    /// Invalidate all queues and retire all waves (process exit path).
    pub(crate) fn detach(&mut self) -> Result<()> {
        for queue in self.queues.values_mut() {
            queue.valid = false;
            queue.suspended = false;
        }
        let ids: Vec<WaveId> = self.waves.keys().copied().collect();
        for id in ids {
            self.destroy_wave(id)?;
        }
        Ok(())
    }

    /// Queue ids that are currently not suspended.
    pub(crate) fn running_queues(&self) -> Vec<QueueId> {
        self.queues
            .values()
            .filter(|queue| !queue.is_suspended())
            .map(Queue::id)
            .collect()
    }
}
