//! Memory-aware admission control for external conversion jobs.
//!
//! ## Why not a plain semaphore?
//!
//! A fixed job count sized to the CPU works until ImageMagick decodes a
//! 1200 dpi scan and grows to a gigabyte of resident memory; four of those in
//! parallel can take the machine into swap. The scheduler therefore prices
//! every job at a configurable memory budget and admits new work only while
//! the system can pay for it. Jobs already running are assumed to grow to the
//! full budget, but their *measured* resident set (capped at the budget) is
//! credited back, so many small jobs still run concurrently while one
//! genuinely heavy job throttles admission.
//!
//! [`JobScheduler`] is a cheap cloneable handle. [`JobScheduler::acquire`]
//! suspends until a slot is admitted and returns a [`Permit`] that releases
//! its slot on drop, on every exit path including cancellation. Callers that
//! spawn a subprocess register its pid through the permit so the admission
//! estimate sees the child's real footprint.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use super::lock;

/// Source of the memory samples used in admission decisions.
///
/// The default implementation reads the operating system; tests substitute a
/// deterministic probe.
pub trait MemoryProbe: Send + Sync {
    /// Memory currently available to new allocations, in bytes.
    fn free_memory(&self) -> u64;

    /// Resident set size of a process in bytes, or `None` if it has exited.
    fn process_rss(&self, pid: u32) -> Option<u64>;
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Arc<P> {
    fn free_memory(&self) -> u64 {
        (**self).free_memory()
    }

    fn process_rss(&self, pid: u32) -> Option<u64> {
        (**self).process_rss(pid)
    }
}

/// [`MemoryProbe`] backed by [`sysinfo`].
pub struct SystemMemoryProbe {
    system: Mutex<sysinfo::System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        SystemMemoryProbe {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn free_memory(&self) -> u64 {
        let mut system = lock(&self.system);
        system.refresh_memory();
        system.available_memory()
    }

    fn process_rss(&self, pid: u32) -> Option<u64> {
        let mut system = lock(&self.system);
        let pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            true,
            sysinfo::ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────

struct SchedulerState {
    /// Permits currently out, including ones sitting unclaimed in a waiter's
    /// channel.
    held: usize,
    /// FIFO queue of suspended acquirers. Newcomers queue behind existing
    /// waiters even when a slot is available, so admission order is arrival
    /// order.
    waiters: VecDeque<oneshot::Sender<Permit>>,
    /// Live subprocess pids registered by permit holders.
    pids: HashSet<u32>,
}

struct SchedulerShared {
    job_count: usize,
    job_memory: u64,
    reserved_memory: u64,
    probe: Box<dyn MemoryProbe>,
    state: Mutex<SchedulerState>,
}

/// Admission-control scheduler bounding concurrent external jobs.
#[derive(Clone)]
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
}

impl JobScheduler {
    /// Scheduler sampling real system memory.
    ///
    /// `job_count` and `job_memory` are clamped to at least one so a
    /// zero-configured scheduler degrades to "one job at a time" instead of
    /// dividing by zero.
    pub fn new(job_count: usize, job_memory: u64, reserved_memory: u64) -> JobScheduler {
        Self::with_probe(job_count, job_memory, reserved_memory, SystemMemoryProbe::new())
    }

    /// Scheduler with a caller-supplied memory probe.
    pub fn with_probe<P: MemoryProbe + 'static>(
        job_count: usize,
        job_memory: u64,
        reserved_memory: u64,
        probe: P,
    ) -> JobScheduler {
        JobScheduler {
            shared: Arc::new(SchedulerShared {
                job_count: job_count.max(1),
                job_memory: job_memory.max(1),
                reserved_memory,
                probe: Box::new(probe),
                state: Mutex::new(SchedulerState {
                    held: 0,
                    waiters: VecDeque::new(),
                    pids: HashSet::new(),
                }),
            }),
        }
    }

    /// Suspend until a job slot is admitted.
    ///
    /// Dropping the returned future while it waits removes the caller from
    /// the queue without consuming a slot; dropping it after a permit was
    /// already handed over releases that permit and wakes a successor.
    pub async fn acquire(&self) -> Permit {
        let receiver = {
            let mut state = lock(&self.shared.state);
            // Cancelled waiters leave a dead sender behind; purge them so an
            // all-dead queue does not make newcomers wait for a release that
            // may never come.
            state.waiters.retain(|waiter| !waiter.is_closed());
            if state.waiters.is_empty() && self.availability(&state) > 0 {
                state.held += 1;
                return Permit::new(self.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        // The sender lives in the scheduler state and this handle keeps the
        // scheduler alive, so the channel cannot close before a permit
        // arrives.
        match receiver.await {
            Ok(permit) => permit,
            Err(_) => unreachable!("scheduler dropped while a waiter held a handle to it"),
        }
    }

    /// Slots the scheduler would admit right now.
    ///
    /// Of the free slots, admit only as many additional jobs as the measured
    /// headroom can pay for at the full per-job budget:
    ///
    /// `min(free_slots, (free_memory - reserved - budget * held + credit) / budget)`
    ///
    /// where `credit` sums `min(budget, rss(pid))` over registered live pids.
    fn availability(&self, state: &SchedulerState) -> usize {
        let shared = &self.shared;
        let free_slots = shared.job_count - state.held;
        if free_slots == 0 {
            return 0;
        }
        let budget = shared.job_memory as i128;
        let mut headroom = shared.probe.free_memory() as i128
            - shared.reserved_memory as i128
            - budget * state.held as i128;
        for &pid in &state.pids {
            if let Some(rss) = shared.probe.process_rss(pid) {
                headroom += (rss as i128).min(budget);
            }
        }
        let by_memory = (headroom.max(0) / budget).clamp(0, free_slots as i128) as usize;
        let mut admitted = by_memory;
        if state.held == 0 && admitted == 0 {
            // Nothing is running and the system is already below the
            // reserve. Admit one job anyway so the build makes progress
            // instead of deadlocking; memory pressure only throttles, it
            // never stops the pipeline.
            admitted = 1;
        }
        trace!(
            held = state.held,
            free_slots,
            admitted,
            "admission availability"
        );
        admitted
    }

    fn release_slot(&self, held_pids: Vec<u32>) {
        let mut state = lock(&self.shared.state);
        for pid in held_pids {
            state.pids.remove(&pid);
        }
        state.held -= 1;
        self.wake_waiters(&mut state);
    }

    /// Hand permits to as many queued waiters as the recomputed availability
    /// allows. Waiters that were cancelled in the meantime are skipped and
    /// their slot is reclaimed immediately.
    fn wake_waiters(&self, state: &mut SchedulerState) {
        while !state.waiters.is_empty() && self.availability(state) > 0 {
            let waiter = match state.waiters.pop_front() {
                Some(waiter) => waiter,
                None => return,
            };
            state.held += 1;
            if let Err(unclaimed) = waiter.send(Permit::new(self.clone())) {
                // The waiter dropped its receiver. Dismantle the permit by
                // hand: running its Drop here would re-enter the state lock.
                unclaimed.forget();
                state.held -= 1;
            }
        }
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        lock(&self.shared.state).held
    }

    #[cfg(test)]
    fn registered_pids(&self) -> Vec<u32> {
        let state = lock(&self.shared.state);
        let mut pids: Vec<u32> = state.pids.iter().copied().collect();
        pids.sort_unstable();
        pids
    }
}

// ── Permit ────────────────────────────────────────────────────────────────

/// One admitted job slot. Dropping it releases the slot and unregisters any
/// pids still associated with it.
pub struct Permit {
    scheduler: Option<JobScheduler>,
    pids: Vec<u32>,
}

impl Permit {
    fn new(scheduler: JobScheduler) -> Permit {
        Permit {
            scheduler: Some(scheduler),
            pids: Vec::new(),
        }
    }

    /// Register a live subprocess with the admission estimate. The
    /// registration lasts until [`unregister_process`](Self::unregister_process)
    /// or the permit's drop, whichever comes first.
    pub fn register_process(&mut self, pid: u32) {
        if let Some(scheduler) = &self.scheduler {
            lock(&scheduler.shared.state).pids.insert(pid);
            self.pids.push(pid);
        }
    }

    /// Drop a subprocess from the admission estimate once it has exited.
    pub fn unregister_process(&mut self, pid: u32) {
        if let Some(scheduler) = &self.scheduler {
            lock(&scheduler.shared.state).pids.remove(&pid);
            self.pids.retain(|&p| p != pid);
        }
    }

    /// Neutralize the permit without releasing its slot. Only for the waker
    /// loop, which reclaims the slot itself while already holding the state
    /// lock.
    fn forget(mut self) {
        self.scheduler = None;
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("pids", &self.pids)
            .finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.release_slot(std::mem::take(&mut self.pids));
        }
    }
}
