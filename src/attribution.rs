//! Per-process-group IPC attribution.
//!
//! Maintains cumulative CPU cycles and retired instructions for every
//! registered process group, attributing exactly the interval a thread of
//! that group spent running on each logical CPU. The accounting is driven by
//! context-switch events: switch-in arms per-CPU start values, switch-out
//! charges the delta to the outgoing group's slot and republishes its
//! snapshot.
//!
//! Slot reuse is guarded by a per-slot generation counter: a delta whose
//! cached generation no longer matches the slot is silently discarded, so a
//! thread that was switched in before its group was removed can never
//! corrupt a successor group's accumulators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use log::{debug, info, warn};

use crate::snapshot::{SharedRegion, SlotView, MAX_SLOTS};

/// Source of per-CPU hardware counter readings.
///
/// The production implementation reads perf cycle/instruction counters; tests
/// inject deterministic sequences.
pub trait CounterSource: Send + Sync {
    /// Read `(cycles, instructions)` for one logical CPU.
    fn read(&self, cpu: usize) -> Result<(u64, u64)>;
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The pgid already owns a slot. The freshly allocated slot was rolled
    /// back before returning.
    Duplicate,
    /// Slot table exhausted; no state was mutated.
    NoCapacity,
}

struct KernelSlot {
    pgid: i32,
    job_id: i32,
    worker_num: i32,
    gen: u32,
    reset_pending: bool,
    cycles: u64,
    instructions: u64,
}

impl KernelSlot {
    const fn empty() -> Self {
        KernelSlot {
            pgid: 0,
            job_id: 0,
            worker_num: 0,
            gen: 0,
            reset_pending: false,
            cycles: 0,
            instructions: 0,
        }
    }

    fn clear(&mut self) {
        self.pgid = 0;
        self.job_id = 0;
        self.worker_num = 0;
        self.reset_pending = false;
        self.cycles = 0;
        self.instructions = 0;
    }

    fn view(&self) -> SlotView {
        SlotView {
            pgid: self.pgid,
            job_id: self.job_id,
            worker_num: self.worker_num,
            cycles: self.cycles,
            instructions: self.instructions,
        }
    }
}

/// LIFO free list over the dense slot array. Recently freed indices are
/// handed out first to keep the active range compact.
struct FreeList {
    free: Vec<u32>,
    tail: u32,
}

impl FreeList {
    fn pop(&mut self) -> Option<usize> {
        if let Some(idx) = self.free.pop() {
            return Some(idx as usize);
        }
        if (self.tail as usize) < MAX_SLOTS {
            let idx = self.tail;
            self.tail += 1;
            return Some(idx as usize);
        }
        None
    }

    fn push(&mut self, idx: usize) {
        self.free.push(idx as u32);
    }
}

#[derive(Clone, Copy)]
struct SlotRef {
    idx: u32,
    gen: u32,
}

#[derive(Clone, Copy)]
struct PerCpu {
    /// Armed slot for the currently running monitored task, if any.
    slot: Option<SlotRef>,
    start_cycles: u64,
    start_instructions: u64,
}

impl PerCpu {
    const fn disarmed() -> Self {
        PerCpu {
            slot: None,
            start_cycles: 0,
            start_instructions: 0,
        }
    }
}

/// Wraparound-safe counter delta.
fn delta_wrap(cur: u64, prev: u64) -> u64 {
    if cur >= prev {
        cur - prev
    } else {
        (u64::MAX - prev).wrapping_add(1).wrapping_add(cur)
    }
}

/// The IPC attribution table.
pub struct AttributionTable {
    slots: Vec<Mutex<KernelSlot>>,
    alloc: Mutex<FreeList>,
    lookup: RwLock<HashMap<i32, SlotRef>>,
    per_cpu: Vec<Mutex<PerCpu>>,
    counters: Box<dyn CounterSource>,
    region: Arc<SharedRegion>,
    discarded_deltas: AtomicU64,
}

impl AttributionTable {
    pub fn new(nr_cpus: usize, counters: Box<dyn CounterSource>) -> Self {
        AttributionTable {
            slots: (0..MAX_SLOTS).map(|_| Mutex::new(KernelSlot::empty())).collect(),
            alloc: Mutex::new(FreeList {
                free: Vec::new(),
                tail: 0,
            }),
            lookup: RwLock::new(HashMap::new()),
            per_cpu: (0..nr_cpus).map(|_| Mutex::new(PerCpu::disarmed())).collect(),
            counters,
            region: SharedRegion::new(),
            discarded_deltas: AtomicU64::new(0),
        }
    }

    /// The lock-free reader side.
    pub fn region(&self) -> Arc<SharedRegion> {
        Arc::clone(&self.region)
    }

    /// Deltas dropped because their slot generation had advanced.
    pub fn discarded_deltas(&self) -> u64 {
        self.discarded_deltas.load(Ordering::Relaxed)
    }

    /// Register a process group. Allocates a slot, bumps its generation,
    /// publishes an initial zeroed snapshot, then inserts the lookup entry
    /// under a duplicate re-check.
    pub fn add(&self, pgid: i32, job_id: i32, worker_num: i32) -> AddOutcome {
        let Some(idx) = self.alloc.lock().unwrap().pop() else {
            warn!("attribution: slot table full, refusing pgid={pgid}");
            return AddOutcome::NoCapacity;
        };

        let gen = {
            let mut slot = self.slots[idx].lock().unwrap();
            slot.gen = slot.gen.wrapping_add(1);
            slot.pgid = pgid;
            slot.job_id = job_id;
            slot.worker_num = worker_num;
            slot.reset_pending = false;
            slot.cycles = 0;
            slot.instructions = 0;
            self.region.publish(idx, slot.view());
            slot.gen
        };

        {
            let mut lookup = self.lookup.write().unwrap();
            if lookup.contains_key(&pgid) {
                drop(lookup);
                // Roll the slot back: invalidate the generation so any
                // in-flight switch-out against it is discarded.
                let mut slot = self.slots[idx].lock().unwrap();
                slot.gen = slot.gen.wrapping_add(1);
                slot.clear();
                self.region.publish(idx, slot.view());
                drop(slot);
                self.alloc.lock().unwrap().push(idx);
                return AddOutcome::Duplicate;
            }
            lookup.insert(
                pgid,
                SlotRef {
                    idx: idx as u32,
                    gen,
                },
            );
        }

        self.region.set_active(idx);
        self.region.inc_count();
        info!("attribution: added pgid={pgid} job={job_id} workers={worker_num} (slot={idx}, gen={gen})");
        AddOutcome::Added
    }

    /// Unregister a process group. Returns false if it was not registered.
    pub fn remove(&self, pgid: i32) -> bool {
        let slot_ref = {
            let mut lookup = self.lookup.write().unwrap();
            let Some(slot_ref) = lookup.get(&pgid).copied() else {
                return false;
            };
            // Hide from reader iteration before the lookup entry goes away.
            self.region.clear_active(slot_ref.idx as usize);
            lookup.remove(&pgid);
            slot_ref
        };

        let idx = slot_ref.idx as usize;
        {
            let mut slot = self.slots[idx].lock().unwrap();
            slot.gen = slot.gen.wrapping_add(1);
            slot.clear();
            self.region.publish(idx, slot.view());
        }

        self.alloc.lock().unwrap().push(idx);
        self.region.dec_count();
        info!("attribution: removed pgid={pgid} (slot={idx})");
        true
    }

    /// Flag every active slot for reset. The next switch-out replaces the
    /// accumulator with the measured delta instead of adding to it, so
    /// subsequent snapshots cover only the interval since this call.
    pub fn reset_all(&self) {
        for idx in self.region.active_slots() {
            let mut slot = self.slots[idx].lock().unwrap();
            if slot.pgid != 0 {
                slot.reset_pending = true;
            }
        }
    }

    /// Context-switch entry point for one logical CPU.
    ///
    /// `next_pgid` identifies the incoming task's process group; the outgoing
    /// task is implied by the per-CPU armed state. Never blocks on anything
    /// but short slot/lookup critical sections.
    pub fn on_context_switch(&self, cpu: usize, next_pgid: i32) {
        let Some(state) = self.per_cpu.get(cpu) else {
            return;
        };
        let mut state = state.lock().unwrap();

        let next = self.lookup.read().unwrap().get(&next_pgid).copied();

        // Fast path: neither side is monitored, skip the counter reads.
        if state.slot.is_none() && next.is_none() {
            return;
        }

        let (now_cycles, now_instructions) = match self.counters.read(cpu) {
            Ok(v) => v,
            Err(e) => {
                // Disarm without touching the slot; the interval is lost.
                debug!("attribution: counter read failed on cpu {cpu}: {e:#}");
                *state = PerCpu::disarmed();
                return;
            }
        };

        if let Some(prev) = state.slot {
            let delta_cycles = delta_wrap(now_cycles, state.start_cycles);
            let delta_instructions = delta_wrap(now_instructions, state.start_instructions);

            let idx = prev.idx as usize;
            let mut slot = self.slots[idx].lock().unwrap();
            if slot.gen == prev.gen {
                if slot.reset_pending {
                    slot.cycles = delta_cycles;
                    slot.instructions = delta_instructions;
                    slot.reset_pending = false;
                } else {
                    slot.cycles += delta_cycles;
                    slot.instructions += delta_instructions;
                }
                self.region.publish(idx, slot.view());
            } else {
                // Slot was reused while this task ran; drop the interval.
                self.discarded_deltas.fetch_add(1, Ordering::Relaxed);
            }
        }

        *state = match next {
            Some(slot) => PerCpu {
                slot: Some(slot),
                start_cycles: now_cycles,
                start_instructions: now_instructions,
            },
            None => PerCpu::disarmed(),
        };
    }

    #[cfg(test)]
    fn slot_gen(&self, idx: usize) -> u32 {
        self.slots[idx].lock().unwrap().gen
    }
}
