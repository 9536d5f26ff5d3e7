//! Userspace-visible snapshot region.
//!
//! The attribution table publishes per-slot counter snapshots into a
//! page-aligned `#[repr(C)]` region so that readers can iterate live process
//! groups without taking any lock. Each slot carries a seqlock sequence word:
//! even means stable, odd means a writer is mid-update. Readers retry until
//! they observe the same even sequence on both sides of the data read, with
//! an acquire fence in between.
//!
//! The layout matches the mmap contract: an atomic slot count, a bitmap of
//! active slots, then `MAX_SLOTS` 16-byte-aligned snapshot slots.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Capacity of the slot table, shared by the kernel-side and reader-side
/// views.
pub const MAX_SLOTS: usize = 4096;

/// Words in the active-slot bitmap.
pub const MASK_WORDS: usize = MAX_SLOTS / 64;

/// One snapshot slot. 32 bytes, 16-byte aligned so that slot boundaries are
/// stable for any reader that maps the region from another process.
#[repr(C, align(16))]
pub struct SnapshotSlot {
    seq: AtomicU32,
    pgid: AtomicI32,
    job_id: AtomicI32,
    worker_num: AtomicI32,
    cycles: AtomicU64,
    instructions: AtomicU64,
}

/// A consistent copy of one snapshot slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub pgid: i32,
    pub job_id: i32,
    pub worker_num: i32,
    pub cycles: u64,
    pub instructions: u64,
}

/// The shared region. Page-aligned; sized to a whole number of pages when
/// allocated through [`SharedRegion::new`].
#[repr(C, align(4096))]
pub struct SharedRegion {
    count: AtomicI32,
    active_mask: [AtomicU64; MASK_WORDS],
    slots: [SnapshotSlot; MAX_SLOTS],
}

const _: () = assert!(std::mem::size_of::<SnapshotSlot>() == 32);

impl SharedRegion {
    /// Allocate a zeroed region on the heap. Slots start with `pgid = -1`
    /// and an even (zero) sequence, i.e. readable but empty.
    pub fn new() -> Arc<SharedRegion> {
        let layout = Layout::new::<SharedRegion>();
        // Zero-initialized integers are valid atomics, so a raw zeroed
        // allocation avoids materializing the 132 KiB struct on the stack.
        let region = unsafe {
            let ptr = alloc_zeroed(layout) as *mut SharedRegion;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        };
        for slot in region.slots.iter() {
            slot.pgid.store(-1, Ordering::Relaxed);
        }
        Arc::from(region)
    }

    /// Number of bytes a reader must map to see the whole region.
    pub fn mmap_size() -> usize {
        let page = 4096;
        std::mem::size_of::<SharedRegion>().div_ceil(page) * page
    }

    pub fn active_count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn set_active(&self, idx: usize) {
        self.active_mask[idx / 64].fetch_or(1 << (idx % 64), Ordering::Release);
    }

    pub(crate) fn clear_active(&self, idx: usize) {
        self.active_mask[idx / 64].fetch_and(!(1 << (idx % 64)), Ordering::Release);
    }

    pub fn is_active(&self, idx: usize) -> bool {
        self.active_mask[idx / 64].load(Ordering::Acquire) & (1 << (idx % 64)) != 0
    }

    /// Iterate the indices of currently active slots, cheapest bits first.
    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.active_mask
            .iter()
            .enumerate()
            .flat_map(|(word, bits)| {
                let mut bits = bits.load(Ordering::Acquire);
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(word * 64 + bit)
                })
            })
    }

    /// Seqlock write. The caller must hold the owning kernel slot's lock so
    /// that there is exactly one writer per slot; readers never block.
    pub(crate) fn publish(&self, idx: usize, view: SlotView) {
        let slot = &self.slots[idx];
        let seq = slot.seq.load(Ordering::Relaxed);

        // Odd: writer in progress.
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        slot.cycles.store(view.cycles, Ordering::Relaxed);
        slot.instructions.store(view.instructions, Ordering::Relaxed);
        slot.pgid.store(view.pgid, Ordering::Relaxed);
        slot.job_id.store(view.job_id, Ordering::Relaxed);
        slot.worker_num.store(view.worker_num, Ordering::Relaxed);

        fence(Ordering::Release);
        // Even again: snapshot stable.
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Seqlock read, retrying until a stable even-sequence window is seen.
    pub fn read_slot(&self, idx: usize) -> SlotView {
        let slot = &self.slots[idx];
        loop {
            let start = slot.seq.load(Ordering::Acquire);
            if start & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let view = SlotView {
                pgid: slot.pgid.load(Ordering::Relaxed),
                job_id: slot.job_id.load(Ordering::Relaxed),
                worker_num: slot.worker_num.load(Ordering::Relaxed),
                cycles: slot.cycles.load(Ordering::Relaxed),
                instructions: slot.instructions.load(Ordering::Relaxed),
            };

            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) == start {
                return view;
            }
        }
    }

    /// Iterate consistent views of all active slots.
    pub fn iter_views(&self) -> impl Iterator<Item = (usize, SlotView)> + '_ {
        self.active_slots().map(|idx| (idx, self.read_slot(idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn view(pgid: i32, cycles: u64) -> SlotView {
        SlotView {
            pgid,
            job_id: pgid,
            worker_num: 1,
            // The torn-read tests rely on cycles == instructions in every
            // published view.
            cycles,
            instructions: cycles,
        }
    }

    #[test]
    fn region_starts_empty() {
        let region = SharedRegion::new();
        assert_eq!(region.active_count(), 0);
        assert_eq!(region.active_slots().count(), 0);
        let v = region.read_slot(0);
        assert_eq!(v.pgid, -1);
        assert_eq!(v.cycles, 0);
    }

    #[test]
    fn publish_and_read_roundtrip() {
        let region = SharedRegion::new();
        region.publish(7, view(1234, 99));
        let v = region.read_slot(7);
        assert_eq!(v.pgid, 1234);
        assert_eq!(v.cycles, 99);
    }

    #[test]
    fn active_mask_iteration() {
        let region = SharedRegion::new();
        for idx in [0, 63, 64, 4095] {
            region.set_active(idx);
        }
        let active: Vec<usize> = region.active_slots().collect();
        assert_eq!(active, vec![0, 63, 64, 4095]);

        region.clear_active(64);
        let active: Vec<usize> = region.active_slots().collect();
        assert_eq!(active, vec![0, 63, 4095]);
    }

    #[test]
    fn mmap_size_is_page_aligned() {
        assert_eq!(SharedRegion::mmap_size() % 4096, 0);
        assert!(SharedRegion::mmap_size() >= std::mem::size_of::<SharedRegion>());
    }

    // Concurrent readers must never observe a torn snapshot.
    #[test]
    fn seqlock_readers_never_see_torn_snapshots() {
        let region = SharedRegion::new();
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let region = Arc::clone(&region);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut n: u64 = 0;
                while !stop.load(Ordering::Relaxed) {
                    n = n.wrapping_add(1);
                    region.publish(5, view(42, n));
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let region = Arc::clone(&region);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut last = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let v = region.read_slot(5);
                        assert_eq!(v.cycles, v.instructions, "torn snapshot");
                        if v.pgid != -1 {
                            assert_eq!(v.pgid, 42);
                        }
                        // Monotonic within one generation of the writer.
                        assert!(v.cycles >= last);
                        last = v.cycles;
                    }
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
