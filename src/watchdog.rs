//! Long-running workload detection.
//!
//! Watches admitted process groups and, once one has run past the threshold,
//! emits a profiling request to userspace. Attribution registration is gated
//! on the profiling-completion acknowledgement: a group enters the IPC table
//! strictly after its profile exists, so the scheduler never sees a group it
//! cannot score.
//!
//! The periodic tick is two-phase: state is scanned and mutated under one
//! lock while building deferred action lists, and all I/O (notifications,
//! attribution table calls) happens after the lock is released.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Result};
use log::{debug, info, warn};

use crate::attribution::{AddOutcome, AttributionTable};

/// Default long-running threshold, one hour.
pub const DEFAULT_THRESHOLD_SECS: u64 = 3600;

/// Destination for profiling requests. Sends must not block; a would-block
/// failure re-arms the request for the next tick.
pub trait NotifySink: Send + Sync {
    fn send_request(&self, pgid: i32, elapsed_secs: u64, job_id: i32) -> io::Result<()>;
}

/// Liveness probe for a process group. The production probe signals the
/// group with a null signal.
pub trait LivenessProbe: Send + Sync {
    fn alive(&self, pgid: i32) -> bool;
}

/// `kill(-pgid, 0)` liveness: succeeds while any member task exists.
pub struct KillProbe;

impl LivenessProbe for KillProbe {
    fn alive(&self, pgid: i32) -> bool {
        unsafe { libc::kill(-pgid, 0) == 0 }
    }
}

struct WatchEntry {
    job_id: i32,
    worker_num: i32,
    start: Instant,
    need_send_request: bool,
    is_long_running: bool,
    profile_done: bool,
    registered: bool,
}

/// The watchdog state table.
pub struct Watchdog {
    entries: Mutex<HashMap<i32, WatchEntry>>,
    threshold_secs: AtomicU64,
    probe: Box<dyn LivenessProbe>,
}

impl Watchdog {
    pub fn new(probe: Box<dyn LivenessProbe>) -> Self {
        Watchdog {
            entries: Mutex::new(HashMap::new()),
            threshold_secs: AtomicU64::new(DEFAULT_THRESHOLD_SECS),
            probe,
        }
    }

    /// Admit a process group for watching. An initial profiling request is
    /// armed so the profile can be warmed before the threshold trips.
    pub fn add_pgid(&self, pgid: i32, job_id: i32, worker_num: i32) -> Result<()> {
        if pgid <= 0 {
            bail!("invalid pgid {pgid}");
        }
        if !self.probe.alive(pgid) {
            bail!("process group {pgid} has no tasks");
        }

        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&pgid) {
            bail!("pgid {pgid} is already watched");
        }
        entries.insert(
            pgid,
            WatchEntry {
                job_id,
                worker_num,
                start: Instant::now(),
                need_send_request: true,
                is_long_running: false,
                profile_done: false,
                registered: false,
            },
        );
        info!("watchdog: watching pgid={pgid} job={job_id} workers={worker_num}");
        Ok(())
    }

    /// Forget a process group, removing it from attribution if registered.
    pub fn remove_pgid(&self, pgid: i32, table: &AttributionTable) -> Result<()> {
        let registered = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.remove(&pgid) else {
                bail!("pgid {pgid} is not watched");
            };
            entry.registered
        };
        if registered && !table.remove(pgid) {
            warn!("watchdog: pgid {pgid} was marked registered but not in the table");
        }
        info!("watchdog: forgot pgid={pgid}");
        Ok(())
    }

    pub fn set_threshold(&self, secs: u64) -> Result<()> {
        if secs == 0 {
            bail!("threshold must be positive");
        }
        let old = self.threshold_secs.swap(secs, Ordering::Relaxed);
        info!("watchdog: threshold {old}s -> {secs}s");
        Ok(())
    }

    pub fn threshold(&self) -> u64 {
        self.threshold_secs.load(Ordering::Relaxed)
    }

    /// Force a profiling request for the process group of `pid` on the next
    /// tick.
    pub fn request_profile(&self, pid: i32) -> Result<()> {
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid <= 0 {
            bail!("no process group for pid {pid}");
        }
        self.rearm_request(pgid)
    }

    /// Re-arm the profiling request flag for a watched pgid.
    pub fn rearm_request(&self, pgid: i32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&pgid) else {
            bail!("pgid {pgid} is not watched");
        };
        entry.need_send_request = true;
        Ok(())
    }

    /// Profiling-completion acknowledgement. Only flips the gate; the
    /// threshold scan remains the sole writer of `is_long_running`, so both
    /// signals stay observable.
    pub fn ack(&self, pgid: i32) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&pgid) {
            Some(entry) => {
                entry.profile_done = true;
                info!(
                    "watchdog: profiling ACK for pgid={pgid} (long_running={})",
                    entry.is_long_running
                );
            }
            None => debug!("watchdog: ACK for unknown pgid={pgid}"),
        }
    }

    /// One 1 Hz tick. Phase 1 mutates state under the lock and collects
    /// deferred work; phase 2 performs the attribution calls and
    /// notifications without holding it.
    pub fn tick(&self, table: &AttributionTable, notify: &dyn NotifySink) {
        struct PendingNotify {
            pgid: i32,
            elapsed_secs: u64,
            job_id: i32,
        }
        struct PendingRegister {
            pgid: i32,
            job_id: i32,
            worker_num: i32,
        }

        let threshold = self.threshold();
        let mut to_notify: Vec<PendingNotify> = Vec::new();
        let mut to_register: Vec<PendingRegister> = Vec::new();
        let mut to_unregister: Vec<i32> = Vec::new();

        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|pgid, entry| {
                if !self.probe.alive(*pgid) {
                    info!("watchdog: pgid={pgid} has no tasks, dropping");
                    if entry.registered {
                        to_unregister.push(*pgid);
                    }
                    return false;
                }

                let elapsed = entry.start.elapsed().as_secs();

                if !entry.is_long_running && elapsed >= threshold {
                    entry.is_long_running = true;
                    entry.need_send_request = true;
                    info!(
                        "watchdog: pgid={pgid} long-running after {elapsed}s (profile_done={})",
                        entry.profile_done
                    );
                }

                // ACK-gated registration, deferred to phase 2. Marked
                // optimistically; rolled back there on failure.
                if entry.is_long_running && entry.profile_done && !entry.registered {
                    entry.registered = true;
                    to_register.push(PendingRegister {
                        pgid: *pgid,
                        job_id: entry.job_id,
                        worker_num: entry.worker_num,
                    });
                }

                if entry.need_send_request {
                    entry.need_send_request = false;
                    to_notify.push(PendingNotify {
                        pgid: *pgid,
                        elapsed_secs: elapsed,
                        job_id: entry.job_id,
                    });
                }

                true
            });
        }

        for pending in to_register {
            match table.add(pending.pgid, pending.job_id, pending.worker_num) {
                AddOutcome::Added => {}
                // Already attributed, keep the registered mark.
                AddOutcome::Duplicate => {}
                AddOutcome::NoCapacity => {
                    warn!(
                        "watchdog: attribution table full, will retry pgid={}",
                        pending.pgid
                    );
                    let mut entries = self.entries.lock().unwrap();
                    if let Some(entry) = entries.get_mut(&pending.pgid) {
                        entry.registered = false;
                    }
                }
            }
        }

        for pgid in to_unregister {
            if !table.remove(pgid) {
                debug!("watchdog: dead pgid={pgid} was not in the attribution table");
            }
        }

        for pending in to_notify {
            if let Err(e) = notify.send_request(pending.pgid, pending.elapsed_secs, pending.job_id)
            {
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory) {
                    // Transient send failure: re-arm for the next tick.
                    let mut entries = self.entries.lock().unwrap();
                    if let Some(entry) = entries.get_mut(&pending.pgid) {
                        entry.need_send_request = true;
                    }
                } else {
                    debug!(
                        "watchdog: profiling request for pgid={} failed: {e}",
                        pending.pgid
                    );
                }
            }
        }
    }

    #[cfg(test)]
    fn flags(&self, pgid: i32) -> Option<(bool, bool, bool)> {
        self.entries
            .lock()
            .unwrap()
            .get(&pgid)
            .map(|e| (e.is_long_running, e.profile_done, e.registered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::CounterSource;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex as StdMutex};

    struct NullCounters;
    impl CounterSource for NullCounters {
        fn read(&self, _cpu: usize) -> Result<(u64, u64)> {
            Ok((0, 0))
        }
    }

    struct AlwaysAlive;
    impl LivenessProbe for AlwaysAlive {
        fn alive(&self, _pgid: i32) -> bool {
            true
        }
    }

    struct DeadSet(StdMutex<HashSet<i32>>);
    impl LivenessProbe for Arc<DeadSet> {
        fn alive(&self, pgid: i32) -> bool {
            !self.0.lock().unwrap().contains(&pgid)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(i32, i32)>>,
        reject: AtomicBool,
    }

    impl NotifySink for Arc<RecordingSink> {
        fn send_request(&self, pgid: i32, _elapsed: u64, job_id: i32) -> io::Result<()> {
            if self.reject.load(Ordering::Relaxed) {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.sent.lock().unwrap().push((pgid, job_id));
            Ok(())
        }
    }

    fn table() -> AttributionTable {
        AttributionTable::new(2, Box::new(NullCounters))
    }

    fn watched(pgid: i32, job: i32, workers: i32) -> Watchdog {
        let dog = Watchdog::new(Box::new(AlwaysAlive));
        dog.add_pgid(pgid, job, workers).unwrap();
        dog
    }

    #[test]
    fn duplicate_admission_fails() {
        let dog = watched(42, 1, 2);
        assert!(dog.add_pgid(42, 1, 2).is_err());
    }

    #[test]
    fn initial_request_goes_out_on_first_tick() {
        let dog = watched(42, 7, 2);
        let table = table();
        let sink = Arc::new(RecordingSink::default());

        dog.tick(&table, &sink);
        assert_eq!(sink.sent.lock().unwrap().as_slice(), &[(42, 7)]);

        // One-shot until re-armed.
        dog.tick(&table, &sink);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    // ACK gating: the attribution table must never see a pgid before both
    // the threshold and the acknowledgement.
    #[test]
    fn registration_is_ack_gated() {
        let dog = watched(42, 7, 2);
        dog.set_threshold(1).unwrap();
        // Force the threshold to be already crossed.
        {
            let mut entries = dog.entries.lock().unwrap();
            entries.get_mut(&42).unwrap().start =
                Instant::now() - std::time::Duration::from_secs(10);
        }
        let table = table();
        let sink = Arc::new(RecordingSink::default());

        dog.tick(&table, &sink);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 0, "registered before ACK");
        assert_eq!(dog.flags(42), Some((true, false, false)));

        dog.ack(42);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 1);
        assert_eq!(dog.flags(42), Some((true, true, true)));
        let view = table
            .region()
            .iter_views()
            .find(|(_, v)| v.pgid == 42)
            .unwrap()
            .1;
        assert_eq!(view.job_id, 7);
        assert_eq!(view.worker_num, 2);
    }

    // An early ACK alone must not register: the threshold stays
    // authoritative.
    #[test]
    fn early_ack_waits_for_threshold() {
        let dog = watched(42, 7, 2);
        // Threshold far in the future.
        dog.set_threshold(100_000).unwrap();
        let table = table();
        let sink = Arc::new(RecordingSink::default());

        dog.ack(42);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 0);
        assert_eq!(dog.flags(42), Some((false, true, false)));
    }

    #[test]
    fn dead_pgid_is_dropped_and_unregistered() {
        let dead = Arc::new(DeadSet(StdMutex::new(HashSet::new())));
        let dog = Watchdog::new(Box::new(Arc::clone(&dead)));
        dog.add_pgid(42, 7, 2).unwrap();
        dog.set_threshold(1).unwrap();
        {
            let mut entries = dog.entries.lock().unwrap();
            entries.get_mut(&42).unwrap().start =
                Instant::now() - std::time::Duration::from_secs(10);
        }
        let table = table();
        let sink = Arc::new(RecordingSink::default());

        dog.ack(42);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 1);

        dead.0.lock().unwrap().insert(42);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 0);
        assert_eq!(dog.flags(42), None);
    }

    #[test]
    fn would_block_rearms_the_request() {
        let dog = watched(42, 7, 2);
        let table = table();
        let sink = Arc::new(RecordingSink::default());

        sink.reject.store(true, Ordering::Relaxed);
        dog.tick(&table, &sink);
        assert!(sink.sent.lock().unwrap().is_empty());

        sink.reject.store(false, Ordering::Relaxed);
        dog.tick(&table, &sink);
        assert_eq!(sink.sent.lock().unwrap().as_slice(), &[(42, 7)]);
    }

    #[test]
    fn capacity_refusal_retries_on_later_ticks() {
        let dog = Watchdog::new(Box::new(AlwaysAlive));
        let table = table();
        // Exhaust the slot table.
        for pgid in 1..=(crate::snapshot::MAX_SLOTS as i32) {
            assert_eq!(table.add(pgid + 100_000, pgid, 1), AddOutcome::Added);
        }

        dog.add_pgid(42, 7, 2).unwrap();
        dog.set_threshold(1).unwrap();
        {
            let mut entries = dog.entries.lock().unwrap();
            entries.get_mut(&42).unwrap().start =
                Instant::now() - std::time::Duration::from_secs(10);
        }
        let sink = Arc::new(RecordingSink::default());
        dog.ack(42);

        dog.tick(&table, &sink);
        assert_eq!(dog.flags(42), Some((true, true, false)), "rolled back");

        // A slot frees up; the next tick succeeds.
        assert!(table.remove(100_001));
        dog.tick(&table, &sink);
        assert_eq!(dog.flags(42), Some((true, true, true)));
    }

    #[test]
    fn remove_pgid_unregisters() {
        let dog = watched(42, 7, 2);
        dog.set_threshold(1).unwrap();
        {
            let mut entries = dog.entries.lock().unwrap();
            entries.get_mut(&42).unwrap().start =
                Instant::now() - std::time::Duration::from_secs(10);
        }
        let table = table();
        let sink = Arc::new(RecordingSink::default());
        dog.ack(42);
        dog.tick(&table, &sink);
        assert_eq!(table.region().active_count(), 1);

        dog.remove_pgid(42, &table).unwrap();
        assert_eq!(table.region().active_count(), 0);
        assert!(dog.remove_pgid(42, &table).is_err());
    }
}
