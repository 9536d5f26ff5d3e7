//! Context-switch event feed.
//!
//! The attribution switch path needs `(cpu, pgid of the incoming task)` for
//! every context switch. The production feed enables the kernel's
//! `sched_switch` tracepoint and tails `trace_pipe`, resolving each incoming
//! pid to its process group through a bounded cache. Tests bypass this module
//! entirely and drive `AttributionTable::on_context_switch` directly.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::attribution::AttributionTable;

/// pid -> pgid entries kept before the cache is flushed wholesale. Process
/// group membership is stable for the long-running workloads we track, so a
/// coarse flush beats per-entry invalidation.
const PGID_CACHE_CAP: usize = 65536;

fn tracefs_root() -> Result<PathBuf> {
    for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        if std::path::Path::new(root).join("trace_pipe").exists() {
            return Ok(PathBuf::from(root));
        }
    }
    bail!("tracefs not mounted (tried /sys/kernel/tracing and /sys/kernel/debug/tracing)");
}

/// A parsed sched_switch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    pub cpu: usize,
    pub next_pid: i32,
}

/// Parse one trace_pipe line, e.g.
/// `  bash-1234  [003] d..2. 123.456789: sched_switch: prev_comm=... ==> next_comm=make next_pid=567 next_prio=120`
pub fn parse_switch_line(line: &str) -> Option<SwitchEvent> {
    if !line.contains("sched_switch:") {
        return None;
    }

    let cpu_start = line.find('[')?;
    let cpu_end = line[cpu_start..].find(']')? + cpu_start;
    let cpu = line[cpu_start + 1..cpu_end].trim().parse::<usize>().ok()?;

    let pid_field = line.find("next_pid=")?;
    let rest = &line[pid_field + "next_pid=".len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let next_pid = rest[..end].parse::<i32>().ok()?;

    Some(SwitchEvent { cpu, next_pid })
}

/// Tails trace_pipe and feeds switch events into the attribution table.
pub struct SwitchFeed {
    reader: BufReader<File>,
    enable_path: PathBuf,
    pgid_cache: HashMap<i32, i32>,
}

impl SwitchFeed {
    /// Enable the sched_switch tracepoint and open the pipe.
    pub fn open() -> Result<Self> {
        let root = tracefs_root()?;
        let enable_path = root.join("events/sched/sched_switch/enable");
        std::fs::write(&enable_path, "1")
            .with_context(|| format!("enabling {}", enable_path.display()))?;

        let pipe = File::open(root.join("trace_pipe"))
            .with_context(|| format!("opening {}", root.join("trace_pipe").display()))?;
        info!("tracefs: sched_switch feed enabled via {}", root.display());

        Ok(SwitchFeed {
            reader: BufReader::new(pipe),
            enable_path,
            pgid_cache: HashMap::new(),
        })
    }

    fn pgid_of(&mut self, pid: i32) -> i32 {
        if pid <= 0 {
            // The idle task has pid 0, which getpgid would read as "self".
            return 0;
        }
        if let Some(pgid) = self.pgid_cache.get(&pid) {
            return *pgid;
        }
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid < 0 {
            // Task exited between the trace line and the lookup.
            return 0;
        }
        if self.pgid_cache.len() >= PGID_CACHE_CAP {
            self.pgid_cache.clear();
        }
        self.pgid_cache.insert(pid, pgid);
        pgid
    }

    /// Pump events into the table until shutdown. Blocks in trace_pipe reads.
    pub fn run(mut self, table: Arc<AttributionTable>, shutdown: Arc<AtomicBool>) {
        let mut line = String::new();
        while !shutdown.load(Ordering::Relaxed) {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("tracefs: trace_pipe read failed: {e}");
                    break;
                }
            }
            let Some(event) = parse_switch_line(&line) else {
                continue;
            };
            let next_pgid = self.pgid_of(event.next_pid);
            table.on_context_switch(event.cpu, next_pgid);
        }
        info!("tracefs: switch feed stopped");
    }
}

impl Drop for SwitchFeed {
    fn drop(&mut self) {
        let _ = std::fs::write(&self.enable_path, "0");
    }
}
