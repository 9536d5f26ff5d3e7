//! Per-CPU hardware counters via the raw perf_event_open syscall.
//!
//! Two counting events are opened per logical CPU, cycles and retired
//! instructions, and read as plain u64 values from the event fds. Both are
//! system-wide per-CPU counters (pid = -1), matching the attribution model:
//! each logical CPU owns its counter pair, so deltas taken across a context
//! switch on that CPU belong to whatever ran there.

use std::io;
use std::mem;

use anyhow::{bail, Context, Result};
use log::info;

use crate::attribution::CounterSource;

const PERF_TYPE_HARDWARE: u32 = 0x0;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

#[repr(C)]
union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

#[repr(C)]
#[allow(non_camel_case_types)]
struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

fn perf_event_open(
    attr: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> libc::c_long {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    }
}

fn open_counter(cpu: usize, config: u64) -> Result<i32> {
    let mut attr: perf_event_attr = unsafe { mem::zeroed() };
    attr._type = PERF_TYPE_HARDWARE;
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.config = config;

    let fd = perf_event_open(&attr, -1, cpu as libc::c_int, -1, 0) as i32;
    if fd < 0 {
        let err = io::Error::last_os_error();
        bail!("perf_event_open(config={config}) failed on cpu {cpu}: {err}");
    }
    Ok(fd)
}

fn read_counter(fd: i32) -> Result<u64> {
    let mut value: u64 = 0;
    let rc = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if rc != mem::size_of::<u64>() as isize {
        bail!("perf counter read failed: {}", io::Error::last_os_error());
    }
    Ok(value)
}

/// Cycle and instruction counters for every logical CPU.
pub struct PerfCounters {
    /// `(cycles_fd, instructions_fd)` indexed by CPU.
    fds: Vec<(i32, i32)>,
}

impl PerfCounters {
    /// Open both counters on every CPU. Failure on any CPU is fatal: without
    /// a complete counter set the attribution deltas would silently skew.
    pub fn open(nr_cpus: usize) -> Result<Self> {
        let mut fds = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let cycles = open_counter(cpu, PERF_COUNT_HW_CPU_CYCLES)
                .with_context(|| format!("cycles counter on cpu {cpu}"))?;
            let instructions = match open_counter(cpu, PERF_COUNT_HW_INSTRUCTIONS) {
                Ok(fd) => fd,
                Err(e) => {
                    unsafe { libc::close(cycles) };
                    return Err(e).with_context(|| format!("instructions counter on cpu {cpu}"));
                }
            };
            fds.push((cycles, instructions));
        }
        info!("perf: opened counters on {nr_cpus} CPUs");
        Ok(PerfCounters { fds })
    }
}

impl CounterSource for PerfCounters {
    fn read(&self, cpu: usize) -> Result<(u64, u64)> {
        let Some((cycles_fd, instructions_fd)) = self.fds.get(cpu).copied() else {
            bail!("no counters for cpu {cpu}");
        };
        Ok((read_counter(cycles_fd)?, read_counter(instructions_fd)?))
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        for (cycles, instructions) in self.fds.drain(..) {
            unsafe {
                libc::close(cycles);
                libc::close(instructions);
            }
        }
    }
}
