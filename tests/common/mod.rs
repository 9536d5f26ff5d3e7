//! Shared fixtures for the integration tests: a file-backed profile store
//! with injector references and a trained model, deterministic counter
//! sources, and a liveness probe that answers for synthetic pgids.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

use smtpair::attribution::CounterSource;
use smtpair::resources::Catalog;
use smtpair::watchdog::LivenessProbe;

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "smtpair-it-{tag}-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub const NODE: &str = "testnode";

fn measurement(job: i32, feature: &str, pressure: i32, run_type: &str, ipc: f64) -> String {
    format!(
        r#"{{"node_name": "{NODE}", "job_id": {job}, "feature": "{feature}",
            "pressure": {pressure}, "run_type": "{run_type}", "IPC": {ipc}}}"#
    )
}

/// Write a complete measurement collection and trained model into `dir`.
///
/// Each `(job_id, single_ipc, load)` entry produces a workload whose
/// contention characteristics scale with `load` in `[0, 1]`: heavier loads
/// drop more IPC under pressure and push harder on the injectors.
pub fn write_store_fixture(dir: &PathBuf, jobs: &[(i32, f64, f64)]) {
    let catalog = Catalog::intel_gen11();
    let mut docs: Vec<String> = Vec::new();

    // Injector reference runs: solo (-1) and the saturated companion (-3).
    for resource in catalog.iter() {
        docs.push(measurement(-1, resource.name, 0, "injector", 2.0));
        docs.push(measurement(-1, resource.name, 1, "injector", 1.6));
        docs.push(measurement(-1, resource.name, 2, "injector", 1.2));
        docs.push(measurement(-3, resource.name, 0, "injector", 1.8));
        docs.push(measurement(-3, resource.name, 1, "injector", 0.8));
    }

    for &(job, single_ipc, load) in jobs {
        let low = single_ipc * (1.0 - 0.05 * load);
        let medium = single_ipc * (1.0 - 0.20 * load);
        let high = single_ipc * (1.0 - 0.40 * load);
        // How much this workload hurts a co-running injector.
        let injector_corun = 2.0 * (1.0 - 0.3 * load);
        let injector_contended = 1.8 - load * (1.8 - 0.8);

        docs.push(measurement(job, "single", 0, "workload", single_ipc));
        docs.push(measurement(job, "l3_cache", 0, "workload", low));

        for resource in catalog.iter() {
            use smtpair::resources::ResourceKind;
            match resource.kind {
                ResourceKind::Sequential => {
                    docs.push(measurement(job, resource.name, 0, "workload", low));
                    docs.push(measurement(job, resource.name, 1, "workload", medium));
                    docs.push(measurement(job, resource.name, 2, "workload", high));
                    docs.push(measurement(job, resource.name, 0, "injector", injector_corun));
                }
                ResourceKind::Parallel => {
                    docs.push(measurement(job, resource.name, 0, "workload", low));
                    docs.push(measurement(job, resource.name, 1, "workload", high));
                    docs.push(measurement(job, resource.name, 0, "injector", injector_corun));
                    docs.push(measurement(
                        job,
                        resource.name,
                        1,
                        "injector",
                        injector_contended,
                    ));
                }
                ResourceKind::Port => {
                    docs.push(measurement(job, resource.name, 0, "workload", low));
                    docs.push(measurement(job, resource.name, 0, "injector", injector_corun));
                }
            }
        }
    }

    std::fs::write(
        dir.join("measurement.json"),
        format!("[{}]", docs.join(",\n")),
    )
    .unwrap();

    let features: Vec<String> = std::iter::once("\"base\"".to_string())
        .chain(catalog.iter().map(|r| format!("\"{}\"", r.name)))
        .collect();
    let coefficients: Vec<String> = std::iter::once("0.3".to_string())
        .chain(catalog.iter().map(|_| "0.5".to_string()))
        .collect();
    std::fs::write(
        dir.join("prediction_model_1700000000.json"),
        format!(
            r#"{{"feature_list": [{}], "coefficients": [{}], "intercept": 0.02}}"#,
            features.join(", "),
            coefficients.join(", ")
        ),
    )
    .unwrap();
}

/// Counters that advance by a fixed step per read on every CPU.
pub struct StepCounters {
    cycles: AtomicU64,
    instructions: AtomicU64,
    cycle_step: u64,
    instruction_step: u64,
}

impl StepCounters {
    pub fn new(cycle_step: u64, instruction_step: u64) -> Self {
        StepCounters {
            cycles: AtomicU64::new(0),
            instructions: AtomicU64::new(0),
            cycle_step,
            instruction_step,
        }
    }
}

impl CounterSource for StepCounters {
    fn read(&self, _cpu: usize) -> Result<(u64, u64)> {
        Ok((
            self.cycles.fetch_add(self.cycle_step, Ordering::Relaxed) + self.cycle_step,
            self.instructions
                .fetch_add(self.instruction_step, Ordering::Relaxed)
                + self.instruction_step,
        ))
    }
}

/// Liveness probe that considers every pgid alive.
pub struct AlwaysAlive;

impl LivenessProbe for AlwaysAlive {
    fn alive(&self, _pgid: i32) -> bool {
        true
    }
}
