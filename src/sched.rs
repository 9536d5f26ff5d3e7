//! Scheduling cycle: candidate generation, empirical validation, commitment.
//!
//! A cycle turns the current attribution membership into up to three distinct
//! greedy+2-opt candidates (tie-broken differently by rotating the sorted
//! pair list) plus as many shuffled baselines, then measures each candidate's
//! System Throughput for a settling interval and commits the winner's
//! affinity masks.
//!
//! The measurement side is behind [`CandidateEvaluator`] so the cycle logic
//! stays deterministic under test; the production evaluator applies the
//! candidate, resets the attribution counters, sleeps, and reads STP out of
//! the snapshot region.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use rand::seq::SliceRandom;

use crate::attribution::AttributionTable;
use crate::pairing::{
    discover_targets, enumerate_pairs, greedy_select, pack_cores, total_score, two_opt,
    Assignment, Pair, worker_budgets,
};
use crate::score::ScoreEngine;
use crate::snapshot::SharedRegion;
use crate::topology::{Cpumask, Topology};

/// Distinct candidates to generate; the same number of shuffled baselines is
/// added on top.
const MAX_CANDIDATES: usize = 3;

/// Upper bound on greedy attempts while hunting for distinct candidates.
const MAX_TRIES: usize = 100;

const SCORE_EPSILON: f64 = 1e-8;

fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < SCORE_EPSILON
}

/// Measures and commits candidate assignments.
pub trait CandidateEvaluator {
    /// Apply the candidate and return its measured System Throughput.
    fn evaluate(&mut self, assignment: &Assignment) -> Result<f64>;

    /// Commit the winning candidate.
    fn commit(&mut self, assignment: &Assignment) -> Result<()>;
}

/// Outcome of one scheduling cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub winner: Option<Assignment>,
    pub stp: f64,
    pub candidates_tried: usize,
}

/// Rotate the pair list so that a different head breaks score ties on the
/// next greedy attempt: everything equal to the current front moves to the
/// back.
fn rotate_past_front(pairs: &mut Vec<Pair>) {
    if pairs.len() < 2 {
        return;
    }
    let front = pairs[0].score;
    let mid = pairs
        .iter()
        .position(|p| !nearly_equal(p.score, front))
        .unwrap_or(1);
    pairs.rotate_left(mid);
}

/// Run one full scheduling cycle against the live snapshot region.
pub fn schedule_cycle(
    engine: &ScoreEngine,
    topo: &Topology,
    region: &SharedRegion,
    evaluator: &mut dyn CandidateEvaluator,
) -> Result<CycleOutcome> {
    let targets = discover_targets(region, topo.nr_logical());
    if targets.thread_num == 0 {
        debug!("sched: no workloads to schedule");
        return Ok(CycleOutcome {
            winner: None,
            stp: 0.0,
            candidates_tried: 0,
        });
    }

    info!(
        "sched: cycle over {} workers ({} sentinel fill)",
        targets.thread_num, targets.remain
    );

    let budgets = worker_budgets(&targets.members);
    let mut pairs = enumerate_pairs(&targets.members, engine);
    if pairs.is_empty() {
        warn!("sched: no scoreable pairs, leaving placement to the OS");
        return Ok(CycleOutcome {
            winner: None,
            stp: 0.0,
            candidates_tried: 0,
        });
    }

    let target_pairs = targets.thread_num / 2;
    let mut candidates: Vec<Assignment> = Vec::new();
    let mut candidate_scores: Vec<f64> = Vec::new();
    let mut baselines: Vec<Assignment> = Vec::new();

    for attempt in 0..MAX_TRIES {
        let mut selected = greedy_select(&pairs, &budgets, target_pairs);
        rotate_past_front(&mut pairs);

        if selected.len() != target_pairs {
            debug!(
                "sched: attempt {attempt}: {} pairs selected, want {target_pairs}",
                selected.len()
            );
            continue;
        }

        two_opt(&mut selected, engine);

        if baselines.is_empty() {
            // Shuffled copies of the first viable selection act as the
            // empirical control group.
            let mut rng = rand::thread_rng();
            for _ in 0..MAX_CANDIDATES {
                let mut shuffled = selected.clone();
                shuffled.shuffle(&mut rng);
                baselines.push(pack_cores(&shuffled, topo, engine));
            }
        }

        let score = total_score(&selected);
        if candidate_scores.iter().any(|s| nearly_equal(*s, score)) {
            continue;
        }
        candidate_scores.push(score);
        info!(
            "sched: candidate {} with model score {score:.4}",
            candidates.len()
        );
        candidates.push(pack_cores(&selected, topo, engine));

        if candidates.len() == MAX_CANDIDATES {
            break;
        }
    }

    if candidates.is_empty() {
        warn!("sched: no viable candidate produced");
        return Ok(CycleOutcome {
            winner: None,
            stp: 0.0,
            candidates_tried: 0,
        });
    }

    candidates.extend(baselines);
    let total_candidates = candidates.len();

    let mut best: Option<(usize, f64)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let stp = match evaluator.evaluate(candidate) {
            Ok(stp) => stp,
            Err(e) => {
                warn!("sched: candidate {idx} evaluation failed, skipping: {e:#}");
                continue;
            }
        };
        info!("sched: candidate {idx}: STP = {stp:.4}");
        if best.map(|(_, s)| stp > s).unwrap_or(true) {
            best = Some((idx, stp));
        }
    }

    let Some((winner_idx, stp)) = best else {
        warn!("sched: every candidate failed evaluation, no commit");
        return Ok(CycleOutcome {
            winner: None,
            stp: 0.0,
            candidates_tried: total_candidates,
        });
    };

    info!("sched: committing candidate {winner_idx} (STP {stp:.4})");
    let winner = candidates.swap_remove(winner_idx);
    evaluator.commit(&winner)?;

    Ok(CycleOutcome {
        winner: Some(winner),
        stp,
        candidates_tried: total_candidates,
    })
}

/// System Throughput over the live snapshot region: the sum of each active
/// slot's observed IPC normalized by its solo baseline. Slots with no cycles
/// yet or no usable baseline contribute nothing.
pub fn system_throughput(region: &SharedRegion, engine: &ScoreEngine) -> f64 {
    let mut stp = 0.0;
    for (idx, view) in region.iter_views() {
        if view.job_id < 0 || view.pgid <= 0 {
            continue;
        }
        if view.cycles == 0 {
            debug!("sched: slot {idx} (pgid {}) has no cycles yet", view.pgid);
            continue;
        }
        let Some(single) = engine.single_ipc(view.job_id) else {
            continue;
        };
        if single <= 0.0 {
            continue;
        }
        let ipc = view.instructions as f64 / view.cycles as f64;
        stp += ipc / single;
    }
    stp
}

/// The production evaluator: apply affinity, reset counters, settle, read
/// STP back out of the region.
pub struct StpEvaluator<'a> {
    pub table: &'a AttributionTable,
    pub engine: &'a ScoreEngine,
    pub region: Arc<SharedRegion>,
    pub settle: Duration,
}

impl CandidateEvaluator for StpEvaluator<'_> {
    fn evaluate(&mut self, assignment: &Assignment) -> Result<f64> {
        apply_assignment(assignment);
        self.table.reset_all();
        // Not cancellable: an admission arriving mid-validation waits for
        // the cycle to finish and triggers a re-run.
        std::thread::sleep(self.settle);
        Ok(system_throughput(&self.region, self.engine))
    }

    fn commit(&mut self, assignment: &Assignment) -> Result<()> {
        apply_assignment(assignment);
        Ok(())
    }
}

/// Apply every pgid's affinity mask. Sentinel entries never appear in the
/// mask map; individual syscall failures are logged and skipped since
/// short-lived threads may exit mid-walk.
pub fn apply_assignment(assignment: &Assignment) {
    for (pgid, mask) in &assignment.masks {
        if *pgid <= 0 || mask.is_empty() {
            continue;
        }
        debug!("sched: pgid {pgid} -> cpus {mask:?}");
        set_pgid_affinity(*pgid, mask);
    }
}

fn cpu_set_from_mask(mask: &Cpumask) -> libc::cpu_set_t {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in mask.iter() {
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    set
}

/// Recursively pin all threads and descendant processes of a process group.
pub fn set_pgid_affinity(pgid: i32, mask: &Cpumask) {
    let set = cpu_set_from_mask(mask);
    apply_affinity_recursive(pgid, &set);
}

fn apply_affinity_recursive(pid: i32, set: &libc::cpu_set_t) {
    for tid in threads_of(pid) {
        let rc = unsafe {
            libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), set)
        };
        if rc != 0 {
            // The thread may have exited between the walk and the syscall.
            warn!(
                "sched: sched_setaffinity(tid {tid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    for child in children_of(pid) {
        apply_affinity_recursive(child, set);
    }
}

fn threads_of(pid: i32) -> Vec<i32> {
    let task_dir = format!("/proc/{pid}/task");
    let Ok(entries) = std::fs::read_dir(Path::new(&task_dir)) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
        .collect()
}

fn children_of(pid: i32) -> Vec<i32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .split_whitespace()
        .filter_map(|tok| tok.parse::<i32>().ok())
        .collect()
}
