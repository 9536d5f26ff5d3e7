//! Pair selection and core packing.
//!
//! Turns the live set of attributed process groups plus the score map into a
//! concrete sibling assignment: enumerate candidate pairs, greedily select
//! under worker budgets, polish with a 2-opt local search, then pack pairs
//! onto physical cores least-loaded first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::{debug, warn};

use crate::score::{ScoreEngine, SENTINEL_JOB};
use crate::snapshot::SharedRegion;
use crate::topology::{Cpumask, Topology};

/// Members of a runqueue beyond this depth no longer influence placement.
const RUNQUEUE_EVAL_CAP: usize = 5;

/// One schedulable unit: a process group's workers under one job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairMember {
    pub pgid: i32,
    pub job_id: i32,
    pub worker_num: i32,
}

impl PairMember {
    pub fn sentinel(worker_num: i32) -> Self {
        PairMember {
            pgid: -1,
            job_id: SENTINEL_JOB,
            worker_num,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.job_id == SENTINEL_JOB
    }
}

/// A candidate sibling pairing with its symbiotic score.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub first: PairMember,
    pub second: PairMember,
    pub score: f64,
}

/// The live workloads to place, rounded up to a whole number of logical CPUs
/// with a sentinel member standing in for the empty sibling slots.
#[derive(Debug, Clone)]
pub struct TargetSet {
    pub members: Vec<PairMember>,
    /// Live worker threads plus sentinel fill; always divisible by the
    /// logical CPU count.
    pub thread_num: usize,
    pub remain: usize,
}

/// Scan the snapshot region for live process groups.
pub fn discover_targets(region: &SharedRegion, nr_logical: usize) -> TargetSet {
    let mut members = Vec::new();
    let mut n = 0usize;

    for (_, view) in region.iter_views() {
        if view.worker_num <= 0 || view.pgid <= 0 {
            continue;
        }
        n += view.worker_num as usize;
        members.push(PairMember {
            pgid: view.pgid,
            job_id: view.job_id,
            worker_num: view.worker_num,
        });
    }

    if n == 0 {
        return TargetSet {
            members,
            thread_num: 0,
            remain: 0,
        };
    }

    let remain = (nr_logical - (n % nr_logical)) % nr_logical;
    members.push(PairMember::sentinel(remain as i32));
    TargetSet {
        members,
        thread_num: n + remain,
        remain,
    }
}

/// Per-job worker budgets: how many worker threads each job identity has
/// across all of its process groups.
pub fn worker_budgets(members: &[PairMember]) -> HashMap<i32, i32> {
    let mut counter = HashMap::new();
    for m in members {
        *counter.entry(m.job_id).or_insert(0) += m.worker_num;
    }
    counter
}

/// Enumerate scored candidate pairs, best first. Pairs whose score is absent
/// from the map are dropped with a warning; the rest of the cycle proceeds
/// without them.
pub fn enumerate_pairs(members: &[PairMember], engine: &ScoreEngine) -> Vec<Pair> {
    let mut pairs = Vec::new();

    for (i, a) in members.iter().enumerate() {
        if a.worker_num >= 2 {
            match engine.score(a.job_id, a.job_id) {
                Some(score) => pairs.push(Pair {
                    first: *a,
                    second: *a,
                    score,
                }),
                None => warn!("pairing: no score for self-pair of job {}", a.job_id),
            }
        }
        for b in &members[i + 1..] {
            match engine.score(a.job_id, b.job_id) {
                Some(score) => pairs.push(Pair {
                    first: *a,
                    second: *b,
                    score,
                }),
                None => warn!(
                    "pairing: no score for pair ({}, {})",
                    a.job_id, b.job_id
                ),
            }
        }
    }

    pairs.sort_by(|a, b| b.score.total_cmp(&a.score));
    pairs
}

/// Greedy selection under both job-level and pgid-level worker budgets.
/// Walks the candidate list in order and realizes as many instances of each
/// pair as the budgets allow, stopping at `target_pairs`.
pub fn greedy_select(
    pairs: &[Pair],
    budgets: &HashMap<i32, i32>,
    target_pairs: usize,
) -> Vec<Pair> {
    let mut counter = budgets.clone();
    // Workers of each pgid already committed to a pair.
    let mut assigned: HashMap<i32, i32> = HashMap::new();
    let mut selected = Vec::with_capacity(target_pairs);

    for pair in pairs {
        let first = pair.first;
        let second = pair.second;

        if first.pgid == second.pgid && first.job_id == second.job_id {
            // Self-pair: both siblings come out of the same pgid.
            let avail = counter.get(&first.job_id).copied().unwrap_or(0);
            if avail < 2 {
                continue;
            }
            let remaining = first.worker_num - assigned.get(&first.pgid).copied().unwrap_or(0);
            if remaining < 2 {
                continue;
            }
            let k = (avail / 2).min(remaining / 2);
            if k < 1 {
                continue;
            }
            *counter.get_mut(&first.job_id).unwrap() -= 2 * k;
            *assigned.entry(first.pgid).or_insert(0) += 2 * k;
            for _ in 0..k {
                selected.push(*pair);
            }
        } else {
            let avail_a = counter.get(&first.job_id).copied().unwrap_or(0);
            let avail_b = counter.get(&second.job_id).copied().unwrap_or(0);
            if avail_a < 1 || avail_b < 1 {
                continue;
            }
            let rem_a = first.worker_num - assigned.get(&first.pgid).copied().unwrap_or(0);
            let rem_b = second.worker_num - assigned.get(&second.pgid).copied().unwrap_or(0);
            if rem_a < 1 || rem_b < 1 {
                continue;
            }
            let k = avail_a.min(avail_b).min(rem_a).min(rem_b);
            if k < 1 {
                continue;
            }
            *counter.get_mut(&first.job_id).unwrap() -= k;
            *counter.get_mut(&second.job_id).unwrap() -= k;
            *assigned.entry(first.pgid).or_insert(0) += k;
            *assigned.entry(second.pgid).or_insert(0) += k;
            for _ in 0..k {
                selected.push(*pair);
            }
        }

        if selected.len() >= target_pairs {
            selected.truncate(target_pairs);
            break;
        }
    }

    selected
}

fn argmax3(a: f64, b: f64, c: f64) -> usize {
    if a >= b && a >= c {
        0
    } else if b >= a && b >= c {
        1
    } else {
        2
    }
}

/// Two-pass 2-opt local search over the selected pairs. For every pair of
/// pairs, compare keeping them against the two cross-swaps and take the best
/// by summed score. Configurations that already proved unimprovable are
/// keyed by the bit pattern of their summed score and skipped on the second
/// pass.
pub fn two_opt(selected: &mut [Pair], engine: &ScoreEngine) {
    let mut no_swaps: HashSet<u64> = HashSet::new();

    for _ in 0..2 {
        for i in 0..selected.len() {
            for j in i + 1..selected.len() {
                let pi = selected[i];
                let pj = selected[j];
                let old_sum = pi.score + pj.score;
                let key = old_sum.to_bits();
                if no_swaps.contains(&key) {
                    continue;
                }

                // Swap first elements: (i.first, j.first) / (i.second, j.second).
                let (Some(s1a), Some(s1b)) = (
                    engine.score(pi.first.job_id, pj.first.job_id),
                    engine.score(pi.second.job_id, pj.second.job_id),
                ) else {
                    continue;
                };
                // Crosswise: (i.first, j.second) / (i.second, j.first).
                let (Some(s2a), Some(s2b)) = (
                    engine.score(pi.first.job_id, pj.second.job_id),
                    engine.score(pi.second.job_id, pj.first.job_id),
                ) else {
                    continue;
                };

                match argmax3(old_sum, s1a + s1b, s2a + s2b) {
                    0 => {
                        no_swaps.insert(key);
                    }
                    1 => {
                        selected[i] = Pair {
                            first: pi.first,
                            second: pj.first,
                            score: s1a,
                        };
                        selected[j] = Pair {
                            first: pi.second,
                            second: pj.second,
                            score: s1b,
                        };
                    }
                    _ => {
                        selected[i] = Pair {
                            first: pi.first,
                            second: pj.second,
                            score: s2a,
                        };
                        selected[j] = Pair {
                            first: pi.second,
                            second: pj.first,
                            score: s2b,
                        };
                    }
                }
            }
        }
    }

    selected.sort_by(|a, b| b.score.total_cmp(&a.score));
}

pub fn total_score(pairs: &[Pair]) -> f64 {
    pairs.iter().map(|p| p.score).sum()
}

/// Compatibility of adding a job to an existing runqueue: the summed score
/// against its first few members. Missing entries contribute nothing.
fn evaluate_runqueue(runqueue: &[PairMember], job_id: i32, engine: &ScoreEngine) -> f64 {
    runqueue
        .iter()
        .take(RUNQUEUE_EVAL_CAP)
        .map(|m| engine.score(job_id, m.job_id).unwrap_or(0.0))
        .sum()
}

/// A physical core's load while packing; ordered least-loaded first by
/// `(thread_count, total_score)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CoreLoad {
    threads: usize,
    score: f64,
    core: usize,
}

impl Eq for CoreLoad {}

impl Ord for CoreLoad {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.threads
            .cmp(&other.threads)
            .then(self.score.total_cmp(&other.score))
            .then(self.core.cmp(&other.core))
    }
}

impl PartialOrd for CoreLoad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A committed candidate: per-logical-CPU runqueues and the per-pgid
/// affinity masks they induce.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub runqueues: Vec<Vec<PairMember>>,
    pub masks: HashMap<i32, Cpumask>,
}

/// Pack pairs onto physical cores, best pairs onto the least-loaded cores.
/// Each pair lands on one core's two sibling threads, oriented to maximize
/// compatibility with whatever already occupies those runqueues.
pub fn pack_cores(pairs: &[Pair], topo: &Topology, engine: &ScoreEngine) -> Assignment {
    let nr_logical = topo.nr_logical();
    let mut runqueues: Vec<Vec<PairMember>> = vec![Vec::new(); nr_logical];
    if topo.nr_physical() == 0 {
        return Assignment {
            runqueues,
            masks: HashMap::new(),
        };
    }

    let mut heap: BinaryHeap<Reverse<CoreLoad>> = (0..topo.nr_physical())
        .map(|core| {
            Reverse(CoreLoad {
                threads: 0,
                score: 0.0,
                core,
            })
        })
        .collect();

    for pair in pairs {
        // Non-empty by the guard above; every pop is matched by a push.
        let Reverse(mut load) = heap.pop().unwrap();
        let (lc0, lc1) = topo.siblings[load.core];

        let score0 = evaluate_runqueue(&runqueues[lc0], pair.first.job_id, engine)
            + evaluate_runqueue(&runqueues[lc1], pair.second.job_id, engine);
        let score1 = evaluate_runqueue(&runqueues[lc0], pair.second.job_id, engine)
            + evaluate_runqueue(&runqueues[lc1], pair.first.job_id, engine);

        if score0 >= score1 {
            runqueues[lc1].push(pair.first);
            runqueues[lc0].push(pair.second);
        } else {
            runqueues[lc0].push(pair.first);
            runqueues[lc1].push(pair.second);
        }

        debug!(
            "pairing: core {} <- ({}, {}) score {:.4}",
            load.core, pair.first.job_id, pair.second.job_id, pair.score
        );

        load.threads += 1;
        load.score += pair.score;
        heap.push(Reverse(load));
    }

    let mut masks: HashMap<i32, Cpumask> = HashMap::new();
    for (cpu, runqueue) in runqueues.iter().enumerate() {
        for member in runqueue {
            if member.is_sentinel() {
                continue;
            }
            masks
                .entry(member.pgid)
                .or_insert_with(|| Cpumask::new(nr_logical))
                .set(cpu);
        }
    }

    Assignment { runqueues, masks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Catalog;
    use crate::score::engine_from_scores;

    fn member(pgid: i32, job: i32, workers: i32) -> PairMember {
        PairMember {
            pgid,
            job_id: job,
            worker_num: workers,
        }
    }

    #[test]
    fn budgets_sum_worker_counts_per_job() {
        let members = vec![member(10, 1, 2), member(11, 1, 3), member(12, 2, 4)];
        let budgets = worker_budgets(&members);
        assert_eq!(budgets[&1], 5);
        assert_eq!(budgets[&2], 4);
    }

    #[test]
    fn enumerate_includes_self_pairs_only_with_two_workers() {
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[(1, 1, 1.8), (2, 2, 1.6), (1, 2, 1.7)],
            &[],
        );
        let members = vec![member(10, 1, 2), member(11, 2, 1)];
        let pairs = enumerate_pairs(&members, &engine);

        // (1,1) self, (1,2) cross; no (2,2) self with a single worker.
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].score >= pairs[1].score);
        assert!(pairs
            .iter()
            .all(|p| !(p.first.job_id == 2 && p.second.job_id == 2)));
    }

    #[test]
    fn missing_scores_drop_pairs_not_the_cycle() {
        let engine = engine_from_scores(Catalog::intel_gen11(), &[(1, 1, 1.8)], &[]);
        let members = vec![member(10, 1, 2), member(11, 7, 2)];
        let pairs = enumerate_pairs(&members, &engine);
        // Job 7 has no entries at all: its self-pair and the cross pair are
        // dropped, the (1,1) self-pair survives.
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].first.job_id, 1);
    }

    #[test]
    fn greedy_respects_job_budget() {
        let engine = engine_from_scores(Catalog::intel_gen11(), &[(1, 1, 1.9)], &[]);
        let members = vec![member(10, 1, 4)];
        let pairs = enumerate_pairs(&members, &engine);
        let budgets = worker_budgets(&members);

        let selected = greedy_select(&pairs, &budgets, 2);
        assert_eq!(selected.len(), 2);

        // Only 4 workers: asking for more pairs cannot oversubscribe.
        let selected = greedy_select(&pairs, &budgets, 5);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn greedy_respects_pgid_budget() {
        // Job 1 has 4 workers total but split 3/1 across two pgids: only one
        // same-pgid self-pair instance fits.
        let engine = engine_from_scores(Catalog::intel_gen11(), &[(1, 1, 1.9)], &[]);
        let members = vec![member(10, 1, 3), member(11, 1, 1)];
        let mut pairs = enumerate_pairs(&members, &engine);
        // Keep only the self-pair of pgid 10 to isolate the pgid budget.
        pairs.retain(|p| p.first.pgid == 10 && p.second.pgid == 10);
        assert_eq!(pairs.len(), 1);

        let budgets = worker_budgets(&members);
        let selected = greedy_select(&pairs, &budgets, 2);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn greedy_prefers_high_scores() {
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[(3, 9, 1.9), (3, 3, 1.2), (9, 9, 1.1)],
            &[],
        );
        let members = vec![member(10, 3, 2), member(11, 9, 2)];
        let pairs = enumerate_pairs(&members, &engine);
        let budgets = worker_budgets(&members);

        let selected = greedy_select(&pairs, &budgets, 2);
        assert_eq!(selected.len(), 2);
        for pair in &selected {
            assert_eq!(
                (pair.first.job_id, pair.second.job_id),
                (3, 9),
                "mixed pair must win over both self-pairs"
            );
        }
    }

    #[test]
    fn two_opt_improves_crossed_selection() {
        // Pairs (1,2) and (3,4) are poor; swapping to (1,3) and (2,4) is
        // strictly better.
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[
                (1, 2, 0.2),
                (3, 4, 0.2),
                (1, 3, 1.0),
                (2, 4, 1.0),
                (1, 4, 0.3),
                (2, 3, 0.3),
            ],
            &[],
        );
        let mut selected = vec![
            Pair {
                first: member(10, 1, 1),
                second: member(11, 2, 1),
                score: 0.2,
            },
            Pair {
                first: member(12, 3, 1),
                second: member(13, 4, 1),
                score: 0.2,
            },
        ];

        two_opt(&mut selected, &engine);
        let total = total_score(&selected);
        assert!((total - 2.0).abs() < 1e-9, "total={total}");
    }

    #[test]
    fn two_opt_keeps_optimal_selection() {
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[
                (1, 2, 1.0),
                (3, 4, 1.0),
                (1, 3, 0.1),
                (2, 4, 0.1),
                (1, 4, 0.1),
                (2, 3, 0.1),
            ],
            &[],
        );
        let mut selected = vec![
            Pair {
                first: member(10, 1, 1),
                second: member(11, 2, 1),
                score: 1.0,
            },
            Pair {
                first: member(12, 3, 1),
                second: member(13, 4, 1),
                score: 1.0,
            },
        ];
        two_opt(&mut selected, &engine);
        assert!((total_score(&selected) - 2.0).abs() < 1e-9);
        assert_eq!(selected[0].first.job_id, 1);
    }

    #[test]
    fn pack_spreads_pairs_across_cores() {
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[(3, 9, 1.9)],
            &[],
        );
        let topo = Topology::synthetic(2);
        let pairs = vec![
            Pair {
                first: member(10, 3, 2),
                second: member(11, 9, 2),
                score: 1.9,
            };
            2
        ];

        let assignment = pack_cores(&pairs, &topo, &engine);

        // One pair instance per physical core, one member per sibling.
        for runqueue in &assignment.runqueues {
            assert_eq!(runqueue.len(), 1);
        }
        // Each pgid spans one logical CPU per core.
        assert_eq!(assignment.masks[&10].weight(), 2);
        assert_eq!(assignment.masks[&11].weight(), 2);
        // Siblings carry one of each job.
        for (lc0, lc1) in &topo.siblings {
            let j0 = assignment.runqueues[*lc0][0].job_id;
            let j1 = assignment.runqueues[*lc1][0].job_id;
            assert_ne!(j0, j1);
        }
    }

    #[test]
    fn sentinel_members_are_excluded_from_masks() {
        let engine = engine_from_scores(Catalog::intel_gen11(), &[(1, 1, 1.0)], &[]);
        let topo = Topology::synthetic(1);
        let pairs = vec![Pair {
            first: member(10, 1, 1),
            second: PairMember::sentinel(1),
            score: 1.0,
        }];

        let assignment = pack_cores(&pairs, &topo, &engine);
        assert_eq!(assignment.masks.len(), 1);
        assert!(assignment.masks.contains_key(&10));
    }

    #[test]
    fn packing_is_deterministic() {
        let engine = engine_from_scores(
            Catalog::intel_gen11(),
            &[(3, 9, 1.9), (3, 3, 1.0), (9, 9, 0.8)],
            &[],
        );
        let topo = Topology::synthetic(2);
        let members = vec![member(10, 3, 2), member(11, 9, 2)];
        let pairs = enumerate_pairs(&members, &engine);
        let budgets = worker_budgets(&members);
        let selected = greedy_select(&pairs, &budgets, 2);

        let a = pack_cores(&selected, &topo, &engine);
        let b = pack_cores(&selected, &topo, &engine);
        assert_eq!(a.masks.len(), b.masks.len());
        for (pgid, mask) in &a.masks {
            assert_eq!(mask, &b.masks[pgid]);
        }
    }
}
