//! Scheduling-cycle scenarios driven through the public API: attribution
//! membership in, committed affinity masks out.

mod common;

use anyhow::Result;

use smtpair::attribution::{AddOutcome, AttributionTable};
use smtpair::pairing::{discover_targets, Assignment};
use smtpair::resources::Catalog;
use smtpair::sched::{schedule_cycle, CandidateEvaluator};
use smtpair::score::engine_from_scores;
use smtpair::topology::Topology;

use common::StepCounters;

struct ConstantOracle;

impl CandidateEvaluator for ConstantOracle {
    fn evaluate(&mut self, _assignment: &Assignment) -> Result<f64> {
        Ok(1.0)
    }
    fn commit(&mut self, _assignment: &Assignment) -> Result<()> {
        Ok(())
    }
}

fn table_with(pgids: &[(i32, i32, i32)]) -> AttributionTable {
    let table = AttributionTable::new(8, Box::new(StepCounters::new(1000, 500)));
    for (pgid, job, workers) in pgids {
        assert_eq!(table.add(*pgid, *job, *workers), AddOutcome::Added);
    }
    table
}

// Scenario: a single long-running workload with four workers on a
// four-logical-CPU machine self-pairs onto both physical cores and owns
// every logical CPU.
#[test]
fn single_workload_owns_the_whole_machine() {
    let table = table_with(&[(1001, 7, 4)]);
    let engine = engine_from_scores(Catalog::intel_gen11(), &[(7, 7, 1.5)], &[(7, 2.0)]);
    let topo = Topology::synthetic(2);

    let targets = discover_targets(&table.region(), topo.nr_logical());
    assert_eq!(targets.thread_num, 4);
    assert_eq!(targets.remain, 0);

    let outcome = schedule_cycle(&engine, &topo, &table.region(), &mut ConstantOracle).unwrap();
    let winner = outcome.winner.expect("a winner must be committed");

    let mask = &winner.masks[&1001];
    assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
}

// Scenario: two compatible workloads, two workers each. The mixed pair
// outscores both self-pairs, so each physical core carries one worker of
// each job on its sibling threads.
#[test]
fn compatible_workloads_share_sibling_pairs() {
    let table = table_with(&[(100, 3, 2), (200, 9, 2)]);
    let engine = engine_from_scores(
        Catalog::intel_gen11(),
        &[(3, 9, 1.9), (3, 3, 1.2), (9, 9, 1.1)],
        &[(3, 2.0), (9, 2.0)],
    );
    let topo = Topology::synthetic(2);

    let outcome = schedule_cycle(&engine, &topo, &table.region(), &mut ConstantOracle).unwrap();
    let winner = outcome.winner.expect("a winner must be committed");

    // Both groups span one logical CPU of each physical core.
    assert_eq!(winner.masks[&100].weight(), 2);
    assert_eq!(winner.masks[&200].weight(), 2);
    for (lc0, lc1) in &topo.siblings {
        let job0 = winner.runqueues[*lc0][0].job_id;
        let job1 = winner.runqueues[*lc1][0].job_id;
        assert_ne!(job0, job1, "siblings must carry one worker of each job");
    }
}

// Boundary: worker counts that do not divide the logical CPU count are
// padded with sentinel threads, and the sentinel never reaches a mask.
#[test]
fn odd_worker_count_is_padded_with_sentinels() {
    let table = table_with(&[(100, 3, 3)]);
    let engine = engine_from_scores(
        Catalog::intel_gen11(),
        &[(3, 3, 1.5)],
        &[(3, 2.0)],
    );
    let topo = Topology::synthetic(2);

    let targets = discover_targets(&table.region(), topo.nr_logical());
    assert_eq!(targets.remain, 1);
    assert_eq!(targets.thread_num, 4);
    assert!(targets.thread_num % 2 == 0);

    let outcome = schedule_cycle(&engine, &topo, &table.region(), &mut ConstantOracle).unwrap();
    let winner = outcome.winner.expect("a winner must be committed");
    assert!(winner.masks.keys().all(|pgid| *pgid > 0));
    assert_eq!(winner.masks[&100].weight(), 3);
}

// Boundary: an empty attribution table schedules nothing.
#[test]
fn no_active_groups_is_a_no_op() {
    let table = table_with(&[]);
    let engine = engine_from_scores(Catalog::intel_gen11(), &[], &[]);
    let topo = Topology::synthetic(2);

    let outcome = schedule_cycle(&engine, &topo, &table.region(), &mut ConstantOracle).unwrap();
    assert!(outcome.winner.is_none());
    assert_eq!(outcome.candidates_tried, 0);
}

// Removed groups disappear from target discovery even if a stale snapshot
// was read mid-flight earlier.
#[test]
fn removed_groups_leave_target_discovery() {
    let table = table_with(&[(100, 3, 2), (200, 9, 2)]);
    let topo = Topology::synthetic(2);

    let targets = discover_targets(&table.region(), topo.nr_logical());
    assert_eq!(targets.members.len(), 3); // two groups + sentinel

    assert!(table.remove(100));
    let targets = discover_targets(&table.region(), topo.nr_logical());
    assert_eq!(targets.members.len(), 2);
    assert!(targets.members.iter().all(|m| m.pgid != 100));
}
