//! smtpair - interference-aware SMT pair scheduler.
//!
//! Long-running, co-resident workloads on an SMT machine interfere through
//! shared microarchitectural resources. This crate pairs them onto sibling
//! hardware threads so that the interference is minimized, then checks its
//! own work empirically.
//!
//! # Architecture
//!
//! - **Attribution** ([`attribution`], [`snapshot`]): per-process-group
//!   cycle/instruction accounting driven by context-switch events, published
//!   through a lock-free seqlock snapshot region.
//! - **Watchdog** ([`watchdog`]): detects workloads that have run past a
//!   threshold, requests profiling, and registers them for attribution only
//!   after the profiling acknowledgement arrives.
//! - **Profiles** ([`store`], [`profile`], [`resources`]): per-workload
//!   characteristic vectors (sensitivity, intensity, usage, base slowdown)
//!   derived from the profiling pipeline's measurement documents.
//! - **Scoring** ([`score`]): a trained linear model turns two characteristic
//!   vectors into a symmetric compatibility score.
//! - **Scheduling** ([`pairing`], [`sched`]): greedy pair selection with
//!   2-opt polish, min-heap core packing, empirical A/B validation by
//!   measured system throughput, and recursive affinity commitment.
//! - **Plumbing** ([`endpoint`], [`perf`], [`tracefs`], [`topology`]): the
//!   datagram control/notify/ACK surfaces, raw perf counters, the
//!   sched_switch feed, and SMT sibling detection.

pub mod attribution;
pub mod endpoint;
pub mod pairing;
pub mod perf;
pub mod profile;
pub mod resources;
pub mod sched;
pub mod score;
pub mod snapshot;
pub mod store;
pub mod topology;
pub mod tracefs;
pub mod watchdog;

pub use attribution::{AddOutcome, AttributionTable, CounterSource};
pub use pairing::{Assignment, Pair, PairMember};
pub use sched::{schedule_cycle, system_throughput, CandidateEvaluator};
pub use score::{ScoreEngine, ScoreModel};
pub use snapshot::{SharedRegion, SlotView, MAX_SLOTS};
pub use topology::{Cpumask, Topology};
pub use watchdog::Watchdog;
