//! Pairwise symbiosis scoring.
//!
//! A trained linear model maps a directional feature vector (the base
//! slowdown floor plus one contention term per catalog resource) to the
//! predicted slowdown a workload suffers from a given SMT sibling. The
//! compatibility of the pair in that direction is the scaled complement of
//! the prediction; summing both directions yields the symmetric score the
//! pair scheduler ranks by.

use std::collections::HashMap;

use anyhow::{bail, Result};
use log::{debug, info};

use crate::profile::WorkloadProfile;
use crate::resources::{Catalog, ResourceKind};
use crate::store::ModelDoc;

/// Job id of the sentinel member that models empty sibling-thread slots.
pub const SENTINEL_JOB: i32 = -1;

/// Unordered pair key: the two job ids packed into a u64, smaller id in the
/// high half so that `key(a, b) == key(b, a)`.
pub fn make_key(a: i32, b: i32) -> u64 {
    let (lo, hi) = if (a as u32) > (b as u32) {
        (b as u32, a as u32)
    } else {
        (a as u32, b as u32)
    };
    ((lo as u64) << 32) | hi as u64
}

/// Effective contention weight of two usages on one resource.
pub fn activation(kind: ResourceKind, usage_a: f64, usage_b: f64) -> f64 {
    match kind {
        // Queues only contend once combined occupancy spills past capacity.
        ResourceKind::Sequential | ResourceKind::Port => (usage_a + usage_b - 1.0).max(0.0),
        // Collision probability weighted by the average occupancy.
        ResourceKind::Parallel => usage_a * usage_b * (usage_a + usage_b) / 2.0,
    }
}

/// The trained linear model, re-indexed onto the catalog.
pub struct ScoreModel {
    intercept: f64,
    base_coef: f64,
    /// One coefficient per catalog resource; zero where the model carries no
    /// term for that resource.
    resource_coefs: Vec<f64>,
}

impl ScoreModel {
    /// Validate the document's feature list against the catalog and map its
    /// coefficients into catalog order. The list must start with the `base`
    /// term and continue with an ordered subset of the catalog.
    pub fn from_document(doc: &ModelDoc, catalog: &Catalog) -> Result<Self> {
        if doc.feature_list.is_empty() || doc.feature_list[0] != "base" {
            bail!("model feature list must start with \"base\"");
        }
        if doc.coefficients.len() != doc.feature_list.len() {
            bail!(
                "model has {} coefficients for {} features",
                doc.coefficients.len(),
                doc.feature_list.len()
            );
        }

        let mut resource_coefs = vec![0.0; catalog.len()];
        let mut cursor = 0usize;
        for (feature, coef) in doc.feature_list[1..].iter().zip(&doc.coefficients[1..]) {
            let Some(idx) = catalog.index_of(feature) else {
                bail!("model feature {feature} is not in the resource catalog");
            };
            if idx < cursor {
                bail!("model feature {feature} is out of catalog order");
            }
            cursor = idx;
            resource_coefs[idx] = *coef;
        }

        Ok(ScoreModel {
            intercept: doc.intercept,
            base_coef: doc.coefficients[0],
            resource_coefs,
        })
    }

    /// Predicted slowdown of `base` when co-located with `other`.
    fn predicted_slowdown(
        &self,
        catalog: &Catalog,
        base: &WorkloadProfile,
        other: &WorkloadProfile,
    ) -> f64 {
        let base_floor = base
            .chars
            .iter()
            .map(|c| c.base_slowdown)
            .fold(f64::INFINITY, f64::min);

        let mut sum = self.intercept + self.base_coef * base_floor;
        for (idx, resource) in catalog.iter().enumerate() {
            let a = &base.chars[idx];
            let b = &other.chars[idx];
            let act = activation(resource.kind, a.usage, b.usage);
            sum += self.resource_coefs[idx] * a.sensitivity * b.intensity * act;
        }
        sum
    }
}

/// Score map plus the per-job state needed to extend it.
pub struct ScoreEngine {
    catalog: Catalog,
    model: ScoreModel,
    profiles: HashMap<i32, WorkloadProfile>,
    scores: HashMap<u64, f64>,
    single_ipc: HashMap<i32, f64>,
}

impl ScoreEngine {
    pub fn new(catalog: Catalog, model: ScoreModel) -> Self {
        let mut scores = HashMap::new();
        // Sentinel pairs: an empty sibling never interferes with anything.
        scores.insert(make_key(SENTINEL_JOB, SENTINEL_JOB), 0.0);
        ScoreEngine {
            catalog,
            model,
            profiles: HashMap::new(),
            scores,
            single_ipc: HashMap::new(),
        }
    }

    pub fn is_known(&self, job_id: i32) -> bool {
        self.profiles.contains_key(&job_id)
    }

    /// Directional compatibility, clamped to `[0, 1]`.
    fn compatibility(&self, base: &WorkloadProfile, other: &WorkloadProfile) -> f64 {
        let slowdown = self.model.predicted_slowdown(&self.catalog, base, other);
        (base.scale_factor * (1.0 - slowdown)).clamp(0.0, 1.0)
    }

    /// Admit a workload: publish its solo IPC and score it against every
    /// known job, itself included. Re-admitting refreshes the entries.
    pub fn add_workload(&mut self, job_id: i32, profile: WorkloadProfile) {
        if profile.single_ipc > 0.0 {
            self.single_ipc.insert(job_id, profile.single_ipc);
        }
        // Pairing a workload with an empty sibling slot costs nothing.
        self.scores.insert(make_key(job_id, SENTINEL_JOB), 1.0);
        self.profiles.insert(job_id, profile);

        let others: Vec<i32> = self.profiles.keys().copied().collect();
        let base = self.profiles[&job_id].clone();
        for other_id in others {
            let other = &self.profiles[&other_id];
            let forward = self.compatibility(&base, other);
            let backward = if other_id == job_id {
                forward
            } else {
                self.compatibility(other, &base)
            };
            let score = forward + backward;
            debug!("score: ({job_id}, {other_id}) = {score:.4}");
            self.scores.insert(make_key(job_id, other_id), score);
        }
    }

    /// Drop a workload's profile and solo baseline. Existing pair scores stay
    /// until overwritten; pairs involving the job are no longer produced.
    pub fn expire_workload(&mut self, job_id: i32) {
        self.profiles.remove(&job_id);
        self.single_ipc.remove(&job_id);
    }

    pub fn score(&self, a: i32, b: i32) -> Option<f64> {
        self.scores.get(&make_key(a, b)).copied()
    }

    pub fn single_ipc(&self, job_id: i32) -> Option<f64> {
        self.single_ipc.get(&job_id).copied()
    }

    /// Diagnostic dump: pairs normalized by the maximum score, best first.
    pub fn print_scoreboard(&self) {
        let mut rows: Vec<(i32, i32, f64)> = self
            .scores
            .iter()
            .map(|(key, score)| ((key >> 32) as u32 as i32, *key as u32 as i32, *score))
            .collect();
        let max = rows.iter().map(|r| r.2).fold(0.0_f64, f64::max).max(1e-12);
        for row in rows.iter_mut() {
            row.2 /= max;
        }
        rows.sort_by(|a, b| b.2.total_cmp(&a.2));

        info!("=== symbiotic scoreboard ({} jobs) ===", self.profiles.len());
        for (a, b, score) in rows {
            info!("  pair ({a:>6}, {b:>6}): {score:.4}");
        }
    }

}

/// Test-friendly construction of an engine from raw score entries; used by
/// unit and integration tests that do not need the model path.
pub fn engine_from_scores(
    catalog: Catalog,
    entries: &[(i32, i32, f64)],
    single_ipc: &[(i32, f64)],
) -> ScoreEngine {
    let model = ScoreModel {
        intercept: 0.0,
        base_coef: 0.0,
        resource_coefs: vec![0.0; catalog.len()],
    };
    let mut engine = ScoreEngine::new(catalog, model);
    for &(a, b, score) in entries {
        engine.scores.insert(make_key(a, b), score);
        engine.scores.insert(make_key(a, SENTINEL_JOB), 1.0);
        engine.scores.insert(make_key(b, SENTINEL_JOB), 1.0);
    }
    for &(job, ipc) in single_ipc {
        engine.single_ipc.insert(job, ipc);
    }
    engine
}
