//! Workload characteristic vectors.
//!
//! Raw profile measurements describe how a workload's IPC moves when paired
//! with injectors that pressure one resource at a time. This module distills
//! those rows into the per-resource descriptor the score model consumes:
//! sensitivity (slowdown from low to high pressure), intensity (how much the
//! workload degrades a low-pressure injector), usage (fraction of the
//! resource occupied) and base slowdown, plus the solo-IPC baseline and the
//! CMP-level scale factor.
//!
//! Derivation formulas follow the resource's contention class. Sequential
//! resources locate the occupancy drop point with a two-point line fit over
//! the medium/high pressure measurements; parallel resources compare the
//! injector's co-run IPC against its contended extremes; ports collapse
//! sensitivity, usage and base slowdown into the single high-pressure
//! measurement.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::resources::{
    Catalog, Resource, ResourceKind, FEATURE_SINGLE, INJECTOR_HIGH, INJECTOR_SOLO,
    PRESSURE_HIGH, PRESSURE_LOW, PRESSURE_MEDIUM, PRESSURE_PARALLEL_HIGH, SCALE_PROBE,
};
use crate::store::{MeasurementDoc, ProfileStore, RunType, StoreError};

/// Usage-measurement noise floor: below this sensitivity the occupancy
/// estimate is meaningless and usage is reported as zero.
const SENSITIVITY_FLOOR: f64 = 0.05;

/// Per-resource characteristics, all clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceChars {
    pub sensitivity: f64,
    pub usage: f64,
    pub intensity: f64,
    pub base_slowdown: f64,
}

/// The full characteristic vector of one workload.
#[derive(Debug, Clone)]
pub struct WorkloadProfile {
    /// Indexed by catalog position.
    pub chars: Vec<ResourceChars>,
    pub single_ipc: f64,
    pub scale_factor: f64,
}

/// Profile loading failures, mirroring the store's recovery split.
#[derive(Debug)]
pub enum ProfileError {
    /// A required measurement is genuinely absent; the workload is excluded
    /// from pair selection.
    NotFound(String),
    /// Transient store failure; retried with bounded backoff.
    Unavailable(anyhow::Error),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NotFound(what) => write!(f, "profile data missing: {what}"),
            ProfileError::Unavailable(e) => write!(f, "profile store unavailable: {e:#}"),
        }
    }
}

impl std::error::Error for ProfileError {}

impl From<StoreError> for ProfileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ProfileError::NotFound(what),
            StoreError::Unavailable(e) => ProfileError::Unavailable(e),
        }
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Two-point line, used to interpolate the pressure level at which a
/// sequential resource's IPC starts dropping.
struct LineFit {
    slope: f64,
    intercept: f64,
}

impl LineFit {
    fn through(p1: (f64, f64), p2: (f64, f64)) -> Self {
        let (mut x1, y1) = p1;
        let (x2, y2) = p2;
        if (x2 - x1).abs() < f64::EPSILON {
            x1 = x2 - 0.001;
        }
        let mut slope = (y2 - y1) / (x2 - x1);
        if slope == 0.0 {
            slope = 0.001;
        }
        LineFit {
            slope,
            intercept: y1 - slope * x1,
        }
    }

    fn x_at(&self, y: f64) -> f64 {
        (y - self.intercept) / self.slope
    }
}

/// Measurement rows of one job, indexed for characteristic derivation.
struct DocIndex {
    by_key: HashMap<(String, i32, RunType), f64>,
}

impl DocIndex {
    fn new(docs: &[MeasurementDoc]) -> Self {
        let mut by_key = HashMap::new();
        for doc in docs {
            by_key.insert((doc.feature.clone(), doc.pressure, doc.run_type), doc.ipc);
        }
        DocIndex { by_key }
    }

    fn get(&self, feature: &str, pressure: i32, run: RunType) -> Result<f64, ProfileError> {
        self.by_key
            .get(&(feature.to_string(), pressure, run))
            .copied()
            .ok_or_else(|| {
                ProfileError::NotFound(format!("{feature} pressure={pressure} {run:?}"))
            })
    }
}

/// Injector reference IPCs loaded once at startup. Keyed by resource name.
pub struct InjectorBaselines {
    sequential_solo_low: HashMap<String, f64>,
    parallel: HashMap<String, ParallelRef>,
    port_solo_high: HashMap<String, f64>,
}

struct ParallelRef {
    solo_low: f64,
    /// Low-pressure injector IPC while a high-contention companion runs: the
    /// injector's best case under saturation.
    high_low: f64,
    /// Both sides at high pressure: the injector's worst case.
    high_high: f64,
}

impl InjectorBaselines {
    /// Load the reference runs (reserved job ids) for every catalog resource.
    /// Missing references are a boot-time failure per the error taxonomy.
    pub fn load(store: &dyn ProfileStore, catalog: &Catalog) -> Result<Self> {
        let mut sequential_solo_low = HashMap::new();
        let mut parallel = HashMap::new();
        let mut port_solo_high = HashMap::new();

        let solo = index_reference_docs(store, INJECTOR_SOLO)?;
        let high = index_reference_docs(store, INJECTOR_HIGH)?;

        for resource in catalog.iter() {
            let name = resource.name;
            match resource.kind {
                ResourceKind::Sequential => {
                    let ipc = lookup_ref(&solo, name, PRESSURE_LOW)
                        .with_context(|| format!("solo injector baseline for {name}"))?;
                    sequential_solo_low.insert(name.to_string(), ipc);
                }
                ResourceKind::Parallel => {
                    let solo_low = lookup_ref(&solo, name, PRESSURE_LOW)
                        .with_context(|| format!("solo injector baseline for {name}"))?;
                    let high_low = lookup_ref(&high, name, PRESSURE_LOW)
                        .with_context(|| format!("contended injector baseline for {name}"))?;
                    let high_high = lookup_ref(&high, name, PRESSURE_PARALLEL_HIGH)
                        .with_context(|| format!("contended injector baseline for {name}"))?;
                    parallel.insert(
                        name.to_string(),
                        ParallelRef {
                            solo_low,
                            high_low,
                            high_high,
                        },
                    );
                }
                ResourceKind::Port => {
                    let ipc = lookup_ref(&solo, name, PRESSURE_LOW)
                        .with_context(|| format!("solo injector baseline for {name}"))?;
                    port_solo_high.insert(name.to_string(), ipc);
                }
            }
        }

        Ok(InjectorBaselines {
            sequential_solo_low,
            parallel,
            port_solo_high,
        })
    }

    #[cfg(test)]
    pub(crate) fn synthetic(catalog: &Catalog) -> Self {
        let mut sequential_solo_low = HashMap::new();
        let mut parallel = HashMap::new();
        let mut port_solo_high = HashMap::new();
        for resource in catalog.iter() {
            match resource.kind {
                ResourceKind::Sequential => {
                    sequential_solo_low.insert(resource.name.to_string(), 2.0);
                }
                ResourceKind::Parallel => {
                    parallel.insert(
                        resource.name.to_string(),
                        ParallelRef {
                            solo_low: 2.0,
                            high_low: 1.8,
                            high_high: 0.8,
                        },
                    );
                }
                ResourceKind::Port => {
                    port_solo_high.insert(resource.name.to_string(), 2.0);
                }
            }
        }
        InjectorBaselines {
            sequential_solo_low,
            parallel,
            port_solo_high,
        }
    }
}

fn index_reference_docs(
    store: &dyn ProfileStore,
    job_id: i32,
) -> Result<HashMap<(String, i32), f64>> {
    let docs = match store.measurements(job_id) {
        Ok(docs) => docs,
        Err(StoreError::NotFound(what)) => bail!("injector reference runs absent: {what}"),
        Err(StoreError::Unavailable(e)) => return Err(e),
    };
    let mut map = HashMap::new();
    for doc in docs {
        map.insert((doc.feature.clone(), doc.pressure), doc.ipc);
    }
    Ok(map)
}

fn lookup_ref(map: &HashMap<(String, i32), f64>, feature: &str, pressure: i32) -> Result<f64> {
    map.get(&(feature.to_string(), pressure)).copied().ok_or_else(|| {
        anyhow::anyhow!("missing reference measurement {feature} pressure={pressure}")
    })
}

/// Derive the characteristic vector of one job from its measurement rows.
pub fn derive_profile(
    job_id: i32,
    docs: &[MeasurementDoc],
    baselines: &InjectorBaselines,
    catalog: &Catalog,
) -> Result<WorkloadProfile, ProfileError> {
    let index = DocIndex::new(docs);

    let single_ipc = index.get(FEATURE_SINGLE, PRESSURE_LOW, RunType::Workload)?;
    let scale_factor = if single_ipc > 0.0 {
        index.get(SCALE_PROBE, PRESSURE_LOW, RunType::Workload)? / single_ipc
    } else {
        // No solo baseline: the workload still gets placed, only its STP
        // contribution is suppressed downstream.
        warn!("profile: job {job_id} has single_ipc=0, scale factor defaults to 1");
        1.0
    };

    let mut chars = Vec::with_capacity(catalog.len());
    for resource in catalog.iter() {
        let c = match resource.kind {
            ResourceKind::Sequential => {
                sequential_chars(&index, resource, single_ipc, baselines, catalog)?
            }
            ResourceKind::Parallel => parallel_chars(&index, resource, single_ipc, baselines)?,
            ResourceKind::Port => port_chars(&index, resource, single_ipc, baselines)?,
        };
        debug!(
            "profile: job {job_id} {}: sens={:.3} usage={:.3} int={:.3} base={:.3}",
            resource.name, c.sensitivity, c.usage, c.intensity, c.base_slowdown
        );
        chars.push(c);
    }

    Ok(WorkloadProfile {
        chars,
        single_ipc,
        scale_factor,
    })
}

fn sequential_chars(
    index: &DocIndex,
    resource: &Resource,
    single_ipc: f64,
    baselines: &InjectorBaselines,
    catalog: &Catalog,
) -> Result<ResourceChars, ProfileError> {
    let name = resource.name;
    let injector_solo = baselines.sequential_solo_low[name];
    let injector_corun = index.get(name, PRESSURE_LOW, RunType::Injector)?;
    let intensity = 1.0 - injector_corun / injector_solo;

    let low = index.get(name, PRESSURE_LOW, RunType::Workload)?;
    let medium = index.get(name, PRESSURE_MEDIUM, RunType::Workload)?;
    let high = index.get(name, PRESSURE_HIGH, RunType::Workload)?;

    let base_slowdown = if single_ipc > 0.0 { 1.0 - low / single_ipc } else { 0.0 };
    let mut sensitivity = if low > 0.0 { 1.0 - high / low } else { 0.0 };

    // Locate the pressure level where the low-pressure IPC is lost, then map
    // the remaining headroom to an occupancy fraction.
    let (_, medium_point, high_point) = catalog.pressure_points(resource);
    let line = LineFit::through((medium_point as f64, medium), (high_point as f64, high));
    let mut drop_point = line.x_at(low);

    let size = resource.size as f64;
    let watermark = resource.watermark as f64;
    let usable_max = size - watermark;
    if line.slope > 0.0 {
        // IPC rising with pressure is measurement noise; call the usage
        // minimal.
        drop_point = usable_max;
    } else if drop_point <= watermark {
        drop_point = watermark;
    } else if drop_point >= usable_max {
        drop_point = usable_max;
    }

    if sensitivity <= 0.0 {
        sensitivity = 1e-7;
    }
    let usage = if sensitivity > SENSITIVITY_FLOOR {
        ((size - drop_point) / size).max(0.0)
    } else {
        0.0
    };

    Ok(ResourceChars {
        sensitivity: clamp01(sensitivity),
        usage: clamp01(usage),
        intensity: clamp01(intensity),
        base_slowdown: clamp01(base_slowdown),
    })
}

fn parallel_chars(
    index: &DocIndex,
    resource: &Resource,
    single_ipc: f64,
    baselines: &InjectorBaselines,
) -> Result<ResourceChars, ProfileError> {
    let name = resource.name;
    let refs = &baselines.parallel[name];

    let injector_corun = index.get(name, PRESSURE_LOW, RunType::Injector)?;
    let intensity = 1.0 - injector_corun / refs.solo_low;

    let low = index.get(name, PRESSURE_LOW, RunType::Workload)?;
    let high = index.get(name, PRESSURE_PARALLEL_HIGH, RunType::Workload)?;
    let base_slowdown = if single_ipc > 0.0 { 1.0 - low / single_ipc } else { 0.0 };
    let sensitivity = if low > 0.0 { 1.0 - high / low } else { 0.0 };

    // Where the injector's co-run IPC lands between its contended extremes
    // is how much of the resource this workload occupies.
    let injector_current = index.get(name, PRESSURE_PARALLEL_HIGH, RunType::Injector)?;
    let span = refs.high_low - refs.high_high;
    let usage = if span.abs() > f64::EPSILON {
        (refs.high_low - injector_current) / span
    } else {
        0.0
    };

    Ok(ResourceChars {
        sensitivity: clamp01(sensitivity),
        usage: clamp01(usage),
        intensity: clamp01(intensity),
        base_slowdown: clamp01(base_slowdown),
    })
}

fn port_chars(
    index: &DocIndex,
    resource: &Resource,
    single_ipc: f64,
    baselines: &InjectorBaselines,
) -> Result<ResourceChars, ProfileError> {
    let name = resource.name;
    let injector_solo = baselines.port_solo_high[name];
    let injector_corun = index.get(name, PRESSURE_LOW, RunType::Injector)?;
    let intensity = 1.0 - injector_corun / injector_solo;

    let high = index.get(name, PRESSURE_LOW, RunType::Workload)?;
    let base_slowdown = if single_ipc > 0.0 { 1.0 - high / single_ipc } else { 0.0 };

    // Ports only have the saturated measurement: sensitivity collapses to
    // the base slowdown and usage to the intensity.
    Ok(ResourceChars {
        sensitivity: clamp01(base_slowdown),
        usage: clamp01(intensity),
        intensity: clamp01(intensity),
        base_slowdown: clamp01(base_slowdown),
    })
}

/// Fetch and derive one job's profile, retrying transient store failures
/// with bounded exponential backoff.
pub fn load_profile(
    store: &dyn ProfileStore,
    baselines: &InjectorBaselines,
    catalog: &Catalog,
    job_id: i32,
) -> Result<WorkloadProfile, ProfileError> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut backoff = Duration::from_millis(200);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = store
            .measurements(job_id)
            .map_err(ProfileError::from)
            .and_then(|docs| derive_profile(job_id, &docs, baselines, catalog));
        match outcome {
            Ok(profile) => return Ok(profile),
            Err(ProfileError::Unavailable(e)) if attempt < MAX_ATTEMPTS => {
                warn!(
                    "profile: job {job_id} fetch attempt {attempt} failed, retrying in {:?}: {e:#}",
                    backoff
                );
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
            Err(e) => return Err(e),
        }
    }
}
