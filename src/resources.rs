//! Shared-resource catalog.
//!
//! The catalog fixes the set of microarchitectural resources the score model
//! operates on, their contention class, and the sizing constants used when
//! deriving workload characteristics from profile measurements. The order of
//! entries is the feature order of the trained model and must not change
//! after load.

/// Contention class of a resource. The class selects the activation function
/// used when combining two workloads' usages (see `score::activation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Queue-like resources (issue queues, uop cache): contention only once
    /// combined occupancy exceeds capacity.
    Sequential,
    /// Cache-like resources (caches, TLBs): probabilistic collisions scale
    /// with combined usage.
    Parallel,
    /// Execution ports; activated like sequential resources.
    Port,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: &'static str,
    pub kind: ResourceKind,
    /// Entry count of the resource; zero for resources probed indirectly.
    pub size: u32,
    /// Entries below which occupancy measurements are unreliable.
    pub watermark: u32,
}

/// Injector pressure levels, shared with the profile document encoding.
pub const PRESSURE_LOW: i32 = 0;
pub const PRESSURE_MEDIUM: i32 = 1;
pub const PRESSURE_HIGH: i32 = 2;

/// Parallel-type resources only distinguish low and high pressure.
pub const PRESSURE_PARALLEL_HIGH: i32 = 1;

/// Reserved job ids for injector reference runs in the measurement store.
pub const INJECTOR_SOLO: i32 = -1;
pub const INJECTOR_LOW: i32 = -2;
pub const INJECTOR_HIGH: i32 = -3;

/// Feature name of the solo-run baseline documents.
pub const FEATURE_SINGLE: &str = "single";

/// The CMP-level co-run probe used to derive the scale factor. Not part of
/// the pair model's feature vector.
pub const SCALE_PROBE: &str = "l3_cache";

/// Ratio of usable queue depth at which the medium pressure point sits.
const MEDIUM_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct Catalog {
    resources: Vec<Resource>,
}

impl Catalog {
    /// Catalog for the Intel Gen11 reference machine the profiling pipeline
    /// targets.
    pub fn intel_gen11() -> Self {
        Catalog {
            resources: vec![
                Resource {
                    name: "int_port",
                    kind: ResourceKind::Port,
                    size: 0,
                    watermark: 0,
                },
                Resource {
                    name: "int_isq",
                    kind: ResourceKind::Sequential,
                    size: 75,
                    watermark: 6,
                },
                Resource {
                    name: "fp_port",
                    kind: ResourceKind::Port,
                    size: 0,
                    watermark: 0,
                },
                Resource {
                    name: "load_isq",
                    kind: ResourceKind::Sequential,
                    size: 46,
                    watermark: 8,
                },
                Resource {
                    name: "l1_dcache",
                    kind: ResourceKind::Parallel,
                    size: 64 * 12,
                    watermark: 0,
                },
                Resource {
                    name: "l2_cache",
                    kind: ResourceKind::Parallel,
                    size: 1024 * 8,
                    watermark: 0,
                },
                Resource {
                    name: "l1_dtlb",
                    kind: ResourceKind::Parallel,
                    size: 16 * 4,
                    watermark: 0,
                },
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn get(&self, idx: usize) -> &Resource {
        &self.resources[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.resources.iter().position(|r| r.name == name)
    }

    /// Pressure-point entry counts `(low, medium, high)` for a
    /// sequential-type resource. The medium point sits at `MEDIUM_RATIO` of
    /// the usable depth.
    pub fn pressure_points(&self, resource: &Resource) -> (u32, u32, u32) {
        let usable = resource.size.saturating_sub(resource.watermark);
        (1, (usable as f64 * MEDIUM_RATIO) as u32, usable)
    }
}
