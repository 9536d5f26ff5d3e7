//! Profile document store.
//!
//! The profiling pipeline persists per-workload measurement documents and a
//! trained prediction model in a document database. At runtime only two read
//! paths exist: fetch all measurement documents for one job, and fetch the
//! newest trained model. [`ProfileStore`] is the seam a real database client
//! plugs into; the shipped implementation reads JSON documents from a
//! directory, which is also what the tests use.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Whether a measurement row describes the profiled workload or the injector
/// co-runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Workload,
    Injector,
}

/// One row of the measurement collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementDoc {
    pub node_name: String,
    pub job_id: i32,
    pub feature: String,
    #[serde(default)]
    pub feature_id: i32,
    #[serde(default)]
    pub feature_type: i32,
    pub pressure: i32,
    pub run_type: RunType,
    #[serde(rename = "IPC")]
    pub ipc: f64,
    #[serde(default)]
    pub timestamp: i64,
}

/// The trained linear model document.
///
/// `feature_list[0]` is the `"base"` term; the remaining entries name the
/// resources the coefficients apply to, in catalog order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDoc {
    pub feature_list: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

/// Store errors split by how callers recover: absence excludes the workload
/// from scheduling, transient failure is retried with backoff.
#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Unavailable(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e:#}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait ProfileStore: Send + Sync {
    /// All measurement documents for one job on this node.
    fn measurements(&self, job_id: i32) -> Result<Vec<MeasurementDoc>, StoreError>;

    /// The trained model document.
    fn model(&self) -> Result<ModelDoc, StoreError>;
}

/// Directory-backed store: `measurement.json` holds the measurement
/// collection as a JSON array, and `prediction_model_<timestamp>.json` files
/// hold trained models, the largest timestamp winning.
pub struct JsonStore {
    dir: PathBuf,
    node_name: String,
    model_path: Option<PathBuf>,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>, node_name: impl Into<String>) -> Self {
        JsonStore {
            dir: dir.into(),
            node_name: node_name.into(),
            model_path: None,
        }
    }

    /// Pin the model to an explicit path instead of discovering the newest
    /// `prediction_model_*.json`.
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    fn latest_model_path(&self) -> Result<PathBuf, StoreError> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading store dir {}", self.dir.display()))
            .map_err(StoreError::Unavailable)?;

        let mut best: Option<(i64, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name
                .strip_prefix("prediction_model_")
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(ts) = stem.parse::<i64>() else {
                continue;
            };
            if best.as_ref().map(|(b, _)| ts > *b).unwrap_or(true) {
                best = Some((ts, entry.path()));
            }
        }

        best.map(|(_, p)| p)
            .ok_or_else(|| StoreError::NotFound(format!("prediction model in {}", self.dir.display())))
    }

    /// Distinct workload job ids present on this node, injector reference
    /// runs excluded. Used by the scoreboard diagnostic.
    pub fn job_ids(&self) -> Result<Vec<i32>, StoreError> {
        let all: Vec<MeasurementDoc> = Self::read_json(&self.dir.join("measurement.json"))?;
        let mut ids: Vec<i32> = all
            .into_iter()
            .filter(|d| d.node_name == self.node_name && d.job_id >= 0)
            .map(|d| d.job_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(StoreError::Unavailable(
                    anyhow!(e).context(format!("reading {}", path.display())),
                ));
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            StoreError::Unavailable(anyhow!(e).context(format!("parsing {}", path.display())))
        })
    }
}

impl ProfileStore for JsonStore {
    fn measurements(&self, job_id: i32) -> Result<Vec<MeasurementDoc>, StoreError> {
        let all: Vec<MeasurementDoc> = Self::read_json(&self.dir.join("measurement.json"))?;
        let docs: Vec<MeasurementDoc> = all
            .into_iter()
            .filter(|d| d.node_name == self.node_name && d.job_id == job_id)
            .collect();
        if docs.is_empty() {
            return Err(StoreError::NotFound(format!(
                "measurements for job {job_id} on {}",
                self.node_name
            )));
        }
        Ok(docs)
    }

    fn model(&self) -> Result<ModelDoc, StoreError> {
        let path = match &self.model_path {
            Some(p) => p.clone(),
            None => self.latest_model_path()?,
        };
        Self::read_json(&path)
    }
}
