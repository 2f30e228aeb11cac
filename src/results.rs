//! In-memory, versioned result store.
//!
//! Every attempt of every experiment saves one [`ExperimentResult`]. Results
//! are append-only per experiment identifier: saving again under the same
//! identifier creates a new version, and reads return the newest one unless
//! a version is asked for explicitly.
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | [`save`](ResultStore::save) | Append a version, returns its number |
//! | [`get`](ResultStore::get) | Newest version of an experiment |
//! | [`history`](ResultStore::history) | All versions, oldest first |
//! | [`search`](ResultStore::search) | Filter newest versions by [`ResultQuery`] |
//! | [`compare`](ResultStore::compare) | Metrics of several experiments side by side |
//! | [`cleanup`](ResultStore::cleanup) | Drop old versions, keeping the newest |
//! | [`export`](ResultStore::export) | JSON or CSV snapshot |
//! | [`import_json`](ResultStore::import_json) | Restore a JSON export |
//!
//! # Export Format
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "exported_at": "2026-01-01T00:00:00Z",
//!   "experiments": [
//!     { "experiment_id": "baseline", "versions": [ { ... }, { ... } ] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::lifecycle::Stage;

/// Version of the JSON export document.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No result for experiment '{0}'")]
    ResultNotFound(String),

    #[error("Experiment '{id}' has no version {version}")]
    VersionNotFound { id: String, version: u32 },

    #[error("Invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Unsupported export format version {0}")]
    UnsupportedFormat(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A metric value: numeric when it parses as a finite number, text
/// otherwise. JSON has no NaN or infinity, so those are kept as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// ```
    /// use labgrid::results::MetricValue;
    /// assert_eq!(MetricValue::parse(" 0.25 "), MetricValue::Number(0.25));
    /// assert_eq!(MetricValue::parse("adam"), MetricValue::Text("adam".into()));
    /// assert_eq!(MetricValue::parse("nan"), MetricValue::Text("nan".into()));
    /// ```
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => MetricValue::Number(n),
            _ => MetricValue::Text(raw.to_string()),
        }
    }

    /// `Number` for finite values, their text form otherwise.
    pub fn number(value: f64) -> Self {
        if value.is_finite() {
            MetricValue::Number(value)
        } else {
            MetricValue::Text(value.to_string())
        }
    }

    fn normalized(self) -> Self {
        match self {
            MetricValue::Number(n) => MetricValue::number(n),
            text => text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", n),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::number(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

/// Final status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Completed => "COMPLETED",
            ResultStatus::Failed => "FAILED",
            ResultStatus::TimedOut => "TIMED_OUT",
            ResultStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Outcome of one experiment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub experiment_type: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub server: Option<String>,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub error_message: Option<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Assigned by [`ResultStore::save`].
    #[serde(default)]
    pub version: u32,
}

impl ExperimentResult {
    /// A result with no metrics, artifacts or tags, ending now.
    pub fn new(
        experiment_id: impl Into<String>,
        experiment_type: impl Into<String>,
        status: ResultStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        let ended_at = Utc::now();
        Self {
            experiment_id: experiment_id.into(),
            experiment_type: experiment_type.into(),
            status,
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            tags: Vec::new(),
            server: None,
            attempt: 1,
            error_message: None,
            stages: Vec::new(),
            started_at,
            ended_at,
            duration_secs: (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            version: 0,
        }
    }

    fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&needle);

        hit(&self.experiment_id)
            || hit(&self.experiment_type)
            || self.error_message.as_deref().is_some_and(hit)
            || self.artifacts.iter().any(|a| hit(a))
            || self.tags.iter().any(|t| hit(t))
    }
}

/// Filter for [`ResultStore::search`]. Empty fields match everything.
///
/// ```
/// use labgrid::results::{ResultQuery, ResultStatus};
///
/// let query = ResultQuery::new()
///     .tag("resnet")
///     .text("cuda")
///     .id_pattern(r"^sweep-\d+$")
///     .status(ResultStatus::Failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResultQuery {
    /// All of these tags must be present.
    pub tags: Vec<String>,
    /// Case-insensitive substring over id, type, error, artifacts and tags.
    pub text: Option<String>,
    /// Regular expression matched against the experiment id.
    pub id_pattern: Option<String>,
    pub status: Option<ResultStatus>,
    pub experiment_type: Option<String>,
}

impl ResultQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn id_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.id_pattern = Some(pattern.into());
        self
    }

    pub fn status(mut self, status: ResultStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn experiment_type(mut self, experiment_type: impl Into<String>) -> Self {
        self.experiment_type = Some(experiment_type.into());
        self
    }
}

/// One experiment's column in a [`Comparison`].
#[derive(Debug, Clone, Serialize)]
pub struct ComparedExperiment {
    pub experiment_id: String,
    pub version: u32,
    pub status: ResultStatus,
    pub duration_secs: f64,
}

/// Newest versions of several experiments side by side.
///
/// `metrics[name][i]` belongs to `experiments[i]`; `None` where that
/// experiment did not report the metric.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub experiments: Vec<ComparedExperiment>,
    pub metrics: BTreeMap<String, Vec<Option<MetricValue>>>,
}

/// Aggregates over the newest version of every experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ResultStatistics {
    pub experiments: usize,
    pub versions: usize,
    pub by_status: BTreeMap<ResultStatus, usize>,
    pub by_type: BTreeMap<String, usize>,
    /// Completed / experiments, 0 when the store is empty.
    pub success_rate: f64,
    pub mean_duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Serialize, Deserialize)]
struct ExportDocument {
    format_version: u32,
    exported_at: DateTime<Utc>,
    experiments: Vec<ExportedExperiment>,
}

#[derive(Serialize, Deserialize)]
struct ExportedExperiment {
    experiment_id: String,
    versions: Vec<ExperimentResult>,
}

/// Thread-safe store of experiment results.
#[derive(Debug, Default)]
pub struct ResultStore {
    experiments: RwLock<BTreeMap<String, Vec<ExperimentResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<ExperimentResult>>> {
        self.experiments.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<ExperimentResult>>> {
        self.experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `result` as the newest version of its experiment.
    ///
    /// ```
    /// use chrono::Utc;
    /// use labgrid::results::{ExperimentResult, ResultStatus, ResultStore};
    ///
    /// let store = ResultStore::new();
    /// let first = ExperimentResult::new("exp", "shell", ResultStatus::Failed, Utc::now());
    /// let second = ExperimentResult::new("exp", "shell", ResultStatus::Completed, Utc::now());
    ///
    /// assert_eq!(store.save(first), 1);
    /// assert_eq!(store.save(second), 2);
    /// assert_eq!(store.get("exp").unwrap().status, ResultStatus::Completed);
    /// ```
    pub fn save(&self, mut result: ExperimentResult) -> u32 {
        let mut experiments = self.write();
        let history = experiments
            .entry(result.experiment_id.clone())
            .or_default();
        result.version = history.last().map_or(1, |r| r.version + 1);
        result.metrics = std::mem::take(&mut result.metrics)
            .into_iter()
            .map(|(name, value)| (name, value.normalized()))
            .collect();
        let version = result.version;
        debug!(
            "Saved result {} v{} ({})",
            result.experiment_id, version, result.status
        );
        history.push(result);
        version
    }

    pub fn get(&self, id: &str) -> StoreResult<ExperimentResult> {
        self.read()
            .get(id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| StoreError::ResultNotFound(id.to_string()))
    }

    pub fn get_version(&self, id: &str, version: u32) -> StoreResult<ExperimentResult> {
        let experiments = self.read();
        let history = experiments
            .get(id)
            .ok_or_else(|| StoreError::ResultNotFound(id.to_string()))?;
        history
            .iter()
            .find(|r| r.version == version)
            .cloned()
            .ok_or_else(|| StoreError::VersionNotFound {
                id: id.to_string(),
                version,
            })
    }

    /// All retained versions, oldest first.
    pub fn history(&self, id: &str) -> StoreResult<Vec<ExperimentResult>> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ResultNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Newest versions matching `query`, in id order.
    pub fn search(&self, query: &ResultQuery) -> StoreResult<Vec<ExperimentResult>> {
        let pattern = query.id_pattern.as_deref().map(Regex::new).transpose()?;

        Ok(self.search_by(|result| {
            query.tags.iter().all(|t| result.tags.contains(t))
                && query.text.as_deref().is_none_or(|t| result.matches_text(t))
                && pattern
                    .as_ref()
                    .is_none_or(|re| re.is_match(&result.experiment_id))
                && query.status.is_none_or(|s| result.status == s)
                && query
                    .experiment_type
                    .as_deref()
                    .is_none_or(|t| result.experiment_type == t)
        }))
    }

    /// Newest versions for which `predicate` holds.
    pub fn search_by(&self, predicate: impl Fn(&ExperimentResult) -> bool) -> Vec<ExperimentResult> {
        self.read()
            .values()
            .filter_map(|history| history.last())
            .filter(|result| predicate(result))
            .cloned()
            .collect()
    }

    /// Lines up the newest versions of `ids`.
    ///
    /// # Errors
    ///
    /// `ResultNotFound` for the first id with no stored result.
    pub fn compare(&self, ids: &[&str]) -> StoreResult<Comparison> {
        let results = ids
            .iter()
            .map(|id| self.get(id))
            .collect::<StoreResult<Vec<_>>>()?;

        let names: BTreeSet<&String> = results.iter().flat_map(|r| r.metrics.keys()).collect();
        let metrics = names
            .into_iter()
            .map(|name| {
                let column = results.iter().map(|r| r.metrics.get(name).cloned()).collect();
                (name.clone(), column)
            })
            .collect();

        Ok(Comparison {
            experiments: results
                .iter()
                .map(|r| ComparedExperiment {
                    experiment_id: r.experiment_id.clone(),
                    version: r.version,
                    status: r.status,
                    duration_secs: r.duration_secs,
                })
                .collect(),
            metrics,
        })
    }

    /// Drops versions that ended before `cutoff`. The newest version of each
    /// experiment is always kept. Returns the number of versions removed.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for history in self.write().values_mut() {
            let Some(newest) = history.pop() else {
                continue;
            };
            let before = history.len();
            history.retain(|r| r.ended_at >= cutoff);
            removed += before - history.len();
            history.push(newest);
        }
        if removed > 0 {
            info!("Removed {} result versions older than {}", removed, cutoff);
        }
        removed
    }

    /// Removes every version of `id`.
    pub fn purge(&self, id: &str) -> StoreResult<usize> {
        self.write()
            .remove(id)
            .map(|history| history.len())
            .ok_or_else(|| StoreError::ResultNotFound(id.to_string()))
    }

    pub fn statistics(&self) -> ResultStatistics {
        let experiments = self.read();
        let latest: Vec<&ExperimentResult> =
            experiments.values().filter_map(|h| h.last()).collect();

        let mut by_status = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for result in &latest {
            *by_status.entry(result.status).or_insert(0) += 1;
            *by_type.entry(result.experiment_type.clone()).or_insert(0) += 1;
        }

        let count = latest.len();
        let completed = by_status.get(&ResultStatus::Completed).copied().unwrap_or(0);
        let ratio = |n: f64| if count == 0 { 0.0 } else { n / count as f64 };

        ResultStatistics {
            experiments: count,
            versions: experiments.values().map(Vec::len).sum(),
            success_rate: ratio(completed as f64),
            mean_duration_secs: ratio(latest.iter().map(|r| r.duration_secs).sum()),
            by_status,
            by_type,
        }
    }

    /// Serializes every retained version.
    pub fn export(&self, format: ExportFormat) -> StoreResult<String> {
        match format {
            ExportFormat::Json => self.export_json(),
            ExportFormat::Csv => self.export_csv(),
        }
    }

    pub fn export_to(&self, path: &Path, format: ExportFormat) -> StoreResult<()> {
        let content = self.export(format)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        info!("Exported results to {}", path.display());
        Ok(())
    }

    fn export_json(&self) -> StoreResult<String> {
        let document = ExportDocument {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            experiments: self
                .read()
                .iter()
                .map(|(id, versions)| ExportedExperiment {
                    experiment_id: id.clone(),
                    versions: versions.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// One row per version; one `metric.<name>` column per metric name.
    fn export_csv(&self) -> StoreResult<String> {
        let experiments = self.read();
        let metric_names: BTreeSet<&String> = experiments
            .values()
            .flatten()
            .flat_map(|r| r.metrics.keys())
            .collect();

        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());

        let mut header: Vec<String> = [
            "experiment_id",
            "version",
            "experiment_type",
            "status",
            "server",
            "attempt",
            "started_at",
            "ended_at",
            "duration_secs",
            "error_message",
            "tags",
            "artifacts",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        header.extend(metric_names.iter().map(|name| format!("metric.{}", name)));
        writer.write_record(&header)?;

        for result in experiments.values().flatten() {
            let mut record = vec![
                result.experiment_id.clone(),
                result.version.to_string(),
                result.experiment_type.clone(),
                result.status.to_string(),
                result.server.clone().unwrap_or_default(),
                result.attempt.to_string(),
                result.started_at.to_rfc3339(),
                result.ended_at.to_rfc3339(),
                format!("{:.3}", result.duration_secs),
                result.error_message.clone().unwrap_or_default(),
                result.tags.join(";"),
                result.artifacts.join(";"),
            ];
            record.extend(
                metric_names
                    .iter()
                    .map(|name| result.metrics.get(*name).map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Restores a JSON export. Histories of the imported experiments replace
    /// whatever the store held for them. Returns the number of experiments
    /// imported.
    pub fn import_json(&self, data: &str) -> StoreResult<usize> {
        let document: ExportDocument = serde_json::from_str(data)?;
        if document.format_version != EXPORT_FORMAT_VERSION {
            return Err(StoreError::UnsupportedFormat(document.format_version));
        }

        let count = document.experiments.len();
        let mut experiments = self.write();
        for experiment in document.experiments {
            experiments.insert(experiment.experiment_id, experiment.versions);
        }
        Ok(count)
    }
}
