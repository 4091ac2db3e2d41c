use crate::config::{validate_threshold, JobDefaults};
use crate::job::JobError;
use crate::url::normalize_url;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Limits a job runs under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Units of this job in flight at once
    pub max_concurrency: u32,

    /// Retries allowed per unit after its first attempt
    pub retry_budget: u32,

    /// Render timeout per unit (milliseconds)
    pub unit_timeout_ms: u64,

    /// Fraction of permanently failed units above which the job is failed
    pub poison_threshold: f64,

    /// Dispatch units one at a time in id order
    pub ordered: bool,

    /// Cap on frontier size, including discovered links
    pub max_units: usize,
}

impl JobConstraints {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }

    /// Units of this job allowed in flight right now
    pub fn effective_concurrency(&self) -> usize {
        if self.ordered {
            1
        } else {
            self.max_concurrency as usize
        }
    }
}

/// A validated job, as persisted with every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Extraction rule id, resolved against the rule registry
    pub rule: String,

    pub seeds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_selector: Option<String>,

    pub constraints: JobConstraints,
}

/// A job submission as read from a job file or handed over by a caller
///
/// The rule and any constraint left unset fall back to the `[jobs]`
/// configuration section.
///
/// ```toml
/// rule = "document"
/// urls = ["https://example.com/", "https://example.com/about"]
/// max-concurrency = 2
/// retry-budget = 1
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub rule: String,

    #[serde(default)]
    pub urls: Vec<String>,

    /// Single seed, for callers that start from one page
    #[serde(default)]
    pub url: Option<String>,

    #[serde(rename = "expected-selector", default)]
    pub expected_selector: Option<String>,

    #[serde(rename = "max-concurrency", default)]
    pub max_concurrency: Option<u32>,

    #[serde(rename = "retry-budget", default)]
    pub retry_budget: Option<u32>,

    #[serde(rename = "unit-timeout-ms", default)]
    pub unit_timeout_ms: Option<u64>,

    #[serde(rename = "poison-threshold", default)]
    pub poison_threshold: Option<f64>,

    #[serde(default)]
    pub ordered: bool,

    #[serde(rename = "max-units", default)]
    pub max_units: Option<usize>,
}

/// One row of a CSV job file; other columns are ignored
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default)]
    url: Option<String>,

    #[serde(default)]
    name: Option<String>,
}

impl JobRequest {
    /// Convenience constructor for a list of seed URLs
    pub fn new<I, S>(rule: &str, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rule: rule.to_string(),
            urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reads a job file, picking the format from its extension
    ///
    /// * `.toml`, `.json` - A full job description; JSON may also be a bare array of URLs
    /// * `.txt` - One URL per line, blank lines and `#` comments skipped
    /// * `.csv` - A header row with a `url` column, or a `name` column holding URLs
    ///
    /// # Arguments
    ///
    /// * `path` - The job file
    pub fn from_path(path: &Path) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path).map_err(|e| JobError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            Some("txt") => Ok(Self::from_url_list(&content)),
            Some("csv") => Self::from_csv(&content),
            other => Err(JobError::Malformed(format!(
                "unsupported job file type '{}' (expected toml, json, txt or csv)",
                other.unwrap_or("")
            ))),
        }
    }

    /// Parses a job file in TOML form
    pub fn from_toml(content: &str) -> Result<Self, JobError> {
        toml::from_str(content).map_err(|e| JobError::Malformed(e.to_string()))
    }

    /// Parses a JSON job: either an object with the TOML keys or an array of URLs
    pub fn from_json(content: &str) -> Result<Self, JobError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum JsonJob {
            Urls(Vec<String>),
            Request(JobRequest),
        }

        match serde_json::from_str(content).map_err(|e| JobError::Malformed(e.to_string()))? {
            JsonJob::Urls(urls) => Ok(Self {
                urls,
                ..Self::default()
            }),
            JsonJob::Request(request) => Ok(request),
        }
    }

    /// Reads a plain URL list
    pub fn from_url_list(content: &str) -> Self {
        let urls = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        Self {
            urls,
            ..Self::default()
        }
    }

    /// Reads URLs from a CSV file with a header row
    ///
    /// Rows without a URL (a `name` that is not a link, or an empty `url`)
    /// are skipped with a warning.
    pub fn from_csv(content: &str) -> Result<Self, JobError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(content.as_bytes());

        let mut urls = Vec::new();
        for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|e| JobError::Malformed(format!("csv: {}", e)))?;
            let url = row
                .url
                .filter(|u| !u.is_empty())
                .or_else(|| row.name.filter(|n| n.starts_with("http")));
            match url {
                Some(url) => urls.push(url),
                // Header is line 1
                None => tracing::warn!("Skipping CSV line {}: no URL", index + 2),
            }
        }

        Ok(Self {
            urls,
            ..Self::default()
        })
    }

    /// Validates the request and fills unset constraints from `defaults`
    ///
    /// # Returns
    ///
    /// * `Ok(JobSpec)` - The request is acceptable
    /// * `Err(JobError)` - Empty frontier, bad URL, out-of-range constraint, or
    ///   more distinct seeds than `max-units`
    pub fn into_spec(self, defaults: &JobDefaults) -> Result<JobSpec, JobError> {
        let mut seen = HashSet::new();
        let mut seeds = Vec::new();
        for seed in self.urls.into_iter().chain(self.url) {
            let seed = seed.trim().to_string();
            if seed.is_empty() {
                continue;
            }
            let key = normalize_url(&seed).map_err(|e| JobError::InvalidUrl {
                url: seed.clone(),
                reason: e.to_string(),
            })?;
            // Duplicates collapse onto the first spelling seen
            if seen.insert(key.to_string()) {
                seeds.push(seed);
            }
        }

        if seeds.is_empty() {
            return Err(JobError::EmptyFrontier);
        }

        let expected_selector = self.expected_selector.filter(|s| !s.trim().is_empty());
        if let Some(selector) = &expected_selector {
            Selector::parse(selector).map_err(|e| {
                JobError::InvalidConstraint(format!(
                    "expected-selector '{}' does not parse: {:?}",
                    selector, e
                ))
            })?;
        }

        let rule = match self.rule.trim() {
            "" => defaults.rule.trim().to_string(),
            named => named.to_string(),
        };
        if rule.is_empty() {
            return Err(JobError::InvalidConstraint(
                "rule cannot be empty".to_string(),
            ));
        }

        let constraints = JobConstraints {
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            retry_budget: self.retry_budget.unwrap_or(defaults.retry_budget),
            unit_timeout_ms: self.unit_timeout_ms.unwrap_or(defaults.unit_timeout_ms),
            poison_threshold: self.poison_threshold.unwrap_or(defaults.poison_threshold),
            ordered: self.ordered,
            max_units: self.max_units.unwrap_or(defaults.max_units),
        };

        if constraints.max_concurrency == 0 {
            return Err(JobError::InvalidConstraint(
                "max-concurrency must be >= 1".to_string(),
            ));
        }
        if constraints.unit_timeout_ms == 0 {
            return Err(JobError::InvalidConstraint(
                "unit-timeout-ms must be > 0".to_string(),
            ));
        }
        validate_threshold(constraints.poison_threshold)
            .map_err(|e| JobError::InvalidConstraint(e.to_string()))?;
        if constraints.max_units == 0 {
            return Err(JobError::InvalidConstraint(
                "max-units must be >= 1".to_string(),
            ));
        }
        if constraints.max_units < seeds.len() {
            return Err(JobError::InvalidConstraint(format!(
                "{} distinct seeds exceed max-units {}; would drop: {}",
                seeds.len(),
                constraints.max_units,
                seeds[constraints.max_units..].join(", ")
            )));
        }

        Ok(JobSpec {
            rule,
            seeds,
            expected_selector,
            constraints,
        })
    }
}
