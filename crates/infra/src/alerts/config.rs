//! Declarative alert configuration (TOML or JSON) and rule compilation.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::channels::ChannelKind;
use crate::jobs::QueueMode;

#[derive(Debug, thiserror::Error)]
pub enum AlertConfigError {
    #[error("failed to read alert config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in alert config {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid JSON in alert config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole alert configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertConfig {
    pub settings: AlertSettings,
    pub job_failures: Vec<AlertRule<JobFailureConditions>>,
    pub queue_health: Vec<AlertRule<QueueHealthConditions>>,
    pub performance: Vec<AlertRule<PerformanceConditions>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertSettings {
    pub enabled: bool,
    /// Default channels for rules that do not name their own.
    pub channels: Vec<ChannelKind>,
    pub slack: SlackSettings,
    pub email: EmailSettings,
    pub discord: DiscordSettings,
    pub throttle: ThrottlePolicy,
    pub health_check_interval_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            channels: Vec::new(),
            slack: SlackSettings::default(),
            email: EmailSettings::default(),
            discord: DiscordSettings::default(),
            throttle: ThrottlePolicy::default(),
            health_check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlackSettings {
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmailSettings {
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscordSettings {
    pub username: Option<String>,
}

/// Per-key suppression policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottlePolicy {
    /// Minimum seconds between two sends of the same key.
    pub min_interval_secs: i64,
    /// Sends allowed per key within one hour window.
    pub max_alerts_per_job_per_hour: u32,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_interval_secs: 300,
            max_alerts_per_job_per_hour: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule<C> {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Severity,
    /// Empty falls back to `settings.channels`.
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
    pub conditions: C,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobFailureConditions {
    pub job_pattern: Option<String>,
    /// The N most recent executions all failed.
    pub consecutive_failures: Option<usize>,
    /// At least N failures of the job within the last hour.
    pub failure_count: Option<usize>,
    /// Case-insensitive substring of the error.
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueHealthConditions {
    pub dlq_size: Option<usize>,
    /// pending + ready
    pub pending_jobs: Option<usize>,
    pub delayed_jobs: Option<usize>,
    pub mode: Option<QueueMode>,
    pub new_dead_letter: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceConditions {
    pub job_pattern: Option<String>,
    pub min_runs: usize,
    /// Fires when the observed success rate is below this.
    pub success_rate: Option<f64>,
    /// Fires when the run took at least this multiple of the historical average.
    pub duration_increase: Option<f64>,
}

/// Conditions of a compiled rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleConditions {
    JobFailure(JobFailureConditions),
    QueueHealth(QueueHealthConditions),
    Performance(PerformanceConditions),
}

/// An enabled, validated rule.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub severity: Severity,
    pub channels: Vec<ChannelKind>,
    pattern: Option<Regex>,
    pub conditions: RuleConditions,
}

impl CompiledRule {
    pub fn matches_job(&self, job_id: &str) -> bool {
        self.pattern.as_ref().is_none_or(|p| p.is_match(job_id))
    }
}

/// Rules ready for evaluation, grouped by category.
#[derive(Debug, Clone, Default)]
pub struct AlertRuleSet {
    pub job_failures: Vec<CompiledRule>,
    pub queue_health: Vec<CompiledRule>,
    pub performance: Vec<CompiledRule>,
    /// Names of rules dropped as malformed.
    pub rejected: Vec<String>,
}

impl AlertRuleSet {
    pub fn len(&self) -> usize {
        self.job_failures.len() + self.queue_health.len() + self.performance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertConfig {
    /// Load a TOML document, or JSON when the file ends in `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AlertConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| AlertConfigError::Io {
            path: display.clone(),
            source,
        })?;

        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            serde_json::from_str(&raw).map_err(|source| AlertConfigError::Json { path: display, source })
        } else {
            toml::from_str(&raw).map_err(|source| AlertConfigError::Toml { path: display, source })
        }
    }

    /// Compile enabled rules. Malformed rules are dropped with a warning.
    pub fn compile(&self) -> AlertRuleSet {
        let mut set = AlertRuleSet::default();

        for rule in self.job_failures.iter().filter(|r| r.enabled) {
            let c = &rule.conditions;
            let problem = if c.consecutive_failures.is_none() && c.failure_count.is_none() && c.failure_reason.is_none() {
                Some("no condition set".to_string())
            } else if c.consecutive_failures == Some(0) || c.failure_count == Some(0) {
                Some("counts must be at least 1".to_string())
            } else {
                None
            };
            self.push(&mut set, Category::JobFailure, rule, c.job_pattern.as_deref(), problem, || {
                RuleConditions::JobFailure(c.clone())
            });
        }

        for rule in self.queue_health.iter().filter(|r| r.enabled) {
            let c = &rule.conditions;
            let empty = c.dlq_size.is_none()
                && c.pending_jobs.is_none()
                && c.delayed_jobs.is_none()
                && c.mode.is_none()
                && !c.new_dead_letter;
            let problem = empty.then(|| "no condition set".to_string());
            self.push(&mut set, Category::QueueHealth, rule, None, problem, || {
                RuleConditions::QueueHealth(c.clone())
            });
        }

        for rule in self.performance.iter().filter(|r| r.enabled) {
            let c = &rule.conditions;
            let problem = if c.success_rate.is_none() && c.duration_increase.is_none() {
                Some("no condition set".to_string())
            } else if c.success_rate.is_some_and(|r| !(0.0..=1.0).contains(&r)) {
                Some("successRate must be within 0..=1".to_string())
            } else if c.duration_increase.is_some_and(|k| k <= 0.0) {
                Some("durationIncrease must be positive".to_string())
            } else {
                None
            };
            self.push(&mut set, Category::Performance, rule, c.job_pattern.as_deref(), problem, || {
                RuleConditions::Performance(c.clone())
            });
        }

        set
    }

    fn push<C>(
        &self,
        set: &mut AlertRuleSet,
        category: Category,
        rule: &AlertRule<C>,
        pattern: Option<&str>,
        problem: Option<String>,
        conditions: impl FnOnce() -> RuleConditions,
    ) {
        let compiled_pattern = match pattern.map(Regex::new).transpose() {
            Ok(p) => p,
            Err(err) => {
                warn!(rule = %rule.name, error = %err, "invalid jobPattern; rule disabled");
                set.rejected.push(rule.name.clone());
                return;
            }
        };
        if let Some(problem) = problem {
            warn!(rule = %rule.name, problem = %problem, "malformed alert rule; rule disabled");
            set.rejected.push(rule.name.clone());
            return;
        }

        let channels = if rule.channels.is_empty() {
            self.settings.channels.clone()
        } else {
            rule.channels.clone()
        };
        let compiled = CompiledRule {
            name: rule.name.clone(),
            severity: rule.severity,
            channels,
            pattern: compiled_pattern,
            conditions: conditions(),
        };
        match category {
            Category::JobFailure => set.job_failures.push(compiled),
            Category::QueueHealth => set.queue_health.push(compiled),
            Category::Performance => set.performance.push(compiled),
        }
    }
}

#[derive(Clone, Copy)]
enum Category {
    JobFailure,
    QueueHealth,
    Performance,
}
