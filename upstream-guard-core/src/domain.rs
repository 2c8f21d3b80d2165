use serde::{Deserialize, Serialize};
use std::fmt;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Too many failures, requests are rejected
    Open,
    /// Testing if the upstream has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// How far a payload can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceReliability {
    High,
    Medium,
    Low,
}

impl fmt::Display for SourceReliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceReliability::High => write!(f, "High"),
            SourceReliability::Medium => write!(f, "Medium"),
            SourceReliability::Low => write!(f, "Low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueType {
    HighLessThanLow,
    CloseOutsideHighLowRange,
    NegativePrice,
    ZeroPriceWithPositiveVolume,
    MissingCriticalField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub issue_type: IntegrityIssueType,
    pub message: String,
    pub severity: IssueSeverity,
}

impl IntegrityIssue {
    pub fn new(
        issue_type: IntegrityIssueType,
        message: impl Into<String>,
        severity: IssueSeverity,
    ) -> Self {
        Self {
            issue_type,
            message: message.into(),
            severity,
        }
    }
}

/// Field weighting tier used by completeness scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTier {
    Critical,
    Important,
    Standard,
}

impl FieldTier {
    pub fn weight(self) -> f64 {
        match self {
            FieldTier::Critical => 2.0,
            FieldTier::Important => 1.5,
            FieldTier::Standard => 1.0,
        }
    }
}

/// Expected fields of a payload, grouped by tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaHints {
    pub critical: Vec<String>,
    pub important: Vec<String>,
    pub standard: Vec<String>,
}

impl SchemaHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn critical<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn important<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.important.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn standard<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.standard.extend(fields.into_iter().map(Into::into));
        self
    }

    /// All expected fields with their tier, critical first.
    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldTier)> {
        self.critical
            .iter()
            .map(|f| (f.as_str(), FieldTier::Critical))
            .chain(self.important.iter().map(|f| (f.as_str(), FieldTier::Important)))
            .chain(self.standard.iter().map(|f| (f.as_str(), FieldTier::Standard)))
    }

    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.important.is_empty() && self.standard.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.fields().map(|(_, tier)| tier.weight()).sum()
    }
}

/// Outcome of scoring one payload. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    completeness_score: u8,
    integrity_issues: Vec<IntegrityIssue>,
    source_reliability: SourceReliability,
    missing_fields: Vec<String>,
    warnings: Vec<String>,
}

impl QualityReport {
    pub fn new(
        completeness_score: u8,
        integrity_issues: Vec<IntegrityIssue>,
        source_reliability: SourceReliability,
        missing_fields: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            completeness_score: completeness_score.min(100),
            integrity_issues,
            source_reliability,
            missing_fields,
            warnings,
        }
    }

    pub fn completeness_score(&self) -> u8 {
        self.completeness_score
    }

    pub fn integrity_issues(&self) -> &[IntegrityIssue] {
        &self.integrity_issues
    }

    pub fn source_reliability(&self) -> SourceReliability {
        self.source_reliability
    }

    pub fn missing_fields(&self) -> &[String] {
        &self.missing_fields
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_high_severity_issue(&self) -> bool {
        self.integrity_issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::High)
    }
}

/// Describes one logical request flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Partitions limiter, breaker and cache state.
    pub resource_key: String,
    /// Lower value is served first.
    pub priority: u8,
    /// Selects cache TTL and quality schema.
    pub category: String,
    /// Skip the cache read (the result is still written back).
    pub force_refresh: bool,
}

impl PipelineRequest {
    pub fn new(resource_key: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            priority: 1,
            category: category.into(),
            force_refresh: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Metadata attached to every pipeline response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub from_cache: bool,
    pub stale: bool,
    pub data_age_ms: u64,
    pub completeness_score: u8,
    pub source_reliability: SourceReliability,
    pub warnings: Vec<String>,
    pub quality: QualityReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse<T> {
    pub data: T,
    pub meta: ResponseMeta,
}
