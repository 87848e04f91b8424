use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of resource submitted for analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A link.
    Url,
    /// A file, identified by its SHA-256 hash.
    File,
}

impl ResourceKind {
    /// Stable lowercase label, also used in cache keys.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One submission. Fields are private so a request cannot change after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    kind: ResourceKind,
    identifier: String,
    raw_content: Option<Vec<u8>>,
    display_name: String,
}

impl AnalysisRequest {
    /// Generic constructor matching the public orchestrator call.
    ///
    /// For files the display name defaults to the identifier; use
    /// [`AnalysisRequest::file`] or [`AnalysisRequest::file_hash`] to keep the
    /// original file name for the heuristic scorer.
    #[must_use]
    pub fn new(kind: ResourceKind, identifier: impl Into<String>, raw_content: Option<Vec<u8>>) -> Self {
        let identifier = identifier.into().trim().to_string();
        Self {
            kind,
            display_name: identifier.clone(),
            identifier,
            raw_content,
        }
    }

    /// A URL submission; the URL text is both identifier and display name.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Url, url, None)
    }

    /// A file submission with content; the identifier is the SHA-256 of `content`.
    #[must_use]
    pub fn file(display_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            kind: ResourceKind::File,
            identifier: sha256_hex(&content),
            raw_content: Some(content),
            display_name: display_name.into(),
        }
    }

    /// A file known only by its hash.
    #[must_use]
    pub fn file_hash(display_name: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::File,
            identifier: sha256.into().trim().to_ascii_lowercase(),
            raw_content: None,
            display_name: display_name.into(),
        }
    }

    /// Overrides the human readable name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// URL text or content hash.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Submitted bytes, when available.
    #[must_use]
    pub fn raw_content(&self) -> Option<&[u8]> {
        self.raw_content.as_deref()
    }

    /// Name shown to people and scored by the file heuristics.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Final risk level. `Unknown` sorts lowest: it means "no evidence", never "safe".
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// No usable evidence.
    #[default]
    Unknown,
    /// Low risk.
    Low,
    /// Medium risk.
    Medium,
    /// High risk.
    High,
    /// Critical risk.
    Critical,
}

impl RiskLevel {
    /// Every level, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Unknown,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Critical,
    ];

    /// Uppercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why an engine produced no usable result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request or polling budget exhausted.
    Timeout,
    /// The source asked us to slow down.
    RateLimited,
    /// Network failure, bad status or missing credentials.
    Unreachable,
    /// Response could not be decoded or failed validation.
    MalformedResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::Unreachable => "unreachable",
            Self::MalformedResponse => "malformed response",
        })
    }
}

/// Normalized answer of one reputation source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineResult {
    /// Source name, e.g. `reputation`.
    pub source_name: String,
    /// Engines of this source that flagged the resource.
    pub positives: u32,
    /// Engines of this source that were consulted.
    pub total: u32,
    /// Whether the source considers the resource malicious.
    pub detected: bool,
    /// Short human readable status.
    pub status_text: String,
    /// Link to the source's report, empty when none.
    pub reference_link: String,
    /// Source-side scan timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<String>,
    /// Failure tag; when set the counts are zero and the result is not scored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl EngineResult {
    /// A completed lookup with engine counts.
    #[must_use]
    pub fn success(source_name: impl Into<String>, positives: u32, total: u32) -> Self {
        let total = total.max(positives);
        Self {
            source_name: source_name.into(),
            positives,
            total,
            detected: positives > 0,
            status_text: format!("{positives}/{total} engines flagged the resource"),
            reference_link: String::new(),
            scanned_at: None,
            error: None,
        }
    }

    /// A completed binary lookup (listed or not) without an engine population.
    #[must_use]
    pub fn listing(source_name: impl Into<String>, detected: bool, status_text: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            positives: 0,
            total: 0,
            detected,
            status_text: status_text.into(),
            reference_link: String::new(),
            scanned_at: None,
            error: None,
        }
    }

    /// A failed lookup.
    #[must_use]
    pub fn failure(source_name: impl Into<String>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            positives: 0,
            total: 0,
            detected: false,
            status_text: detail.into(),
            reference_link: String::new(),
            scanned_at: None,
            error: Some(kind),
        }
    }

    /// Sets the report link.
    #[must_use]
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.reference_link = link.into();
        self
    }

    /// Sets the source scan time.
    #[must_use]
    pub fn with_scanned_at(mut self, scanned_at: Option<String>) -> Self {
        self.scanned_at = scanned_at.filter(|value| !value.is_empty());
        self
    }

    /// Overrides the status text.
    #[must_use]
    pub fn with_status(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// True when the result carries an error tag.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// `positives / total`, `0.0` for an empty population, `None` for failures.
    #[must_use]
    pub fn detection_rate(&self) -> Option<f64> {
        if self.error.is_some() {
            return None;
        }
        if self.total == 0 {
            Some(0.0)
        } else {
            Some(f64::from(self.positives) / f64::from(self.total))
        }
    }
}

/// Outcome of the local rule-based scorer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeuristicResult {
    /// `risk_band != Low`.
    pub alert: bool,
    /// Band derived from the point total (never `Unknown`).
    pub risk_band: RiskLevel,
    /// Human readable description of each rule that fired, in rule order.
    pub matched_patterns: Vec<String>,
    /// Point total.
    pub points: f64,
}

impl HeuristicResult {
    /// A result with no rule matches.
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            alert: false,
            risk_band: RiskLevel::Low,
            matched_patterns: Vec::new(),
            points: 0.0,
        }
    }
}

/// Failed engine retained for auditing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineFailure {
    /// Source name.
    pub source_name: String,
    /// Failure tag.
    pub error: ErrorKind,
    /// Detail text reported by the adapter.
    pub detail: String,
}

/// Where the explanation text came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    /// Not explained yet.
    #[default]
    Pending,
    /// Generative text service.
    Generated,
    /// Deterministic template table.
    Template,
    /// Fixed text of a short-circuit verdict.
    Fixed,
}

/// Single verdict returned for a request and stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedVerdict {
    /// Final level.
    pub risk_level: RiskLevel,
    /// Highest detection rate among successful engines.
    pub max_detection_rate: f64,
    /// Successful engine results, sorted by source name.
    pub engines: Vec<EngineResult>,
    /// Plain-language explanation.
    pub explanation: String,
    /// Recommended action.
    pub recommendation: String,
    /// Engines discarded because they failed.
    #[serde(default)]
    pub failures: Vec<EngineFailure>,
    /// Heuristic input, absent for short-circuit verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristic: Option<HeuristicResult>,
    /// Set when content could not be analyzed (encrypted archive).
    #[serde(default)]
    pub restricted: bool,
    /// Origin of the explanation text.
    #[serde(default)]
    pub explanation_source: ExplanationSource,
}

impl AggregatedVerdict {
    /// Sum of engine populations across successful sources.
    #[must_use]
    pub fn total_engines(&self) -> u32 {
        self.engines.iter().map(|engine| engine.total).sum()
    }

    /// Sum of positives across successful sources.
    #[must_use]
    pub fn total_positives(&self) -> u32 {
        self.engines.iter().map(|engine| engine.positives).sum()
    }

    /// Copy with explanation fields filled in.
    #[must_use]
    pub fn explained(mut self, explanation: crate::explainer::Explanation) -> Self {
        self.explanation = explanation.explanation;
        self.recommendation = explanation.recommendation;
        self.explanation_source = explanation.source;
        self
    }
}
