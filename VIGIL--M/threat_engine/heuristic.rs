//! Local, network-free classifier scoring URL and file-name structure.
//!
//! The scorer is total: every request yields a [`HeuristicResult`]. It runs on
//! every analysis and acts as an escalation floor when the heuristic band is
//! CRITICAL, or as the only evidence when every reputation source failed.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use crate::model::{AnalysisRequest, HeuristicResult, ResourceKind, RiskLevel};

static IPV4_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("static ipv4 pattern"));

/// Point weights for each rule.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeuristicWeights {
    /// Two or more reputation keywords in the host.
    pub multiple_keywords: f64,
    /// One reputation keyword in an untrusted host.
    pub single_keyword: f64,
    /// Raw IP literal as host.
    pub ip_host: f64,
    /// Typosquatting substitution in the host.
    pub typosquat: f64,
    /// Host longer than the configured limit.
    pub long_domain: f64,
    /// Executable or script extension.
    pub dangerous_extension: f64,
    /// Decoy document extension followed by another extension.
    pub double_extension: f64,
    /// Each social-engineering keyword in a file name.
    pub social_keyword: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            multiple_keywords: 3.0,
            single_keyword: 1.0,
            ip_host: 2.0,
            typosquat: 3.0,
            long_domain: 1.0,
            dangerous_extension: 3.0,
            double_extension: 2.0,
            social_keyword: 0.5,
        }
    }
}

/// Rule tables; every list is matched case-insensitively.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeuristicRules {
    /// Reputation-sensitive words looked up in the host only.
    pub url_keywords: Vec<String>,
    /// Well-known domains (and their subdomains) exempt from the single-keyword rule.
    pub trusted_domains: Vec<String>,
    /// Character-substitution fragments of impersonated brands.
    pub typosquat_fragments: Vec<String>,
    /// Hosts longer than this many characters score.
    pub max_domain_length: usize,
    /// Extensions (without dot) treated as executable content.
    pub dangerous_extensions: Vec<String>,
    /// Extensions used to disguise a second, real extension.
    pub decoy_extensions: Vec<String>,
    /// Lures seen in phishing attachment names.
    pub social_keywords: Vec<String>,
    /// Point weights.
    pub weights: HeuristicWeights,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

impl Default for HeuristicRules {
    fn default() -> Self {
        Self {
            url_keywords: strings(&[
                "login", "signin", "bank", "verify", "update", "account", "secure", "banking",
                "confirm", "wallet", "suspended", "urgent", "password", "unlock", "paypal",
                "amazon",
            ]),
            trusted_domains: strings(&[
                "google.com",
                "microsoft.com",
                "live.com",
                "amazon.com",
                "paypal.com",
                "apple.com",
                "facebook.com",
            ]),
            typosquat_fragments: strings(&[
                "g00gle", "faceb00k", "paypa1", "micros0ft", "appe", "nelfix", "0ffice",
                "hotmai1", "gmai1",
            ]),
            max_domain_length: 50,
            dangerous_extensions: strings(&[
                "exe", "bat", "cmd", "sh", "vbs", "js", "scr", "pif", "application", "gadget",
                "msi", "msp", "com", "hta", "cpl", "msc", "jar",
            ]),
            decoy_extensions: strings(&["pdf", "doc", "docx", "xls", "xlsx", "png", "jpg", "txt"]),
            social_keywords: strings(&[
                "invoice", "receipt", "urgent", "payment", "scan", "img", "factura", "urgente",
                "pago", "documento", "foto", "premio", "ganador", "oferta", "contrato", "nomina",
            ]),
            weights: HeuristicWeights::default(),
        }
    }
}

/// Maps a point total to a band: >=3 critical, >=2 high, >=1 medium, else low.
#[must_use]
pub fn band_for_points(points: f64) -> RiskLevel {
    if points >= 3.0 {
        RiskLevel::Critical
    } else if points >= 2.0 {
        RiskLevel::High
    } else if points >= 1.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Deterministic rule-based scorer.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    rules: HeuristicRules,
}

struct Tally {
    points: f64,
    patterns: Vec<String>,
}

impl Tally {
    const fn new() -> Self {
        Self {
            points: 0.0,
            patterns: Vec::new(),
        }
    }

    fn add(&mut self, weight: f64, pattern: String) {
        self.points += weight;
        self.patterns.push(pattern);
    }

    fn finish(self) -> HeuristicResult {
        let risk_band = band_for_points(self.points);
        HeuristicResult {
            alert: risk_band != RiskLevel::Low,
            risk_band,
            matched_patterns: self.patterns,
            points: self.points,
        }
    }
}

impl HeuristicScorer {
    /// Scorer with custom rule tables.
    #[must_use]
    pub fn new(rules: HeuristicRules) -> Self {
        Self { rules }
    }

    /// Active rules.
    #[must_use]
    pub const fn rules(&self) -> &HeuristicRules {
        &self.rules
    }

    /// Scores a request. Never fails and never performs I/O.
    #[must_use]
    pub fn score(&self, request: &AnalysisRequest) -> HeuristicResult {
        match request.kind() {
            ResourceKind::Url => self.score_url(request.identifier()),
            ResourceKind::File => self.score_file_name(request.display_name()),
        }
    }

    /// Scores URL text using its host component.
    #[must_use]
    pub fn score_url(&self, url: &str) -> HeuristicResult {
        let host = extract_host(url);
        let weights = &self.rules.weights;
        let mut tally = Tally::new();

        let keywords: Vec<&str> = self
            .rules
            .url_keywords
            .iter()
            .map(String::as_str)
            .filter(|keyword| host.contains(&keyword.to_ascii_lowercase()))
            .collect();
        match keywords.len() {
            0 => {}
            1 => {
                if !self.is_trusted(&host) {
                    tally.add(
                        weights.single_keyword,
                        format!("keyword '{}' in untrusted domain", keywords[0]),
                    );
                }
            }
            _ => tally.add(
                weights.multiple_keywords,
                format!("multiple keywords in domain: {}", keywords.join(", ")),
            ),
        }

        if IPV4_HOST.is_match(&host) || host.starts_with('[') {
            tally.add(weights.ip_host, "raw IP address used as host".into());
        }

        let fakes: Vec<&str> = self
            .rules
            .typosquat_fragments
            .iter()
            .map(String::as_str)
            .filter(|fragment| host.contains(&fragment.to_ascii_lowercase()))
            .collect();
        if !fakes.is_empty() {
            tally.add(
                weights.typosquat,
                format!("possible domain impersonation: {}", fakes.join(", ")),
            );
        }

        if host.chars().count() > self.rules.max_domain_length {
            tally.add(
                weights.long_domain,
                format!("unusually long domain ({} characters)", host.chars().count()),
            );
        }

        tally.finish()
    }

    /// Scores a file name (path components are ignored).
    #[must_use]
    pub fn score_file_name(&self, display_name: &str) -> HeuristicResult {
        let name = display_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(display_name)
            .trim()
            .to_ascii_lowercase();
        let weights = &self.rules.weights;
        let mut tally = Tally::new();

        if let Some((stem, extension)) = split_extension(&name) {
            if contains_ignore_case(&self.rules.dangerous_extensions, extension) {
                tally.add(
                    weights.dangerous_extension,
                    format!("executable or script extension '.{extension}'"),
                );
            }
            if let Some((_, decoy)) = split_extension(stem) {
                if contains_ignore_case(&self.rules.decoy_extensions, decoy) {
                    tally.add(
                        weights.double_extension,
                        format!("double extension disguised as '.{decoy}'"),
                    );
                }
            }
        }

        for keyword in &self.rules.social_keywords {
            if name.contains(&keyword.to_ascii_lowercase()) {
                tally.add(
                    weights.social_keyword,
                    format!("social-engineering keyword '{keyword}' in name"),
                );
            }
        }

        tally.finish()
    }

    fn is_trusted(&self, host: &str) -> bool {
        self.rules.trusted_domains.iter().any(|trusted| {
            let trusted = trusted.to_ascii_lowercase();
            host == trusted || host.ends_with(&format!(".{trusted}"))
        })
    }
}

fn contains_ignore_case(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|item| item.eq_ignore_ascii_case(needle))
}

/// Splits `name.ext`; dotfiles and names without an extension yield `None`.
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, extension) = name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        None
    } else {
        Some((stem, extension))
    }
}

/// Lowercased host of `raw`, without port. Scheme-less input is read as `http://`.
#[must_use]
pub fn extract_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if let Some(host) = Url::parse(&candidate)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .filter(|host| !host.is_empty())
    {
        return host;
    }
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> HeuristicScorer {
        HeuristicScorer::default()
    }

    #[test]
    fn trusted_domain_suppresses_single_keyword() {
        let result = scorer().score(&AnalysisRequest::url("https://login.microsoft.com/oauth"));
        assert_eq!(result.risk_band, RiskLevel::Low);
        assert!(!result.alert);
        assert!(result.matched_patterns.is_empty());
    }

    #[test]
    fn lookalike_of_trusted_domain_is_not_trusted() {
        let result = scorer().score_url("https://login.evilmicrosoft.com");
        assert_eq!(result.risk_band, RiskLevel::Medium);
    }

    #[test]
    fn google_home_page_is_low() {
        let result = scorer().score(&AnalysisRequest::url("https://www.google.com"));
        assert_eq!(result.risk_band, RiskLevel::Low);
        assert_eq!(result.points, 0.0);
    }

    #[test]
    fn keywords_in_path_are_ignored() {
        let result = scorer().score_url("https://example.org/login/verify/account");
        assert_eq!(result.risk_band, RiskLevel::Low);
    }

    #[test]
    fn multiple_domain_keywords_are_critical() {
        let result = scorer().score_url("http://secure-login-paypal.example.net/");
        assert_eq!(result.risk_band, RiskLevel::Critical);
        assert!(result.matched_patterns[0].starts_with("multiple keywords"));
    }

    #[test]
    fn single_untrusted_keyword_is_medium() {
        let result = scorer().score_url("wallet-example.io");
        assert_eq!(result.risk_band, RiskLevel::Medium);
        assert!(result.alert);
    }

    #[test]
    fn ip_host_is_high() {
        let result = scorer().score_url("http://192.168.10.5:8080/download");
        assert_eq!(result.risk_band, RiskLevel::High);
        assert_eq!(result.matched_patterns, vec!["raw IP address used as host"]);
    }

    #[test]
    fn typosquat_is_critical() {
        let result = scorer().score_url("https://www.g00gle.com");
        assert_eq!(result.risk_band, RiskLevel::Critical);
    }

    #[test]
    fn long_domain_scores_one_point() {
        let host = format!("{}.example.com", "a".repeat(60));
        let result = scorer().score_url(&format!("https://{host}/"));
        assert_eq!(result.risk_band, RiskLevel::Medium);
    }

    #[test]
    fn double_extension_executable_is_critical() {
        let result = scorer().score(&AnalysisRequest::file_hash("invoice.pdf.exe", "ab"));
        assert_eq!(result.risk_band, RiskLevel::Critical);
        assert!((result.points - 5.5).abs() < f64::EPSILON);
        assert_eq!(result.matched_patterns.len(), 3);
        assert!(result.matched_patterns[0].contains(".exe"));
        assert!(result.matched_patterns[1].contains(".pdf"));
    }

    #[test]
    fn lone_social_keyword_does_not_alert() {
        let result = scorer().score_file_name("C:\\Users\\me\\invoice.pdf");
        assert_eq!(result.risk_band, RiskLevel::Low);
        assert!(!result.alert);
        assert_eq!(result.matched_patterns.len(), 1);
    }

    #[test]
    fn spanish_lure_words_are_keywords() {
        let result = scorer().score_file_name("foto_ganador.jpg.exe");
        assert_eq!(result.risk_band, RiskLevel::Critical);
        let keywords: Vec<&String> = result
            .matched_patterns
            .iter()
            .filter(|pattern| pattern.starts_with("social-engineering keyword"))
            .collect();
        assert_eq!(keywords.len(), 2);
        assert!(keywords[0].contains("'foto'"));
        assert!(keywords[1].contains("'ganador'"));
        assert!((result.points - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dotfiles_have_no_extension() {
        let result = scorer().score_file_name(".bashrc");
        assert_eq!(result.risk_band, RiskLevel::Low);
        assert!(result.matched_patterns.is_empty());
    }

    #[test]
    fn scoring_is_deterministic() {
        let request = AnalysisRequest::url("http://paypa1-account.example/verify");
        assert_eq!(scorer().score(&request), scorer().score(&request));
    }

    #[test]
    fn host_extraction_handles_odd_inputs() {
        assert_eq!(extract_host("HTTPS://WWW.Example.COM:443/a"), "www.example.com");
        assert_eq!(extract_host("example.com/path"), "example.com");
        assert_eq!(extract_host("http://user@10.0.0.1/"), "10.0.0.1");
        assert_eq!(extract_host(""), "");
    }
}
