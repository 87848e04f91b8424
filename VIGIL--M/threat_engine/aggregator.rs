//! Pure combination of engine results and the heuristic into one verdict.

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::{
    explainer,
    model::{
        AggregatedVerdict, EngineFailure, EngineResult, ExplanationSource, HeuristicResult,
        ResourceKind, RiskLevel,
    },
};

/// Detection-rate cutoffs. A rate strictly above a cutoff reaches that band.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// Rate above which the verdict is critical.
    pub critical: f64,
    /// Rate above which the verdict is high.
    pub high: f64,
    /// Rate above which the verdict is medium.
    pub medium: f64,
    /// Floor applied when a binary source (no engine population) lists the resource.
    pub blocklist_floor: RiskLevel,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical: 0.70,
            high: 0.30,
            medium: 0.05,
            blocklist_floor: RiskLevel::Critical,
        }
    }
}

impl Thresholds {
    /// Requires `1 >= critical > high > medium >= 0`.
    pub fn validate(&self) -> Result<()> {
        let ordered = self.critical > self.high && self.high > self.medium && self.medium >= 0.0;
        if !ordered || self.critical > 1.0 {
            bail!(
                "detection thresholds must satisfy 1 >= critical > high > medium >= 0 \
                 (critical={}, high={}, medium={})",
                self.critical,
                self.high,
                self.medium
            );
        }
        if self.blocklist_floor == RiskLevel::Unknown {
            bail!("blocklist threshold floor cannot be UNKNOWN");
        }
        Ok(())
    }

    /// Band for a detection rate.
    #[must_use]
    pub fn band(&self, rate: f64) -> RiskLevel {
        if rate > self.critical {
            RiskLevel::Critical
        } else if rate > self.high {
            RiskLevel::High
        } else if rate > self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Stateless verdict builder.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    thresholds: Thresholds,
}

impl Aggregator {
    /// Aggregator with custom thresholds.
    #[must_use]
    pub const fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Active thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Combines results into a verdict with empty explanation fields.
    ///
    /// Input order does not matter: engines and failures are sorted by source
    /// name. The heuristic may only raise the level, except when no engine
    /// succeeded, where an alerting heuristic decides on its own.
    #[must_use]
    pub fn aggregate(&self, results: &[EngineResult], heuristic: &HeuristicResult) -> AggregatedVerdict {
        let (mut engines, failed): (Vec<EngineResult>, Vec<EngineResult>) =
            results.iter().cloned().partition(|result| !result.is_failure());
        engines.sort_by(|a, b| a.source_name.cmp(&b.source_name));

        let mut failures: Vec<EngineFailure> = failed
            .into_iter()
            .filter_map(|result| {
                result.error.map(|error| EngineFailure {
                    source_name: result.source_name,
                    error,
                    detail: result.status_text,
                })
            })
            .collect();
        failures.sort_by(|a, b| a.source_name.cmp(&b.source_name));

        let max_detection_rate = engines
            .iter()
            .filter_map(EngineResult::detection_rate)
            .fold(0.0_f64, f64::max);

        let mut risk_level = if engines.is_empty() {
            if heuristic.alert {
                heuristic.risk_band
            } else {
                RiskLevel::Unknown
            }
        } else {
            self.thresholds.band(max_detection_rate)
        };

        let listed = engines
            .iter()
            .any(|engine| engine.detected && engine.total == 0);
        if listed {
            risk_level = risk_level.max(self.thresholds.blocklist_floor);
        }

        if heuristic.risk_band == RiskLevel::Critical {
            risk_level = RiskLevel::Critical;
        }

        AggregatedVerdict {
            risk_level,
            max_detection_rate,
            engines,
            explanation: String::new(),
            recommendation: String::new(),
            failures,
            heuristic: Some(heuristic.clone()),
            restricted: false,
            explanation_source: ExplanationSource::Pending,
        }
    }

    /// Fixed verdict for content that cannot be analyzed (password-protected archive).
    #[must_use]
    pub fn restricted(kind: ResourceKind) -> AggregatedVerdict {
        let text = explainer::restricted_explanation(kind);
        AggregatedVerdict {
            risk_level: RiskLevel::Unknown,
            max_detection_rate: 0.0,
            engines: Vec::new(),
            explanation: text.explanation,
            recommendation: text.recommendation,
            failures: Vec::new(),
            heuristic: None,
            restricted: true,
            explanation_source: text.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorKind;

    fn heuristic(band: RiskLevel) -> HeuristicResult {
        HeuristicResult {
            alert: band != RiskLevel::Low,
            risk_band: band,
            matched_patterns: vec![],
            points: 0.0,
        }
    }

    #[test]
    fn highest_rate_decides() {
        let verdict = Aggregator::default().aggregate(
            &[
                EngineResult::success("reputation", 65, 90),
                EngineResult::listing("blocklist", false, "no match"),
            ],
            &heuristic(RiskLevel::Low),
        );
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
        assert!((verdict.max_detection_rate - 0.7222).abs() < 1e-3);
        assert_eq!(verdict.engines[0].source_name, "blocklist");
    }

    #[test]
    fn bands_follow_thresholds() {
        let aggregator = Aggregator::default();
        let level = |pos, total| {
            aggregator
                .aggregate(&[EngineResult::success("reputation", pos, total)], &heuristic(RiskLevel::Low))
                .risk_level
        };
        assert_eq!(level(0, 90), RiskLevel::Low);
        assert_eq!(level(4, 100), RiskLevel::Low);
        assert_eq!(level(5, 100), RiskLevel::Low);
        assert_eq!(level(6, 100), RiskLevel::Medium);
        assert_eq!(level(31, 100), RiskLevel::High);
        assert_eq!(level(71, 100), RiskLevel::Critical);
    }

    #[test]
    fn raising_positives_never_lowers_level() {
        let aggregator = Aggregator::default();
        let total = 40;
        let mut previous = RiskLevel::Unknown;
        for positives in 0..=total {
            let verdict = aggregator.aggregate(
                &[
                    EngineResult::success("multiscan", positives, total),
                    EngineResult::success("reputation", 2, 70),
                ],
                &heuristic(RiskLevel::Medium),
            );
            assert!(verdict.risk_level >= previous);
            previous = verdict.risk_level;
        }
        assert_eq!(previous, RiskLevel::Critical);
    }

    #[test]
    fn order_does_not_matter() {
        let a = EngineResult::success("reputation", 10, 70);
        let b = EngineResult::failure("multiscan", ErrorKind::Timeout, "slow");
        let c = EngineResult::listing("blocklist", false, "no match");
        let aggregator = Aggregator::default();
        let first = aggregator.aggregate(&[a.clone(), b.clone(), c.clone()], &heuristic(RiskLevel::Low));
        let second = aggregator.aggregate(&[c, b, a], &heuristic(RiskLevel::Low));
        assert_eq!(first, second);
    }

    #[test]
    fn critical_heuristic_escalates() {
        let verdict = Aggregator::default().aggregate(
            &[EngineResult::success("reputation", 0, 70)],
            &heuristic(RiskLevel::Critical),
        );
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn non_critical_heuristic_does_not_override_engines() {
        let verdict = Aggregator::default().aggregate(
            &[EngineResult::success("reputation", 0, 70)],
            &heuristic(RiskLevel::High),
        );
        assert_eq!(verdict.risk_level, RiskLevel::Low);
    }

    #[test]
    fn all_failures_without_alert_is_unknown() {
        let verdict = Aggregator::default().aggregate(
            &[
                EngineResult::failure("reputation", ErrorKind::RateLimited, "204"),
                EngineResult::failure("multiscan", ErrorKind::Unreachable, "connect"),
            ],
            &heuristic(RiskLevel::Low),
        );
        assert_eq!(verdict.risk_level, RiskLevel::Unknown);
        assert!(verdict.engines.is_empty());
        assert_eq!(verdict.failures.len(), 2);
        assert_eq!(verdict.failures[0].source_name, "multiscan");
        assert_eq!(verdict.max_detection_rate, 0.0);
    }

    #[test]
    fn heuristic_alone_decides_without_engines() {
        let verdict = Aggregator::default().aggregate(&[], &heuristic(RiskLevel::High));
        assert_eq!(verdict.risk_level, RiskLevel::High);
    }

    #[test]
    fn blocklist_match_floors_level_without_touching_rate() {
        let verdict = Aggregator::default().aggregate(
            &[
                EngineResult::success("reputation", 1, 90),
                EngineResult::listing("blocklist", true, "SOCIAL_ENGINEERING"),
            ],
            &heuristic(RiskLevel::Low),
        );
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
        assert!(verdict.max_detection_rate < 0.02);

        let softer = Aggregator::new(Thresholds {
            blocklist_floor: RiskLevel::High,
            ..Thresholds::default()
        });
        let verdict = softer.aggregate(
            &[EngineResult::listing("blocklist", true, "MALWARE")],
            &heuristic(RiskLevel::Low),
        );
        assert_eq!(verdict.risk_level, RiskLevel::High);
    }

    #[test]
    fn thresholds_must_be_ordered() {
        assert!(Thresholds::default().validate().is_ok());
        let inverted = Thresholds {
            high: 0.8,
            ..Thresholds::default()
        };
        assert!(inverted.validate().unwrap_err().to_string().contains("threshold"));
    }

    #[test]
    fn restricted_verdict_is_unknown() {
        let verdict = Aggregator::restricted(ResourceKind::File);
        assert_eq!(verdict.risk_level, RiskLevel::Unknown);
        assert!(verdict.restricted);
        assert!(verdict.engines.is_empty());
        assert!(verdict.explanation.contains("restricted"));
        assert_eq!(verdict.explanation_source, ExplanationSource::Fixed);
    }
}
