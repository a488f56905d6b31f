//! Confidence evaluation.
//!
//! [`evaluate`] maps the match-quality signals of one item onto a confidence
//! tier plus a human-readable reason. Rules are checked top to bottom and the
//! first match wins. The function is pure: no clock, no I/O, no randomness.

use crate::config::Thresholds;
use crate::models::{Confidence, MatchSignals, MatchType};
use serde::{Deserialize, Serialize};

/// Heuristic named when the provider did not say how it picked a candidate.
pub const DEFAULT_HEURISTIC: &str = "most-popular";

/// Evaluator output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub confidence: Confidence,
    pub reasoning: String,
}

impl Assessment {
    fn new(confidence: Confidence, reasoning: impl Into<String>) -> Self {
        Self {
            confidence,
            reasoning: reasoning.into(),
        }
    }
}

fn heuristic(signals: &MatchSignals) -> &str {
    signals.heuristic.as_deref().unwrap_or(DEFAULT_HEURISTIC)
}

/// Assign a confidence tier to one item's match signals.
pub fn evaluate(signals: &MatchSignals, thresholds: &Thresholds) -> Assessment {
    let matched = signals.match_type != MatchType::None;
    let catalog = signals
        .catalog_id
        .as_deref()
        .map(|id| format!(" {}", id))
        .unwrap_or_default();

    // 1. exact catalog id, unambiguous
    if signals.match_type == MatchType::ExactId && signals.candidate_count <= 1 {
        return Assessment::new(
            Confidence::High,
            format!("exact catalog id match{}", catalog),
        );
    }

    if matched {
        if let Some(score) = signals.score {
            // 2. strong fuzzy match
            if score >= thresholds.high {
                return Assessment::new(
                    Confidence::High,
                    format!("fuzzy match score {:.3} >= {:.2}", score, thresholds.high),
                );
            }
            // 3. plausible fuzzy match
            if score >= thresholds.medium {
                return Assessment::new(
                    Confidence::Medium,
                    format!(
                        "fuzzy match score {:.3} in [{:.2}, {:.2}), selected by {}",
                        score,
                        thresholds.medium,
                        thresholds.high,
                        heuristic(signals)
                    ),
                );
            }
        }
    }

    // 4. ambiguous candidates without a tie-break
    if signals.candidate_count > 1 && signals.tie_break.is_none() {
        return Assessment::new(
            Confidence::Medium,
            format!(
                "{} equally plausible candidates, picked by {}",
                signals.candidate_count,
                heuristic(signals)
            ),
        );
    }

    let no_candidates = !matched || signals.candidate_count == 0;
    if no_candidates {
        // 5. filename parse succeeded
        if signals.filename_parsed {
            return Assessment::new(
                Confidence::Low,
                "no catalog candidates; structured filename parse only",
            );
        }
        // 6. nothing usable
        let default_stage = if signals.provider_reachable {
            "filename parse"
        } else {
            "provider lookup"
        };
        let stage = signals.failed_stage.as_deref().unwrap_or(default_stage);
        let reachability = if signals.provider_reachable {
            ""
        } else {
            " (provider unreachable after retries)"
        };
        return Assessment::new(
            Confidence::Low,
            format!("no candidates; failed at {}{}", stage, reachability),
        );
    }

    // 7. candidates exist but none scored well enough
    let score = signals
        .score
        .map(|s| format!("{:.3}", s))
        .unwrap_or_else(|| "none".to_string());
    let failed = signals
        .failed_stage
        .as_deref()
        .map(|stage| format!("; failed at {}", stage))
        .unwrap_or_default();
    Assessment::new(
        Confidence::Low,
        format!(
            "best candidate score {} below {:.2}{}",
            score, thresholds.medium, failed
        ),
    )
}
