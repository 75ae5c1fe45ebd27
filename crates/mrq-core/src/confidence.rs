//! Canonical 0-100 confidence scale.
//!
//! The matching engine reports scores as plain numbers, tier labels or
//! breakdown objects. Everything downstream (tier filters, sorting, the
//! review UI) reads them through [`normalize`] so that a tier label and a
//! numeric score land on the same axis.

use serde::{Deserialize, Serialize};

use crate::{Score, ScoreTier};

/// Fixed tier midpoints. Not configurable: tier and numeric scores must stay
/// comparable in a single sort.
pub const TIER_HIGH_SCORE: f64 = 85.0;
pub const TIER_MEDIUM_SCORE: f64 = 70.0;
pub const TIER_LOW_SCORE: f64 = 50.0;

/// Inclusive lower bound of the high filter bucket.
pub const HIGH_BUCKET_FLOOR: f64 = 90.0;
/// Inclusive lower bound of the medium filter bucket.
pub const MEDIUM_BUCKET_FLOOR: f64 = 70.0;

impl ScoreTier {
    pub fn midpoint(&self) -> f64 {
        match self {
            ScoreTier::High => TIER_HIGH_SCORE,
            ScoreTier::Medium => TIER_MEDIUM_SCORE,
            ScoreTier::Low => TIER_LOW_SCORE,
        }
    }
}

/// Maps any score shape onto [0, 100]. Total: never panics, never errors,
/// missing scores are 0.
pub fn normalize(score: Option<&Score>) -> f64 {
    let value = match score {
        None => return 0.0,
        Some(Score::Tier(tier)) => tier.midpoint(),
        Some(Score::Breakdown { total }) => total.round(),
        Some(Score::Numeric(n)) => {
            // sub-1 values are fractions from engines that report 0..1
            let n = if (0.0..1.0).contains(n) { n * 100.0 } else { *n };
            round_one_decimal(n)
        }
    };
    clamp_percent(value)
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Filter buckets over the normalized score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn classify(score: f64) -> Self {
        if score >= HIGH_BUCKET_FLOOR {
            ConfidenceTier::High
        } else if score >= MEDIUM_BUCKET_FLOOR {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
        }
    }
}

impl std::str::FromStr for ConfidenceTier {
    type Err = crate::ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(ConfidenceTier::High),
            "medium" => Ok(ConfidenceTier::Medium),
            "low" => Ok(ConfidenceTier::Low),
            _ => Err(crate::ParseLabelError {
                kind: "confidence tier",
                value: s.to_string(),
            }),
        }
    }
}
