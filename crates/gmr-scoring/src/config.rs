//! Immutable scoring configuration: factor weights, curves and policies.

use std::path::Path;

use gmr_core::ConfidenceTier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing scoring config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f64 },
    #[error("weight {name} must be within [0, 1], got {value}")]
    WeightRange { name: &'static str, value: f64 },
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub similarity: f64,
    pub category: f64,
    pub eligibility: f64,
    pub timeliness: f64,
    pub amount: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            similarity: 0.35,
            category: 0.20,
            eligibility: 0.20,
            timeliness: 0.15,
            amount: 0.10,
        }
    }
}

impl ScoringWeights {
    fn named(&self) -> [(&'static str, f64); 5] {
        [
            ("similarity", self.similarity),
            ("category", self.category),
            ("eligibility", self.eligibility),
            ("timeliness", self.timeliness),
            ("amount", self.amount),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in self.named() {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::WeightRange { name, value });
            }
        }
        let sum: f64 = self.named().iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

/// Days-until-deadline to score. Monotonic non-decreasing in days left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelinessCurve {
    pub permanent_score: u8,
    pub open_ended_score: u8,
    pub deadline_day_score: u8,
    pub comfortable_days: i64,
    pub near_deadline_days: i64,
}

impl Default for TimelinessCurve {
    fn default() -> Self {
        Self {
            permanent_score: 90,
            open_ended_score: 70,
            deadline_day_score: 20,
            comfortable_days: 21,
            near_deadline_days: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountPolicy {
    pub in_band_score: u8,
    pub out_of_band_score: u8,
    pub unknown_score: u8,
    pub preference_miss_score: u8,
    /// Organization scale may sit this far below the range minimum.
    pub band_lower_factor: f64,
    /// Organization scale may sit this far above the range maximum.
    pub band_upper_factor: f64,
}

impl Default for AmountPolicy {
    fn default() -> Self {
        Self {
            in_band_score: 100,
            out_of_band_score: 30,
            unknown_score: 70,
            preference_miss_score: 20,
            band_lower_factor: 0.1,
            band_upper_factor: 10.0,
        }
    }
}

/// Marker satisfied implicitly by headcount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRule {
    pub marker: String,
    pub max_employees: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    pub qualification_markers: Vec<String>,
    pub size_rules: Vec<SizeRule>,
    pub partial_score: u8,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            qualification_markers: [
                "벤처기업",
                "이노비즈",
                "메인비즈",
                "여성기업",
                "사회적기업",
                "장애인기업",
                "예비창업자",
                "중소기업",
                "소상공인",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            size_rules: vec![
                SizeRule {
                    marker: "중소기업".into(),
                    max_employees: 299,
                },
                SizeRule {
                    marker: "소상공인".into(),
                    max_employees: 9,
                },
            ],
            partial_score: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedPolicy {
    pub base_score: u8,
    pub keyword_bonus: u8,
    pub max_keyword_bonus: u8,
    pub recency_bonus: u8,
    pub recency_days: i64,
    pub max_total: u8,
    pub confidence_ceiling: ConfidenceTier,
}

impl Default for DegradedPolicy {
    fn default() -> Self {
        Self {
            base_score: 50,
            keyword_bonus: 5,
            max_keyword_bonus: 20,
            recency_bonus: 10,
            recency_days: 7,
            max_total: 80,
            confidence_ceiling: ConfidenceTier::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Category score when nothing intersects; uncertainty, not exclusion.
    pub category_miss_score: u8,
    /// Similarity percent at which a similarity reason is attached.
    pub high_similarity_percent: u8,
    pub timeliness: TimelinessCurve,
    pub amount: AmountPolicy,
    pub eligibility: EligibilityPolicy,
    pub degraded: DegradedPolicy,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            category_miss_score: 50,
            high_similarity_percent: 80,
            timeliness: TimelinessCurve::default(),
            amount: AmountPolicy::default(),
            eligibility: EligibilityPolicy::default(),
            degraded: DegradedPolicy::default(),
        }
    }
}

impl ScoringConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        let scores = [
            ("category_miss_score", self.category_miss_score),
            ("high_similarity_percent", self.high_similarity_percent),
            ("timeliness.permanent_score", self.timeliness.permanent_score),
            ("timeliness.open_ended_score", self.timeliness.open_ended_score),
            ("timeliness.deadline_day_score", self.timeliness.deadline_day_score),
            ("amount.in_band_score", self.amount.in_band_score),
            ("amount.out_of_band_score", self.amount.out_of_band_score),
            ("amount.unknown_score", self.amount.unknown_score),
            ("amount.preference_miss_score", self.amount.preference_miss_score),
            ("eligibility.partial_score", self.eligibility.partial_score),
            ("degraded.max_total", self.degraded.max_total),
        ];
        for (field, value) in scores {
            if value > 100 {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("{value} exceeds 100"),
                });
            }
        }
        if self.timeliness.comfortable_days <= 0 {
            return Err(ConfigError::Invalid {
                field: "timeliness.comfortable_days",
                message: "must be positive".into(),
            });
        }
        if self.amount.band_lower_factor <= 0.0
            || self.amount.band_upper_factor < 1.0
            || self.amount.band_lower_factor > 1.0
        {
            return Err(ConfigError::Invalid {
                field: "amount",
                message: "band factors must satisfy 0 < lower <= 1 <= upper".into(),
            });
        }
        Ok(())
    }
}
