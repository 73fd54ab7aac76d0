//! Core domain model for the matching & refresh pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gmr-core";

/// Minimum total score for the `high` tier.
pub const HIGH_CONFIDENCE_THRESHOLD: u8 = 85;
/// Minimum total score for the `medium` tier.
pub const MEDIUM_CONFIDENCE_THRESHOLD: u8 = 70;

/// Region value meaning "no regional restriction".
pub const NATIONWIDE_REGION: &str = "전국";

pub const MAX_PREFERENCE_LIST_LEN: usize = 50;
pub const MAX_FEEDBACK_NOTE_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn from_total(total_score: u8) -> Self {
        if total_score >= HIGH_CONFIDENCE_THRESHOLD {
            Self::High
        } else if total_score >= MEDIUM_CONFIDENCE_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Lower this tier to `ceiling` if it exceeds it.
    pub fn capped_at(self, ceiling: ConfidenceTier) -> Self {
        self.min(ceiling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ParseEnumError::new("confidence tier", other)),
        }
    }
}

/// Which scoring path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    Full,
    Degraded,
}

impl ScoringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Degraded => "degraded",
        }
    }
}

impl FromStr for ScoringMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "degraded" => Ok(Self::Degraded),
            other => Err(ParseEnumError::new("scoring mode", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Per-factor scores, each in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub similarity: u8,
    pub category: u8,
    pub eligibility: u8,
    pub timeliness: u8,
    pub amount: u8,
}

/// Human-readable explanation attached to a scored pair. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchReason {
    HighSimilarity { percent: u8 },
    CategoryMatch { category: String },
    EligibilityMet,
    NearDeadline { days_left: i64 },
    PermanentRecruitment,
    AmountFit,
    KeywordOverlap { keywords: Vec<String> },
    RecentlyPosted,
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighSimilarity { percent } => write!(f, "기업 프로필과 사업 내용 유사도 {percent}%"),
            Self::CategoryMatch { category } => write!(f, "관심 분야 일치: {category}"),
            Self::EligibilityMet => f.write_str("신청 자격 요건 충족"),
            Self::NearDeadline { days_left } => write!(f, "마감 임박 (D-{days_left})"),
            Self::PermanentRecruitment => f.write_str("상시 모집"),
            Self::AmountFit => f.write_str("지원 규모가 기업 규모에 적합"),
            Self::KeywordOverlap { keywords } => write!(f, "키워드 일치: {}", keywords.join(", ")),
            Self::RecentlyPosted => f.write_str("최근 공고"),
        }
    }
}

/// Output of a successful scoring pass for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub sub_scores: SubScores,
    pub total_score: u8,
    pub confidence: ConfidenceTier,
    pub mode: ScoringMode,
    pub reasons: Vec<MatchReason>,
}

impl ScoreResult {
    pub fn reason_texts(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// Why a pair was filtered out instead of scored or stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    ExcludedKeyword { keyword: String },
    RegionMismatch { region: Option<String> },
    Expired { deadline: NaiveDate },
    BelowThreshold { total_score: u8 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExcludedKeyword { keyword } => write!(f, "excluded keyword {keyword:?}"),
            Self::RegionMismatch { region } => {
                write!(f, "region mismatch ({})", region.as_deref().unwrap_or("unspecified"))
            }
            Self::Expired { deadline } => write!(f, "deadline {deadline} passed"),
            Self::BelowThreshold { total_score } => write!(f, "total score {total_score} below store threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoreOutcome {
    Scored(ScoreResult),
    Skipped(SkipReason),
}

/// Matching criteria of one member for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPreference {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub categories: Vec<String>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub regions: Vec<String>,
    pub sub_regions: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatchingPreference {
    /// A preference without categories still makes the organization eligible,
    /// but scoring falls back to the degraded path.
    pub fn is_configured(&self) -> bool {
        !self.categories.is_empty()
    }

    pub fn is_nationwide(&self) -> bool {
        let explicit = self.regions.iter().chain(self.sub_regions.iter());
        let mut any = false;
        for region in explicit {
            any = true;
            if region.trim() == NATIONWIDE_REGION {
                return true;
            }
        }
        !any
    }

    pub fn has_amount_bounds(&self) -> bool {
        self.min_amount.is_some() || self.max_amount.is_some()
    }
}

/// Write payload for a preference, as submitted through the preferences API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreferenceInput {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub min_amount: Option<i64>,
    #[serde(default)]
    pub max_amount: Option<i64>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub sub_regions: Vec<String>,
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one category is required")]
    MissingCategory,
    #[error("{field} must not be negative")]
    NegativeAmount { field: &'static str },
    #[error("min_amount {min} exceeds max_amount {max}")]
    InvertedAmountRange { min: i64, max: i64 },
    #[error("{field} holds more than {max} entries")]
    TooManyEntries { field: &'static str, max: usize },
    #[error("feedback note exceeds {max} characters")]
    NoteTooLong { max: usize },
}

impl PreferenceInput {
    /// Trim, drop blanks and dedupe list fields, then check bounds.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.categories = normalize_terms(self.categories);
        self.regions = normalize_terms(self.regions);
        self.sub_regions = normalize_terms(self.sub_regions);
        self.excluded_keywords = normalize_terms(self.excluded_keywords);

        if self.categories.is_empty() {
            return Err(ValidationError::MissingCategory);
        }
        for (field, list) in [
            ("categories", &self.categories),
            ("regions", &self.regions),
            ("sub_regions", &self.sub_regions),
            ("excluded_keywords", &self.excluded_keywords),
        ] {
            if list.len() > MAX_PREFERENCE_LIST_LEN {
                return Err(ValidationError::TooManyEntries {
                    field,
                    max: MAX_PREFERENCE_LIST_LEN,
                });
            }
        }
        if matches!(self.min_amount, Some(v) if v < 0) {
            return Err(ValidationError::NegativeAmount { field: "min_amount" });
        }
        if matches!(self.max_amount, Some(v) if v < 0) {
            return Err(ValidationError::NegativeAmount { field: "max_amount" });
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(ValidationError::InvertedAmountRange { min, max });
            }
        }
        Ok(self)
    }
}

fn normalize_terms(terms: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(terms.len());
    for term in terms {
        let trimmed = term.trim();
        if trimmed.is_empty() || out.iter().any(|t| t == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Organization profile as read from the product database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrganizationProfile {
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    pub description: Option<String>,
    pub region: Option<String>,
    pub employee_count: Option<i32>,
    pub annual_revenue: Option<i64>,
    pub certifications: Vec<String>,
    pub document_summaries: Vec<String>,
}

impl OrganizationProfile {
    /// Aggregated free text used for similarity search and embeddings.
    pub fn profile_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.name.as_str()];
        if let Some(category) = &self.category {
            parts.push(category);
        }
        parts.extend(self.keywords.iter().map(String::as_str));
        if let Some(description) = &self.description {
            parts.push(description);
        }
        parts.extend(self.document_summaries.iter().map(String::as_str));
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Declared category plus keywords.
    pub fn declared_terms(&self) -> Vec<&str> {
        self.category
            .iter()
            .map(String::as_str)
            .chain(self.keywords.iter().map(String::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Catalog entry. Read-only to this subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub title: String,
    pub organizer: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub eligibility_text: Option<String>,
    pub description: String,
    pub region: Option<String>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub deadline: Option<NaiveDate>,
    pub is_permanent: bool,
    pub posted_at: Option<DateTime<Utc>>,
}

impl OpportunityRecord {
    /// Lowercased concatenation of every text field filters look at.
    pub fn searchable_text(&self) -> String {
        [
            Some(self.title.as_str()),
            self.category.as_deref(),
            self.sub_category.as_deref(),
            self.eligibility_text.as_deref(),
            Some(self.description.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
    }

    pub fn days_until_deadline(&self, today: NaiveDate) -> Option<i64> {
        if self.is_permanent {
            return None;
        }
        self.deadline.map(|d| (d - today).num_days())
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        matches!(self.days_until_deadline(today), Some(days) if days < 0)
    }

    pub fn is_nationwide(&self) -> bool {
        match self.region.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(region) => region == NATIONWIDE_REGION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub relevant: bool,
    pub note: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackInput {
    pub relevant: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl FeedbackInput {
    pub fn into_feedback(self, submitted_at: DateTime<Utc>) -> Result<Feedback, ValidationError> {
        let note = self
            .note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if matches!(&note, Some(n) if n.chars().count() > MAX_FEEDBACK_NOTE_LEN) {
            return Err(ValidationError::NoteTooLong {
                max: MAX_FEEDBACK_NOTE_LEN,
            });
        }
        Ok(Feedback {
            relevant: self.relevant,
            note,
            submitted_at,
        })
    }
}

/// Persisted score for one (organization, opportunity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingResult {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub opportunity_id: Uuid,
    pub user_id: Uuid,
    pub sub_scores: SubScores,
    pub total_score: u8,
    pub confidence: ConfidenceTier,
    pub scoring_mode: ScoringMode,
    pub match_reasons: Vec<String>,
    pub feedback: Option<Feedback>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl MemberRole {
    pub fn can_edit_preferences(&self) -> bool {
        !matches!(self, Self::Viewer)
    }
}

impl FromStr for MemberRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "viewer" => Ok(Self::Viewer),
            other => Err(ParseEnumError::new("member role", other)),
        }
    }
}

/// Per-user digest channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub user_id: Uuid,
    pub notify_results: bool,
    pub email: Option<String>,
    pub email_enabled: bool,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSourceType {
    Organization,
    Opportunity,
}

impl EmbeddingSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Opportunity => "opportunity",
        }
    }
}

impl FromStr for EmbeddingSourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(Self::Organization),
            "opportunity" => Ok(Self::Opportunity),
            other => Err(ParseEnumError::new("embedding source type", other)),
        }
    }
}

/// Stored vector keyed by (source_type, source_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub source_type: EmbeddingSourceType,
    pub source_id: Uuid,
    pub model: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_monotonic_in_total_score() {
        let mut previous = ConfidenceTier::Low;
        for total in 0..=100u8 {
            let tier = ConfidenceTier::from_total(total);
            assert!(tier >= previous, "tier dropped at {total}");
            previous = tier;
        }
        assert_eq!(ConfidenceTier::from_total(84), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_total(85), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_total(69), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_total(70), ConfidenceTier::Medium);
    }

    #[test]
    fn capped_tier_never_exceeds_ceiling() {
        assert_eq!(
            ConfidenceTier::High.capped_at(ConfidenceTier::Medium),
            ConfidenceTier::Medium
        );
        assert_eq!(
            ConfidenceTier::Low.capped_at(ConfidenceTier::Medium),
            ConfidenceTier::Low
        );
    }

    #[test]
    fn preference_input_normalizes_lists() {
        let input = PreferenceInput {
            categories: vec![" 기술 ".into(), "기술".into(), "".into(), "수출".into()],
            excluded_keywords: vec!["해외".into(), "  ".into()],
            ..Default::default()
        }
        .normalized()
        .expect("valid");
        assert_eq!(input.categories, vec!["기술", "수출"]);
        assert_eq!(input.excluded_keywords, vec!["해외"]);
    }

    #[test]
    fn preference_input_rejects_inverted_range() {
        let err = PreferenceInput {
            categories: vec!["기술".into()],
            min_amount: Some(100),
            max_amount: Some(10),
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert_eq!(err, ValidationError::InvertedAmountRange { min: 100, max: 10 });
    }

    #[test]
    fn nationwide_when_regions_empty_or_explicit() {
        let now = Utc::now();
        let mut pref = MatchingPreference {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            categories: vec!["기술".into()],
            min_amount: None,
            max_amount: None,
            regions: vec![],
            sub_regions: vec![],
            excluded_keywords: vec![],
            created_at: now,
            updated_at: now,
        };
        assert!(pref.is_nationwide());
        pref.regions = vec!["서울".into()];
        assert!(!pref.is_nationwide());
        pref.regions.push(NATIONWIDE_REGION.into());
        assert!(pref.is_nationwide());
    }

    #[test]
    fn match_reason_serializes_tagged() {
        let json = serde_json::to_value(MatchReason::NearDeadline { days_left: 3 }).unwrap();
        assert_eq!(json["kind"], "near_deadline");
        assert_eq!(MatchReason::NearDeadline { days_left: 3 }.to_string(), "마감 임박 (D-3)");
    }

    #[test]
    fn permanent_opportunity_never_expires() {
        let opp = OpportunityRecord {
            id: Uuid::new_v4(),
            title: "상시 지원".into(),
            organizer: None,
            category: None,
            sub_category: None,
            eligibility_text: None,
            description: String::new(),
            region: None,
            min_amount: None,
            max_amount: None,
            deadline: NaiveDate::from_ymd_opt(2020, 1, 1),
            is_permanent: true,
            posted_at: None,
        };
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(!opp.is_expired(today));
        assert_eq!(opp.days_until_deadline(today), None);
    }
}
