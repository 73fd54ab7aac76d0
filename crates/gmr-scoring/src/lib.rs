//! Multi-factor compatibility scoring for (organization, opportunity) pairs.

use chrono::NaiveDate;
use gmr_core::{
    ConfidenceTier, MatchReason, MatchingPreference, OpportunityRecord, OrganizationProfile,
    ScoreOutcome, ScoreResult, ScoringMode, SkipReason, SubScores,
};

pub mod config;
pub mod embedding;
pub mod similarity;

pub use config::{ConfigError, ScoringConfig, ScoringWeights};
pub use embedding::{content_hash, EmbeddingError, EmbeddingGenerator, HttpEmbeddingGenerator};
pub use similarity::{
    cosine_similarity, HttpSimilarityProvider, SimilarityError, SimilarityHit, SimilarityProvider,
    StoredVectorSimilarity,
};

pub const CRATE_NAME: &str = "gmr-scoring";

/// Everything the engine looks at for one pair.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub organization: &'a OrganizationProfile,
    pub opportunity: &'a OpportunityRecord,
    pub preference: Option<&'a MatchingPreference>,
    /// Raw similarity in [0, 1]; `None` when no embeddings exist for the pair.
    pub similarity: Option<f64>,
    pub today: NaiveDate,
}

/// Pure scoring function over an injected, validated configuration.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, input: &ScoringInput<'_>) -> ScoreOutcome {
        if let Some(deadline) = input.opportunity.deadline {
            if input.opportunity.is_expired(input.today) {
                return ScoreOutcome::Skipped(SkipReason::Expired { deadline });
            }
        }

        let text = input.opportunity.searchable_text();
        if let Some(pref) = input.preference {
            if let Some(keyword) = excluded_keyword_hit(pref, &text) {
                return ScoreOutcome::Skipped(SkipReason::ExcludedKeyword { keyword });
            }
            if !region_matches(pref, input.opportunity) {
                return ScoreOutcome::Skipped(SkipReason::RegionMismatch {
                    region: input.opportunity.region.clone(),
                });
            }
        }

        let configured = input.preference.is_some_and(MatchingPreference::is_configured);
        match input.similarity {
            Some(similarity) if configured => {
                ScoreOutcome::Scored(self.score_full(input, similarity))
            }
            _ => ScoreOutcome::Scored(self.score_degraded(input, &text)),
        }
    }

    fn score_full(&self, input: &ScoringInput<'_>, similarity: f64) -> ScoreResult {
        let mut reasons = Vec::new();

        let similarity = to_score(similarity.clamp(0.0, 1.0) * 100.0);
        let (category, matched) = self.category_score(input);
        if let Some(category) = matched {
            reasons.push(MatchReason::CategoryMatch { category });
        }
        let (eligibility, eligibility_met) = self.eligibility_score(input);
        if eligibility_met {
            reasons.push(MatchReason::EligibilityMet);
        }
        if similarity >= self.config.high_similarity_percent {
            reasons.push(MatchReason::HighSimilarity { percent: similarity });
        }
        let (timeliness, timeliness_reason) = self.timeliness_score(input);
        reasons.extend(timeliness_reason);
        let (amount, amount_fit) = self.amount_score(input);
        if amount_fit {
            reasons.push(MatchReason::AmountFit);
        }

        let sub_scores = SubScores {
            similarity,
            category,
            eligibility,
            timeliness,
            amount,
        };
        let total_score = self.weighted_total(&sub_scores);
        ScoreResult {
            sub_scores,
            total_score,
            confidence: ConfidenceTier::from_total(total_score),
            mode: ScoringMode::Full,
            reasons,
        }
    }

    /// Base value plus keyword and recency bonuses, capped below the full path.
    fn score_degraded(&self, input: &ScoringInput<'_>, text: &str) -> ScoreResult {
        let policy = &self.config.degraded;
        let mut reasons = Vec::new();

        let keywords = keyword_hits(input, text);
        let keyword_bonus = (keywords.len() as u32 * u32::from(policy.keyword_bonus))
            .min(u32::from(policy.max_keyword_bonus));
        let recent = input.opportunity.posted_at.is_some_and(|posted| {
            let age = (input.today - posted.date_naive()).num_days();
            (0..=policy.recency_days).contains(&age)
        });
        let recency_bonus = if recent { u32::from(policy.recency_bonus) } else { 0 };

        let category = if keywords.is_empty() {
            self.config.category_miss_score
        } else {
            100
        };
        if !keywords.is_empty() {
            reasons.push(MatchReason::KeywordOverlap { keywords });
        }
        if recent {
            reasons.push(MatchReason::RecentlyPosted);
        }
        let (eligibility, _) = self.eligibility_score(input);
        let (timeliness, timeliness_reason) = self.timeliness_score(input);
        reasons.extend(timeliness_reason);
        let (amount, _) = self.amount_score(input);

        let total = (u32::from(policy.base_score) + keyword_bonus + recency_bonus)
            .min(u32::from(policy.max_total))
            .min(100) as u8;

        ScoreResult {
            sub_scores: SubScores {
                similarity: 0,
                category,
                eligibility,
                timeliness,
                amount,
            },
            total_score: total,
            confidence: ConfidenceTier::from_total(total).capped_at(policy.confidence_ceiling),
            mode: ScoringMode::Degraded,
            reasons,
        }
    }

    pub fn weighted_total(&self, s: &SubScores) -> u8 {
        let w = &self.config.weights;
        let total = w.similarity * f64::from(s.similarity)
            + w.category * f64::from(s.category)
            + w.eligibility * f64::from(s.eligibility)
            + w.timeliness * f64::from(s.timeliness)
            + w.amount * f64::from(s.amount);
        to_score(total)
    }

    fn category_score(&self, input: &ScoringInput<'_>) -> (u8, Option<String>) {
        let opp = input.opportunity;
        let targets = [
            opp.category.as_deref(),
            opp.sub_category.as_deref(),
            Some(opp.title.as_str()),
        ]
        .into_iter()
        .flatten()
        .map(str::to_lowercase)
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>();

        let pref_terms = input
            .preference
            .map(|p| p.categories.iter().map(String::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        let terms = pref_terms
            .into_iter()
            .chain(input.organization.declared_terms())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        for term in terms {
            let needle = term.to_lowercase();
            if targets
                .iter()
                .any(|target| target.contains(&needle) || needle.contains(target.as_str()))
            {
                return (100, Some(term.to_string()));
            }
        }
        (self.config.category_miss_score, None)
    }

    fn eligibility_score(&self, input: &ScoringInput<'_>) -> (u8, bool) {
        let policy = &self.config.eligibility;
        let Some(text) = input.opportunity.eligibility_text.as_deref() else {
            return (100, false);
        };
        let required = policy
            .qualification_markers
            .iter()
            .filter(|marker| text.contains(marker.as_str()))
            .collect::<Vec<_>>();
        if required.is_empty() {
            return (100, false);
        }

        let org = input.organization;
        let met = required
            .iter()
            .filter(|marker| {
                org.certifications.iter().any(|c| c.contains(marker.as_str()))
                    || policy.size_rules.iter().any(|rule| {
                        rule.marker == ***marker
                            && org
                                .employee_count
                                .is_some_and(|count| count <= rule.max_employees)
                    })
            })
            .count();

        let partial = f64::from(policy.partial_score);
        let score = partial + (100.0 - partial) * met as f64 / required.len() as f64;
        (to_score(score), met == required.len())
    }

    fn timeliness_score(&self, input: &ScoringInput<'_>) -> (u8, Option<MatchReason>) {
        let curve = &self.config.timeliness;
        if input.opportunity.is_permanent {
            return (curve.permanent_score, Some(MatchReason::PermanentRecruitment));
        }
        let Some(days_left) = input.opportunity.days_until_deadline(input.today) else {
            return (curve.open_ended_score, None);
        };
        let days = days_left.clamp(0, curve.comfortable_days);
        let floor = f64::from(curve.deadline_day_score);
        let score = floor + (100.0 - floor) * days as f64 / curve.comfortable_days as f64;
        let reason = (days_left <= curve.near_deadline_days)
            .then_some(MatchReason::NearDeadline { days_left });
        (to_score(score), reason)
    }

    fn amount_score(&self, input: &ScoringInput<'_>) -> (u8, bool) {
        let policy = &self.config.amount;
        let opp = input.opportunity;
        if opp.min_amount.is_none() && opp.max_amount.is_none() {
            return (policy.unknown_score, false);
        }

        let mut preference_fit = false;
        if let Some(pref) = input.preference.filter(|p| p.has_amount_bounds()) {
            if !ranges_overlap(
                (opp.min_amount, opp.max_amount),
                (pref.min_amount, pref.max_amount),
            ) {
                return (policy.preference_miss_score, false);
            }
            preference_fit = true;
        }

        let Some(scale) = input.organization.annual_revenue else {
            return if preference_fit {
                (policy.in_band_score, true)
            } else {
                (policy.unknown_score, false)
            };
        };

        let low = opp.min_amount.or(opp.max_amount).unwrap_or_default() as f64;
        let high = opp.max_amount.or(opp.min_amount).unwrap_or_default() as f64;
        let scale = scale as f64;
        if scale >= low * policy.band_lower_factor && scale <= high * policy.band_upper_factor {
            (policy.in_band_score, true)
        } else {
            (policy.out_of_band_score, false)
        }
    }
}

fn to_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

fn excluded_keyword_hit(pref: &MatchingPreference, text: &str) -> Option<String> {
    pref.excluded_keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .find(|k| text.contains(&k.to_lowercase()))
        .map(str::to_string)
}

fn region_matches(pref: &MatchingPreference, opp: &OpportunityRecord) -> bool {
    if pref.is_nationwide() || opp.is_nationwide() {
        return true;
    }
    let Some(region) = opp.region.as_deref() else {
        return true;
    };
    pref.regions
        .iter()
        .chain(pref.sub_regions.iter())
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .any(|r| region.contains(r) || r.contains(region.trim()))
}

fn ranges_overlap(a: (Option<i64>, Option<i64>), b: (Option<i64>, Option<i64>)) -> bool {
    let (a_min, a_max) = (a.0.unwrap_or(i64::MIN), a.1.unwrap_or(i64::MAX));
    let (b_min, b_max) = (b.0.unwrap_or(i64::MIN), b.1.unwrap_or(i64::MAX));
    a_min <= b_max && b_min <= a_max
}

fn keyword_hits(input: &ScoringInput<'_>, text: &str) -> Vec<String> {
    let pref_terms = input
        .preference
        .map(|p| p.categories.clone())
        .unwrap_or_default();
    let mut hits: Vec<String> = Vec::new();
    for term in pref_terms
        .iter()
        .map(String::as_str)
        .chain(input.organization.declared_terms())
    {
        let term = term.trim();
        if term.is_empty() || hits.iter().any(|h| h == term) {
            continue;
        }
        if text.contains(&term.to_lowercase()) {
            hits.push(term.to_string());
        }
    }
    hits
}
