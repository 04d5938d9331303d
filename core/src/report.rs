//! Insights reports: aggregate snapshots composed from noisy catalog results.
//!
//! A report never reads raw records. It is built only from what the
//! executor released, so it inherits the release's k-anonymity and noise.
//! The section queries share one budget hold, so a report is charged in
//! full or not at all.

use crate::{
    catalog::QueryKind,
    config::ReportConfig,
    error::{EngineError, EngineResult},
    executor::{QueryAuditEntry, QueryExecutor, QueryRequest, ReleasedRow},
    ledger::{BudgetPeriod, Reservation},
    record::{RiskLevel, SentimentBand},
    types::ReportId,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Weekly,
    Monthly,
    AdHoc,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly  => "weekly",
            Self::Monthly => "monthly",
            Self::AdHoc   => "ad_hoc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly"  => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "ad_hoc"  => Some(Self::AdHoc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentData {
    /// Count-weighted mean of sentiment band midpoints.
    pub avg_sentiment: Option<f64>,
    /// Count-weighted mean of risk level scores.
    pub avg_risk: Option<f64>,
    pub severity_distribution: BTreeMap<String, u64>,
    pub detected_patterns: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendingTopic {
    pub topic: String,
    pub mentions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsReport {
    pub id: ReportId,
    pub report_type: ReportType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub sentiment_data: SentimentData,
    pub trending_topics: Vec<TrendingTopic>,
    pub assessment_count: u64,
    pub high_risk_count: u64,
}

impl InsightsReport {
    pub fn new_id() -> ReportId {
        uuid::Uuid::new_v4().to_string()
    }
}

pub const PATTERN_ELEVATED_HIGH_RISK: &str = "elevated_high_risk_share";
pub const PATTERN_NEGATIVE_SENTIMENT: &str = "negative_sentiment_dominant";
pub const PATTERN_CRITICAL_CASES: &str = "critical_cases_present";

fn recommendation_for(pattern: &str) -> &'static str {
    match pattern {
        PATTERN_ELEVATED_HIGH_RISK => "Review staffing for high-risk case follow-up",
        PATTERN_NEGATIVE_SENTIMENT => "Audit recent conversation flows for negative experiences",
        PATTERN_CRITICAL_CASES => "Confirm escalation coverage for critical cases",
        _ => "Review the period's insights",
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Count-weighted mean; None when the weights sum to zero.
fn weighted_mean(pairs: impl Iterator<Item = (f64, u64)>) -> Option<f64> {
    let (sum, weight) = pairs.fold((0.0, 0u64), |(s, w), (v, c)| (s + v * c as f64, w + c));
    (weight > 0).then(|| round4(sum / weight as f64))
}

/// Section queries in report order: severity, risk, topics, sentiment.
const REPORT_SECTIONS: [QueryKind; 4] = [
    QueryKind::CaseDistribution,
    QueryKind::RiskFlagSummary,
    QueryKind::TopicFrequency,
    QueryKind::SentimentDistribution,
];

pub struct ReportGenerator {
    executor: Arc<QueryExecutor>,
    config: ReportConfig,
}

impl ReportGenerator {
    pub fn new(executor: Arc<QueryExecutor>, config: ReportConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Role used for scheduled generation.
    pub fn generator_role(&self) -> &str {
        &self.config.generator_role
    }

    /// Run the section queries for [start, end] as `requester_role`,
    /// then compose and persist one report.
    ///
    /// The combined cost of every section is held on the ledger up front.
    /// Sections draw from that hold, and the draws are only committed once
    /// the report is stored. Any abort returns the whole hold.
    ///
    /// A section with insufficient data is left empty. If every section is
    /// empty for that reason the first such error is returned and nothing is
    /// stored. Any other failure aborts generation.
    pub fn generate(
        &self,
        report_type: ReportType,
        period_start: NaiveDate,
        period_end: NaiveDate,
        requester_role: &str,
    ) -> EngineResult<InsightsReport> {
        if period_start > period_end {
            return Err(EngineError::InvalidFilter {
                query: "insights_report".into(),
                reason: format!("period_start {period_start} is after period_end {period_end}"),
            });
        }

        let (epsilon, delta) = self.report_cost()?;
        let ledger = self.executor.ledger();
        ledger.roll_over(BudgetPeriod::containing(self.executor.clock().today()));
        let mut hold = ledger.reserve(epsilon, delta)?;
        let mut audit = Vec::with_capacity(REPORT_SECTIONS.len());

        let result = self.build_within(
            &mut hold,
            &mut audit,
            report_type,
            period_start,
            period_end,
            requester_role,
        );

        match result {
            Ok(report) => {
                hold.commit_drawn();
                for entry in &audit {
                    self.executor.append_audit(entry);
                }
                log::info!(
                    "{} report {} stored for {period_start}..{period_end}",
                    report_type.as_str(),
                    report.id
                );
                Ok(report)
            }
            Err(e) => {
                hold.rollback();
                // Released sections were never published; their charge went back.
                for mut entry in audit {
                    if entry.success {
                        entry.success = false;
                        entry.error_kind = Some(e.kind().to_string());
                        entry.epsilon_charged = 0.0;
                        entry.delta_charged = 0.0;
                    }
                    self.executor.append_audit(&entry);
                }
                Err(e)
            }
        }
    }

    /// Summed (epsilon, delta) of every section query.
    pub fn report_cost(&self) -> EngineResult<(f64, f64)> {
        REPORT_SECTIONS.iter().try_fold((0.0, 0.0), |(eps, delta), kind| {
            let query = self.executor.catalog().lookup(kind.name())?;
            Ok((eps + query.epsilon_cost, delta + query.delta_cost))
        })
    }

    fn build_within(
        &self,
        hold: &mut Reservation<'_>,
        audit: &mut Vec<QueryAuditEntry>,
        report_type: ReportType,
        period_start: NaiveDate,
        period_end: NaiveDate,
        requester_role: &str,
    ) -> EngineResult<InsightsReport> {
        let mut first_gap: Option<EngineError> = None;
        let mut sections: Vec<Vec<ReleasedRow>> = Vec::with_capacity(REPORT_SECTIONS.len());

        for kind in REPORT_SECTIONS {
            let request = QueryRequest::new(kind.name(), requester_role)
                .with_date_range(period_start, period_end);
            let (outcome, entry) = self.executor.execute_within(&request, hold);
            audit.push(entry);
            match outcome.error {
                None => sections.push(outcome.response.result.data),
                Some(e) if e.is_insufficient_data() => {
                    log::info!("report section {} left empty: {e}", kind.name());
                    first_gap.get_or_insert(e);
                    sections.push(Vec::new());
                }
                Some(e) => return Err(e),
            }
        }

        if let Some(e) = first_gap {
            if sections.iter().all(Vec::is_empty) {
                return Err(e);
            }
        }

        let report = self.compose(
            report_type,
            period_start,
            period_end,
            &sections[0],
            &sections[1],
            &sections[2],
            &sections[3],
        );
        self.executor.store().create_report(&report)?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn compose(
        &self,
        report_type: ReportType,
        period_start: NaiveDate,
        period_end: NaiveDate,
        severity_rows: &[ReleasedRow],
        risk_rows: &[ReleasedRow],
        topic_rows: &[ReleasedRow],
        sentiment_rows: &[ReleasedRow],
    ) -> InsightsReport {
        let severity_distribution: BTreeMap<String, u64> = severity_rows
            .iter()
            .filter_map(|r| Some((r.get("severity")?.to_string(), r.count)))
            .collect();
        let assessment_count: u64 = severity_distribution.values().sum();

        let risks: Vec<(RiskLevel, u64)> = risk_rows
            .iter()
            .filter_map(|r| Some((RiskLevel::parse(r.get("risk_level")?)?, r.count)))
            .collect();
        let risk_total: u64 = risks.iter().map(|(_, c)| c).sum();
        let high_risk_count: u64 = risks
            .iter()
            .filter(|(level, _)| level.is_high_risk())
            .map(|(_, c)| c)
            .sum();
        let avg_risk = weighted_mean(risks.iter().map(|(level, c)| (level.score(), *c)));

        let bands: Vec<(SentimentBand, u64)> = sentiment_rows
            .iter()
            .filter_map(|r| Some((SentimentBand::parse(r.get("sentiment_band")?)?, r.count)))
            .collect();
        let avg_sentiment = weighted_mean(bands.iter().map(|(band, c)| (band.midpoint(), *c)));

        let mut trending_topics: Vec<TrendingTopic> = topic_rows
            .iter()
            .filter_map(|r| {
                Some(TrendingTopic {
                    topic: r.get("topic")?.to_string(),
                    mentions: r.count,
                })
            })
            .collect();
        trending_topics.sort_by(|a, b| b.mentions.cmp(&a.mentions).then_with(|| a.topic.cmp(&b.topic)));
        trending_topics.truncate(self.config.trending_topic_limit);

        let mut detected_patterns = Vec::new();
        if risk_total > 0
            && high_risk_count as f64 / risk_total as f64 >= self.config.high_risk_share_warning
        {
            detected_patterns.push(PATTERN_ELEVATED_HIGH_RISK.to_string());
        }
        let band_count = |wanted: SentimentBand| {
            bands.iter().filter(|(b, _)| *b == wanted).map(|(_, c)| *c).sum::<u64>()
        };
        let negative = band_count(SentimentBand::Negative);
        if negative > 0
            && negative > band_count(SentimentBand::Neutral)
            && negative > band_count(SentimentBand::Positive)
        {
            detected_patterns.push(PATTERN_NEGATIVE_SENTIMENT.to_string());
        }
        if severity_distribution.get("critical").copied().unwrap_or(0) > 0 {
            detected_patterns.push(PATTERN_CRITICAL_CASES.to_string());
        }
        let recommendations = detected_patterns
            .iter()
            .map(|p| recommendation_for(p).to_string())
            .collect();

        let summary = {
            let mut s = format!(
                "{} insights for {period_start} to {period_end}: {assessment_count} assessments, \
                 {high_risk_count} high-risk flags",
                report_type.as_str()
            );
            if let Some(top) = trending_topics.first() {
                s.push_str(&format!(", top topic '{}'", top.topic));
            }
            if !detected_patterns.is_empty() {
                s.push_str(&format!(", patterns: {}", detected_patterns.join(", ")));
            }
            s
        };

        InsightsReport {
            id: InsightsReport::new_id(),
            report_type,
            period_start,
            period_end,
            generated_at: self.executor.clock().now(),
            summary,
            sentiment_data: SentimentData {
                avg_sentiment,
                avg_risk,
                severity_distribution,
                detected_patterns,
                recommendations,
            },
            trending_topics,
            assessment_count,
            high_risk_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_type_names_round_trip() {
        for t in [ReportType::Weekly, ReportType::Monthly, ReportType::AdHoc] {
            assert_eq!(ReportType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ReportType::parse("daily"), None);
    }

    #[test]
    fn weighted_mean_ignores_empty_input() {
        assert_eq!(weighted_mean(std::iter::empty()), None);
        assert_eq!(weighted_mean([(0.25, 3), (1.0, 1)].into_iter()), Some(0.4375));
    }
}
