//! Query catalog: the closed set of allow-listed aggregate queries.
//!
//! RULE: QueryKind is the catalog. Adding a query means adding a
//! variant here and a matching entry in data/catalog/query_catalog.json;
//! nothing registers queries at runtime.
//!
//! Every query is a distinct-subject count over one grouping, so the
//! sensitivity of each released statistic is 1.

use crate::{
    error::{EngineError, EngineResult},
    record::{RecordKind, SentimentBand, SourceRecord},
};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Ordered group key: column name → value.
pub type GroupKey = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    CaseDistribution,
    SeverityTrend,
    RiskFlagSummary,
    TopicFrequency,
    SentimentDistribution,
    EngagementVolume,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    DateRange,
    Severity,
}

impl QueryKind {
    /// Catalog order. Listing order is part of the contract.
    pub const ALL: [QueryKind; 6] = [
        Self::CaseDistribution,
        Self::SeverityTrend,
        Self::RiskFlagSummary,
        Self::TopicFrequency,
        Self::SentimentDistribution,
        Self::EngagementVolume,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::CaseDistribution      => "case_distribution",
            Self::SeverityTrend         => "severity_trend",
            Self::RiskFlagSummary       => "risk_flag_summary",
            Self::TopicFrequency        => "topic_frequency",
            Self::SentimentDistribution => "sentiment_distribution",
            Self::EngagementVolume      => "engagement_volume",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn default_label(&self) -> &'static str {
        match self {
            Self::CaseDistribution      => "Case distribution by severity",
            Self::SeverityTrend         => "Weekly severity trend",
            Self::RiskFlagSummary       => "High-risk flag summary",
            Self::TopicFrequency        => "Conversation topic frequency",
            Self::SentimentDistribution => "Conversation sentiment bands",
            Self::EngagementVolume      => "Monthly engagement volume",
        }
    }

    pub fn accepted_filters(&self) -> &'static [FilterField] {
        match self {
            Self::CaseDistribution      => &[FilterField::DateRange],
            Self::SeverityTrend         => &[FilterField::DateRange, FilterField::Severity],
            Self::RiskFlagSummary       => &[FilterField::DateRange, FilterField::Severity],
            Self::TopicFrequency        => &[FilterField::DateRange],
            Self::SentimentDistribution => &[FilterField::DateRange],
            Self::EngagementVolume      => &[FilterField::DateRange, FilterField::Severity],
        }
    }

    pub fn aggregation_template(&self) -> &'static str {
        match self {
            Self::CaseDistribution      => "count distinct subject by severity over assessments",
            Self::SeverityTrend         => "count distinct subject by iso_week, severity over assessments",
            Self::RiskFlagSummary       => "count distinct subject by risk_level over assessments",
            Self::TopicFrequency        => "count distinct subject by topic over conversations",
            Self::SentimentDistribution => "count distinct subject by sentiment_band over conversations",
            Self::EngagementVolume      => "count distinct subject by month, kind over all records",
        }
    }

    pub fn default_epsilon_cost(&self) -> f64 {
        match self {
            Self::SeverityTrend  => 0.10,
            Self::TopicFrequency => 0.08,
            _ => 0.05,
        }
    }

    pub fn default_delta_cost(&self) -> f64 {
        1e-6
    }

    /// Which records the query reads. None reads every kind.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self {
            Self::CaseDistribution | Self::SeverityTrend | Self::RiskFlagSummary => {
                Some(RecordKind::Assessment)
            }
            Self::TopicFrequency | Self::SentimentDistribution => Some(RecordKind::Conversation),
            Self::EngagementVolume => None,
        }
    }

    /// The group a record falls into, or None if the query ignores it.
    pub fn group_key(&self, record: &SourceRecord) -> Option<GroupKey> {
        if let Some(kind) = self.record_kind() {
            if record.kind != kind {
                return None;
            }
        }
        let mut key = GroupKey::new();
        match self {
            Self::CaseDistribution => {
                key.insert("severity", record.severity.as_str().to_string());
            }
            Self::SeverityTrend => {
                let week = record.occurred_on.iso_week();
                key.insert("week", format!("{}-W{:02}", week.year(), week.week()));
                key.insert("severity", record.severity.as_str().to_string());
            }
            Self::RiskFlagSummary => {
                key.insert("risk_level", record.risk_level.as_str().to_string());
            }
            Self::TopicFrequency => {
                let topic = record.topic.as_ref()?.trim();
                if topic.is_empty() {
                    return None;
                }
                key.insert("topic", topic.to_lowercase());
            }
            Self::SentimentDistribution => {
                key.insert(
                    "sentiment_band",
                    SentimentBand::from_score(record.sentiment).as_str().to_string(),
                );
            }
            Self::EngagementVolume => {
                key.insert("month", record.occurred_on.format("%Y-%m").to_string());
                key.insert("kind", record.kind.as_str().to_string());
            }
        }
        Some(key)
    }
}

/// Per-query cost and label overrides, as read from the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntryConfig {
    pub name:         String,
    pub label:        String,
    pub epsilon_cost: f64,
    pub delta_cost:   f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowListedQuery {
    pub kind:                 QueryKind,
    pub name:                 &'static str,
    pub label:                String,
    pub accepted_filters:     Vec<FilterField>,
    pub aggregation_template: &'static str,
    pub epsilon_cost:         f64,
    pub delta_cost:           f64,
}

impl AllowListedQuery {
    fn standard(kind: QueryKind) -> Self {
        Self {
            kind,
            name: kind.name(),
            label: kind.default_label().to_string(),
            accepted_filters: kind.accepted_filters().to_vec(),
            aggregation_template: kind.aggregation_template(),
            epsilon_cost: kind.default_epsilon_cost(),
            delta_cost: kind.default_delta_cost(),
        }
    }

    pub fn accepts(&self, field: FilterField) -> bool {
        self.accepted_filters.contains(&field)
    }
}

/// Immutable after construction. Entries are stored in `QueryKind::ALL` order.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    entries: Vec<AllowListedQuery>,
}

impl QueryCatalog {
    /// The built-in catalog with default costs.
    pub fn standard() -> Self {
        Self {
            entries: QueryKind::ALL.iter().map(|k| AllowListedQuery::standard(*k)).collect(),
        }
    }

    /// Build from configured overrides. The file must name every catalog
    /// query exactly once and nothing else.
    pub fn from_config(configs: &[CatalogEntryConfig]) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        let mut by_kind: BTreeMap<QueryKind, &CatalogEntryConfig> = BTreeMap::new();
        for cfg in configs {
            let kind = QueryKind::parse(&cfg.name)
                .ok_or_else(|| anyhow::anyhow!("Catalog names unknown query '{}'", cfg.name))?;
            if !seen.insert(kind) {
                anyhow::bail!("Catalog lists '{}' more than once", cfg.name);
            }
            if !cfg.epsilon_cost.is_finite() || cfg.epsilon_cost <= 0.0 {
                anyhow::bail!("'{}' has invalid epsilon_cost {}", cfg.name, cfg.epsilon_cost);
            }
            if !cfg.delta_cost.is_finite() || cfg.delta_cost < 0.0 {
                anyhow::bail!("'{}' has invalid delta_cost {}", cfg.name, cfg.delta_cost);
            }
            by_kind.insert(kind, cfg);
        }

        let mut entries = Vec::with_capacity(QueryKind::ALL.len());
        for kind in QueryKind::ALL {
            let cfg = by_kind
                .get(&kind)
                .ok_or_else(|| anyhow::anyhow!("Catalog is missing '{}'", kind.name()))?;
            let mut entry = AllowListedQuery::standard(kind);
            entry.label = cfg.label.clone();
            entry.epsilon_cost = cfg.epsilon_cost;
            entry.delta_cost = cfg.delta_cost;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Resolve a caller-supplied name. Touches nothing but the catalog.
    pub fn lookup(&self, name: &str) -> EngineResult<&AllowListedQuery> {
        QueryKind::parse(name)
            .map(|kind| self.get(kind))
            .ok_or_else(|| EngineError::UnknownQuery { name: name.to_string() })
    }

    pub fn get(&self, kind: QueryKind) -> &AllowListedQuery {
        // Entries are built in ALL order, one per variant.
        &self.entries[kind as usize]
    }

    pub fn entries(&self) -> &[AllowListedQuery] {
        &self.entries
    }
}

impl Default for QueryCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
