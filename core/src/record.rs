//! Raw source records as the engine sees them.
//!
//! Records live in the platform's own store. The engine reads them
//! through `source::RecordSource` and never keeps them past one request.

use crate::types::{RecordId, SubjectId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Assessment,
    Conversation,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assessment   => "assessment",
            Self::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assessment"   => Some(Self::Assessment),
            "conversation" => Some(Self::Conversation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Low, Self::Moderate, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low      => "low",
            Self::Moderate => "moderate",
            Self::High     => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low"      => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high"     => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low      => "low",
            Self::Moderate => "moderate",
            Self::High     => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low"      => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high"     => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric weight used for the report's average risk.
    pub fn score(&self) -> f64 {
        match self {
            Self::Low      => 0.25,
            Self::Moderate => 0.50,
            Self::High     => 0.75,
            Self::Critical => 1.00,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SentimentBand {
    Negative,
    Neutral,
    Positive,
}

impl SentimentBand {
    /// Scores in [-1, 1]; the neutral band is (-0.2, 0.2).
    pub fn from_score(score: f64) -> Self {
        if score <= -0.2 {
            Self::Negative
        } else if score >= 0.2 {
            Self::Positive
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negative => "negative",
            Self::Neutral  => "neutral",
            Self::Positive => "positive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "negative" => Some(Self::Negative),
            "neutral"  => Some(Self::Neutral),
            "positive" => Some(Self::Positive),
            _ => None,
        }
    }

    /// Representative score of the band, used for the report's average sentiment.
    pub fn midpoint(&self) -> f64 {
        match self {
            Self::Negative => -0.6,
            Self::Neutral  =>  0.0,
            Self::Positive =>  0.6,
        }
    }
}

/// One assessment or conversation, already reduced to the fields
/// the catalog queries group on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    pub record_id:   RecordId,
    pub subject_id:  SubjectId,
    pub kind:        RecordKind,
    pub occurred_on: NaiveDate,
    pub severity:    Severity,
    pub risk_level:  RiskLevel,
    pub topic:       Option<String>,
    pub sentiment:   f64,
}

/// Validated filters, ready to hand to a `RecordSource`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind:       Option<RecordKind>,
    pub start_date: Option<NaiveDate>,
    pub end_date:   Option<NaiveDate>,
    pub severity:   Option<Severity>,
}

impl RecordFilter {
    pub fn matches(&self, record: &SourceRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.start_date.map_or(true, |d| record.occurred_on >= d)
            && self.end_date.map_or(true, |d| record.occurred_on <= d)
            && self.severity.map_or(true, |s| record.severity == s)
    }
}
