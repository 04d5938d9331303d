//! Query executor. Runs one request through the release pipeline.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. validate        catalog lookup, role check, filter shape
//!   2. consent_filter  restrict to opted-in subjects
//!   3. aggregate       grouped distinct-subject counts
//!   4. suppress        k-anonymity; total suppression stops here
//!   5. reserve         privacy budget ledger
//!   6. noise           Laplace noise on every surviving count
//!   7. commit          finalize the reservation
//!   8. package         assemble the response
//!
//! RULES:
//!   - Each request is terminal on its first failure.
//!   - Nothing touches the ledger before stage 5.
//!   - The reservation is RAII: any exit between reserve and commit,
//!     including the deadline check, rolls it back.
//!   - Only released results consume budget.
//!   - A request run inside a hold draws its cost from the hold at
//!     stage 7. The hold's owner decides whether the draws are kept.
//!   - Nothing is retried here. A retry is a new request.

use crate::{
    aggregate::aggregate,
    anonymity::KAnonymityEnforcer,
    catalog::{AllowListedQuery, FilterField, QueryCatalog},
    clock::{Clock, ManualClock},
    config::{BudgetConfig, EngineConfig, ExecutorConfig},
    consent::{ConsentRegistry, PopulationCounts},
    error::{EngineError, EngineResult},
    ledger::{BudgetPeriod, BudgetStatus, LedgerSnapshot, PrivacyBudgetLedger, Reservation},
    noise::NoiseInjector,
    record::{RecordFilter, Severity},
    source::{ConsentSource, RecordSource},
    store::InsightsStore,
    types::{COUNT_SENSITIVITY, K_THRESHOLD},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Stages ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    ConsentFilter,
    Aggregate,
    Suppress,
    Reserve,
    Noise,
    Commit,
    Package,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate      => "validate",
            Self::ConsentFilter => "consent_filter",
            Self::Aggregate     => "aggregate",
            Self::Suppress      => "suppress",
            Self::Reserve       => "reserve",
            Self::Noise         => "noise",
            Self::Commit        => "commit",
            Self::Package       => "package",
        }
    }
}

// ── Request / response ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub query_name: String,
    #[serde(default)]
    pub filters: QueryFilters,
    pub requester_role: String,
}

impl QueryRequest {
    pub fn new(query_name: impl Into<String>, requester_role: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            filters: QueryFilters::default(),
            requester_role: requester_role.into(),
        }
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.filters.start_date = Some(start);
        self.filters.end_date = Some(end);
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.filters.severity = Some(severity.into());
        self
    }
}

/// One released group: its key columns plus the noisy subject count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleasedRow {
    #[serde(flatten)]
    pub group: BTreeMap<String, String>,
    pub count: u64,
}

impl ReleasedRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.group.get(column).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub data: Vec<ReleasedRow>,
    pub total_records_anonymized: u64,
    pub k_anonymity_satisfied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivacyMetadata {
    pub k_value: usize,
    pub k_threshold: usize,
    pub epsilon_used: f64,
    pub delta_used: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub query_name: String,
    pub execution_path: Vec<String>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub errors: Vec<String>,
    pub result: QueryResult,
    pub privacy_metadata: PrivacyMetadata,
}

/// The caller-facing response plus the typed error behind a failure.
#[derive(Debug)]
pub struct QueryOutcome {
    pub response: QueryResponse,
    pub error: Option<EngineError>,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One row of the query audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAuditEntry {
    pub id: Option<i64>,
    pub query_name: String,
    pub requester_role: String,
    pub success: bool,
    pub error_kind: Option<String>,
    pub epsilon_charged: f64,
    pub delta_charged: f64,
    pub budget_period: String,
    pub executed_at: DateTime<Utc>,
}

/// Shape of the privacy audit read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivacyAudit {
    pub budget_status: BudgetStatus,
    pub period: String,
    pub ledger: LedgerSnapshot,
    pub population: PopulationCounts,
    pub recent_queries: Vec<QueryAuditEntry>,
}

/// What a successful pipeline hands to packaging.
struct Released {
    rows: Vec<ReleasedRow>,
    total_records: u64,
    k_value: usize,
    epsilon: f64,
    delta: f64,
    period: BudgetPeriod,
}

/// Where a request's privacy cost is charged.
enum Charge<'a, 'h, 'l> {
    Own(Reservation<'a>),
    Held(&'h mut Reservation<'l>),
}

impl Charge<'_, '_, '_> {
    fn settle(self, epsilon: f64, delta: f64) -> EngineResult<BudgetPeriod> {
        match self {
            Self::Own(r) => {
                let period = r.period();
                r.commit();
                Ok(period)
            }
            Self::Held(hold) => {
                hold.draw(epsilon, delta)?;
                Ok(hold.period())
            }
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────────────

pub struct QueryExecutor {
    catalog:  QueryCatalog,
    consent:  ConsentRegistry,
    source:   Arc<dyn RecordSource>,
    enforcer: KAnonymityEnforcer,
    ledger:   Arc<PrivacyBudgetLedger>,
    noise:    NoiseInjector,
    store:    Arc<InsightsStore>,
    clock:    Arc<dyn Clock>,
    settings: ExecutorConfig,
    budget:   BudgetConfig,
}

impl QueryExecutor {
    /// Wire an executor whose consent and record collaborators are
    /// supplied separately from the store that holds reports and audit.
    #[allow(clippy::too_many_arguments)]
    pub fn with_sources(
        config: &EngineConfig,
        consent_source: Arc<dyn ConsentSource>,
        record_source: Arc<dyn RecordSource>,
        store: Arc<InsightsStore>,
        ledger: Arc<PrivacyBudgetLedger>,
        noise: NoiseInjector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog: config.catalog.clone(),
            consent: ConsentRegistry::new(consent_source),
            source: record_source,
            enforcer: KAnonymityEnforcer::new(K_THRESHOLD),
            ledger,
            noise,
            store,
            clock,
            settings: config.executor.clone(),
            budget: config.budget.clone(),
        }
    }

    /// Build a fully wired executor on one store, with a fresh ledger for
    /// the clock's current period.
    pub fn build(
        config: &EngineConfig,
        store: Arc<InsightsStore>,
        noise: NoiseInjector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let period = BudgetPeriod::containing(clock.today());
        let ledger = Arc::new(PrivacyBudgetLedger::from_config(&config.budget, period));
        Self::with_sources(
            config,
            store.clone(),
            store.clone(),
            store,
            ledger,
            noise,
            clock,
        )
    }

    /// In-memory store, test config, seeded noise, clock fixed at 2026-10-15.
    pub fn build_test(seed: u64) -> EngineResult<Self> {
        let clock = Arc::new(ManualClock::at_date(
            NaiveDate::from_ymd_opt(2026, 10, 15).unwrap_or_default(),
        ));
        Self::build_test_with(&EngineConfig::default_test(), NoiseInjector::seeded(seed), clock)
    }

    pub fn build_test_with(
        config: &EngineConfig,
        noise: NoiseInjector,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let store = InsightsStore::in_memory()?;
        store.migrate()?;
        Ok(Self::build(config, Arc::new(store), noise, clock))
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn consent(&self) -> &ConsentRegistry {
        &self.consent
    }

    pub fn ledger(&self) -> &Arc<PrivacyBudgetLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<InsightsStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one request through the full pipeline. Never panics on a
    /// pipeline failure: the response carries success=false instead.
    pub fn execute(&self, request: &QueryRequest) -> QueryOutcome {
        let (outcome, entry) = self.run(request, None);
        self.append_audit(&entry);
        outcome
    }

    /// Run one request with its cost drawn from `hold` rather than
    /// reserved on its own. The audit entry is handed back unwritten,
    /// since only the hold's owner knows whether the draw is kept.
    pub fn execute_within(
        &self,
        request: &QueryRequest,
        hold: &mut Reservation<'_>,
    ) -> (QueryOutcome, QueryAuditEntry) {
        self.run(request, Some(hold))
    }

    fn run(
        &self,
        request: &QueryRequest,
        hold: Option<&mut Reservation<'_>>,
    ) -> (QueryOutcome, QueryAuditEntry) {
        let started = Instant::now();
        let mut path: Vec<Stage> = Vec::with_capacity(8);

        let result = self.pipeline(request, started, &mut path, hold);
        let execution_time_ms = started.elapsed().as_millis() as u64;
        let execution_path = path.iter().map(|s| s.name().to_string()).collect();

        let entry = self.audit_entry(request, &result);

        let response = match &result {
            Ok(released) => {
                log::info!(
                    "{} by {}: released {} groups (k={}, ε={}, δ={:e}) in {execution_time_ms}ms",
                    request.query_name,
                    request.requester_role,
                    released.rows.len(),
                    released.k_value,
                    released.epsilon,
                    released.delta
                );
                QueryResponse {
                    query_name: request.query_name.clone(),
                    execution_path,
                    execution_time_ms,
                    success: true,
                    errors: Vec::new(),
                    result: QueryResult {
                        data: released.rows.clone(),
                        total_records_anonymized: released.total_records,
                        k_anonymity_satisfied: true,
                    },
                    privacy_metadata: PrivacyMetadata {
                        k_value: released.k_value,
                        k_threshold: self.enforcer.k_threshold(),
                        epsilon_used: released.epsilon,
                        delta_used: released.delta,
                    },
                }
            }
            Err(err) => {
                if err.is_insufficient_data() {
                    log::info!("{} by {}: {err}", request.query_name, request.requester_role);
                } else {
                    log::warn!("{} by {}: {err}", request.query_name, request.requester_role);
                }
                QueryResponse {
                    query_name: request.query_name.clone(),
                    execution_path,
                    execution_time_ms,
                    success: false,
                    errors: vec![err.to_string()],
                    result: QueryResult::default(),
                    privacy_metadata: PrivacyMetadata {
                        k_value: 0,
                        k_threshold: self.enforcer.k_threshold(),
                        epsilon_used: 0.0,
                        delta_used: 0.0,
                    },
                }
            }
        };

        let outcome = QueryOutcome {
            response,
            error: result.err(),
        };
        (outcome, entry)
    }

    fn pipeline(
        &self,
        request: &QueryRequest,
        started: Instant,
        path: &mut Vec<Stage>,
        hold: Option<&mut Reservation<'_>>,
    ) -> EngineResult<Released> {
        path.push(Stage::Validate);
        let (query, filter) = self.validate(request)?;

        path.push(Stage::ConsentFilter);
        let candidates = self.source.subjects_matching(&filter)?;
        let consented = self.consent.filter_to_consented(&candidates)?;
        if consented.is_empty() {
            return Err(EngineError::ConsentPopulationEmpty);
        }

        path.push(Stage::Aggregate);
        let records = self.source.records_for(&filter, &consented)?;
        let raw = aggregate(query.kind, &records, &consented);

        path.push(Stage::Suppress);
        let outcome = self.enforcer.enforce(raw);
        if !outcome.k_anonymity_satisfied() {
            return Err(EngineError::KAnonymityViolation {
                k_threshold: outcome.k_threshold,
            });
        }

        path.push(Stage::Reserve);
        let charge = match hold {
            Some(hold) => {
                if !hold.belongs_to(&self.ledger) {
                    return Err(EngineError::Other(anyhow::anyhow!(
                        "reservation {} was taken on another ledger",
                        hold.id()
                    )));
                }
                hold.ensure_covers(query.epsilon_cost, query.delta_cost)?;
                Charge::Held(hold)
            }
            None => {
                self.ledger.roll_over(BudgetPeriod::containing(self.clock.today()));
                Charge::Own(self.ledger.reserve(query.epsilon_cost, query.delta_cost)?)
            }
        };

        path.push(Stage::Noise);
        let true_counts: Vec<u64> = outcome.released.iter().map(|g| g.size() as u64).collect();
        let noisy = self
            .noise
            .noisy_counts(&true_counts, COUNT_SENSITIVITY, query.epsilon_cost)?;
        let rows: Vec<ReleasedRow> = outcome
            .released
            .iter()
            .zip(noisy)
            .map(|(group, count)| ReleasedRow {
                group: group
                    .key
                    .iter()
                    .map(|(col, val)| (col.to_string(), val.clone()))
                    .collect(),
                count,
            })
            .collect();

        if let Some(deadline_ms) = self.settings.query_deadline_ms {
            if started.elapsed() >= Duration::from_millis(deadline_ms) {
                return Err(EngineError::DeadlineExceeded { deadline_ms });
            }
        }

        path.push(Stage::Commit);
        let (epsilon, delta) = (query.epsilon_cost, query.delta_cost);
        let period = charge.settle(epsilon, delta)?;

        path.push(Stage::Package);
        Ok(Released {
            rows,
            total_records: outcome.released.iter().map(|g| g.records as u64).sum(),
            k_value: outcome.k_value,
            epsilon,
            delta,
            period,
        })
    }

    fn validate(&self, request: &QueryRequest) -> EngineResult<(&AllowListedQuery, RecordFilter)> {
        let query = self.catalog.lookup(&request.query_name)?;

        if !self
            .settings
            .allowed_roles
            .iter()
            .any(|r| r == &request.requester_role)
        {
            return Err(EngineError::RoleNotPermitted {
                role: request.requester_role.clone(),
            });
        }

        let invalid = |reason: String| EngineError::InvalidFilter {
            query: query.name.to_string(),
            reason,
        };

        let f = &request.filters;
        let mut filter = RecordFilter {
            kind: query.kind.record_kind(),
            ..RecordFilter::default()
        };

        if f.start_date.is_some() || f.end_date.is_some() {
            if !query.accepts(FilterField::DateRange) {
                return Err(invalid("date range is not accepted".into()));
            }
            if let (Some(start), Some(end)) = (f.start_date, f.end_date) {
                if start > end {
                    return Err(invalid(format!("start_date {start} is after end_date {end}")));
                }
            }
            filter.start_date = f.start_date;
            filter.end_date = f.end_date;
        }

        if let Some(raw) = &f.severity {
            if !query.accepts(FilterField::Severity) {
                return Err(invalid("severity is not accepted".into()));
            }
            let severity = Severity::parse(raw)
                .ok_or_else(|| invalid(format!("unknown severity '{raw}'")))?;
            filter.severity = Some(severity);
        }

        Ok((query, filter))
    }

    fn audit_entry(&self, request: &QueryRequest, result: &EngineResult<Released>) -> QueryAuditEntry {
        let (success, error_kind, epsilon, delta, period) = match result {
            Ok(r) => (true, None, r.epsilon, r.delta, r.period),
            Err(e) => (false, Some(e.kind().to_string()), 0.0, 0.0, self.ledger.period()),
        };
        QueryAuditEntry {
            id: None,
            query_name: request.query_name.clone(),
            requester_role: request.requester_role.clone(),
            success,
            error_kind,
            epsilon_charged: epsilon,
            delta_charged: delta,
            budget_period: period.to_string(),
            executed_at: self.clock.now(),
        }
    }

    /// Append to the query audit log. A write failure is logged and
    /// never changes a response or the ledger.
    pub fn append_audit(&self, entry: &QueryAuditEntry) {
        if let Err(e) = self.store.append_query_audit(entry) {
            log::error!("query audit write failed for {}: {e}", entry.query_name);
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn budget_status(&self) -> BudgetStatus {
        self.ledger.roll_over(BudgetPeriod::containing(self.clock.today()));
        self.ledger.budget_status(&self.budget)
    }

    pub fn privacy_audit(&self) -> EngineResult<PrivacyAudit> {
        let budget_status = self.budget_status();
        let ledger = self.ledger.snapshot();
        Ok(PrivacyAudit {
            budget_status,
            period: ledger.period.to_string(),
            ledger,
            population: self.consent.population_counts()?,
            recent_queries: self.store.recent_query_audit(self.settings.audit_recent_limit)?,
        })
    }
}
