use crate::catalog::{CatalogEntryConfig, QueryCatalog};
use serde::{Deserialize, Serialize};

// ── Privacy budget ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Epsilon available per accounting period (calendar month).
    pub epsilon_total: f64,
    /// Delta available per accounting period.
    pub delta_total: f64,
    /// Usage percentage at which the audit read reports "warning".
    pub warning_pct: f64,
    /// Usage percentage at which the audit read reports "critical".
    pub critical_pct: f64,
}

impl BudgetConfig {
    pub fn default_test() -> Self {
        Self {
            epsilon_total: 1.0,
            delta_total: 1e-4,
            warning_pct: 75.0,
            critical_pct: 90.0,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.epsilon_total.is_finite() || self.epsilon_total <= 0.0 {
            anyhow::bail!("epsilon_total must be positive, got {}", self.epsilon_total);
        }
        if !self.delta_total.is_finite() || !(0.0..1.0).contains(&self.delta_total) {
            anyhow::bail!("delta_total must be in [0, 1), got {}", self.delta_total);
        }
        if self.warning_pct > self.critical_pct {
            anyhow::bail!(
                "warning_pct ({}) must not exceed critical_pct ({})",
                self.warning_pct,
                self.critical_pct
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    queries: Vec<CatalogEntryConfig>,
}

// ── Executor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Requester roles allowed to run catalog queries.
    pub allowed_roles: Vec<String>,
    /// A query still unreleased after this long is abandoned and its
    /// reservation rolled back. None disables the check.
    #[serde(default)]
    pub query_deadline_ms: Option<u64>,
    /// Entries returned with the privacy audit read.
    #[serde(default = "default_audit_window")]
    pub audit_recent_limit: usize,
}

fn default_audit_window() -> usize {
    20
}

// ── Reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Role the report generator presents to the executor.
    pub generator_role: String,
    /// Topics kept in a report's trending list.
    pub trending_topic_limit: usize,
    /// Share of high/critical risk flags that counts as elevated.
    pub high_risk_share_warning: f64,
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub budget:   BudgetConfig,
    pub catalog:  QueryCatalog,
    pub executor: ExecutorConfig,
    pub reports:  ReportConfig,
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let budget_path = format!("{data_dir}/privacy/budget.json");
        let budget_content = std::fs::read_to_string(&budget_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {budget_path}: {e}"))?;
        let budget: BudgetConfig = serde_json::from_str(&budget_content)?;
        budget.validate()?;

        let catalog_path = format!("{data_dir}/catalog/query_catalog.json");
        let catalog_content = std::fs::read_to_string(&catalog_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {catalog_path}: {e}"))?;
        let catalog_file: CatalogFile = serde_json::from_str(&catalog_content)?;
        let catalog = QueryCatalog::from_config(&catalog_file.queries)
            .map_err(|e| anyhow::anyhow!("{catalog_path}: {e}"))?;

        let executor_path = format!("{data_dir}/engine/executor.json");
        let executor_content = std::fs::read_to_string(&executor_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {executor_path}: {e}"))?;
        let executor: ExecutorConfig = serde_json::from_str(&executor_content)?;

        let reports_path = format!("{data_dir}/reports/report_config.json");
        let reports_content = std::fs::read_to_string(&reports_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {reports_path}: {e}"))?;
        let reports: ReportConfig = serde_json::from_str(&reports_content)?;

        log::info!(
            "config loaded from {data_dir}: ε_total={} δ_total={:e}, {} catalog queries",
            budget.epsilon_total,
            budget.delta_total,
            catalog.entries().len()
        );

        Ok(Self { budget, catalog, executor, reports })
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            budget: BudgetConfig::default_test(),
            catalog: QueryCatalog::standard(),
            executor: ExecutorConfig {
                allowed_roles: vec!["admin".into(), "analyst".into()],
                query_deadline_ms: None,
                audit_recent_limit: default_audit_window(),
            },
            reports: ReportConfig {
                generator_role: "admin".into(),
                trending_topic_limit: 5,
                high_risk_share_warning: 0.20,
            },
        }
    }
}
