use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown query '{name}'")]
    UnknownQuery { name: String },

    #[error("Invalid filter for '{query}': {reason}")]
    InvalidFilter { query: String, reason: String },

    #[error("Role '{role}' is not permitted to run analytics queries")]
    RoleNotPermitted { role: String },

    #[error("Insufficient data: every group fell below k={k_threshold}")]
    KAnonymityViolation { k_threshold: usize },

    #[error("Insufficient data: no consented subjects match the filters")]
    ConsentPopulationEmpty,

    #[error(
        "Privacy budget exhausted: need ε={epsilon_needed:.4} δ={delta_needed:e}, \
         remaining ε={epsilon_remaining:.4} δ={delta_remaining:e}"
    )]
    BudgetExhausted {
        epsilon_needed: f64,
        delta_needed: f64,
        epsilon_remaining: f64,
        delta_remaining: f64,
    },

    #[error("Query exceeded its {deadline_ms}ms deadline before release")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Report '{id}' not found")]
    ReportNotFound { id: String },

    #[error("Report store unavailable: {0}")]
    PersistenceFailure(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable name, used in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_)                => "database",
            Self::Serialization(_)           => "serialization",
            Self::UnknownQuery { .. }        => "unknown_query",
            Self::InvalidFilter { .. }       => "invalid_filter",
            Self::RoleNotPermitted { .. }    => "role_not_permitted",
            Self::KAnonymityViolation { .. } => "k_anonymity_violation",
            Self::ConsentPopulationEmpty     => "consent_population_empty",
            Self::BudgetExhausted { .. }     => "budget_exhausted",
            Self::DeadlineExceeded { .. }    => "deadline_exceeded",
            Self::ReportNotFound { .. }      => "report_not_found",
            Self::PersistenceFailure(_)      => "persistence_failure",
            Self::Other(_)                   => "other",
        }
    }

    /// True for the failures callers see as "not enough data".
    pub fn is_insufficient_data(&self) -> bool {
        matches!(
            self,
            Self::KAnonymityViolation { .. } | Self::ConsentPopulationEmpty
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
