//! Insights engine: privacy-preserving analytics over sensitive records.
//!
//! PIPELINE (fixed, documented, never reordered):
//!   validate → consent_filter → aggregate → suppress
//!            → reserve → noise → commit → package
//!
//! RULES:
//!   - Only allow-listed queries run. The catalog is a closed enum.
//!   - Non-consented subjects never reach an aggregate.
//!   - Every released statistic carries Laplace noise.
//!   - The privacy budget ledger is the only shared mutable state.
//!   - Only the store module issues SQL.

pub mod aggregate;
pub mod anonymity;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod consent;
pub mod demo;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod noise;
pub mod record;
pub mod report;
pub mod rng;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use executor::{QueryExecutor, QueryOutcome, QueryRequest, QueryResponse};
