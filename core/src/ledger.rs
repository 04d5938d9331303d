//! Privacy budget ledger: the engine's only shared mutable state.
//!
//! RULES:
//!   - reserve / commit / rollback are the only mutators.
//!   - One mutex serializes them. The critical section is the counter
//!     update and nothing else: no I/O, no noise, no aggregation.
//!   - Amounts are fixed-point integers (1e-12 units). Twenty spends of
//!     0.05 must sum to exactly 1.0, which f64 accumulation does not give.
//!   - A Reservation that is dropped without commit() rolls itself back.
//!     Early returns, panics, and deadline expiry all release budget
//!     without bookkeeping at the call site.
//!   - Counters are per accounting period. A reservation only ever
//!     touches the period it was taken in.

use crate::{
    config::BudgetConfig,
    error::{EngineError, EngineResult},
};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const UNIT_SCALE: f64 = 1_000_000_000_000.0;

fn to_units(amount: f64) -> u64 {
    (amount * UNIT_SCALE).round().max(0.0) as u64
}

fn from_units(units: u64) -> f64 {
    units as f64 / UNIT_SCALE
}

/// Calendar month the budget is scoped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BudgetPeriod {
    pub year:  i32,
    pub month: u32,
}

impl BudgetPeriod {
    pub fn containing(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetHealth {
    Healthy,
    Warning,
    Critical,
}

/// Shape returned by the privacy audit read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetStatus {
    pub used_budget:            f64,
    pub total_budget:           f64,
    pub budget_used_percentage: f64,
    pub budget_status:          BudgetHealth,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub period:            BudgetPeriod,
    pub epsilon_total:     f64,
    pub epsilon_used:      f64,
    pub delta_total:       f64,
    pub delta_used:        f64,
    pub epsilon_committed: f64,
    pub delta_committed:   f64,
    pub open_reservations: u64,
}

impl LedgerSnapshot {
    pub fn epsilon_remaining(&self) -> f64 {
        (self.epsilon_total - self.epsilon_used).max(0.0)
    }
}

#[derive(Debug)]
struct LedgerState {
    period:            BudgetPeriod,
    /// Committed plus in-flight.
    epsilon_used:      u64,
    delta_used:        u64,
    epsilon_committed: u64,
    delta_committed:   u64,
    open_reservations: u64,
}

impl LedgerState {
    fn fresh(period: BudgetPeriod) -> Self {
        Self {
            period,
            epsilon_used: 0,
            delta_used: 0,
            epsilon_committed: 0,
            delta_committed: 0,
            open_reservations: 0,
        }
    }
}

pub struct PrivacyBudgetLedger {
    epsilon_total: u64,
    delta_total:   u64,
    state:         Mutex<LedgerState>,
    next_id:       AtomicU64,
}

impl PrivacyBudgetLedger {
    pub fn new(period: BudgetPeriod, epsilon_total: f64, delta_total: f64) -> Self {
        Self {
            epsilon_total: to_units(epsilon_total),
            delta_total:   to_units(delta_total),
            state:         Mutex::new(LedgerState::fresh(period)),
            next_id:       AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &BudgetConfig, period: BudgetPeriod) -> Self {
        Self::new(period, config.epsilon_total, config.delta_total)
    }

    // Every mutation completes inside one guard, so a poisoned lock
    // still holds consistent counters.
    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomically check and provisionally take (epsilon, delta).
    pub fn reserve(&self, epsilon: f64, delta: f64) -> EngineResult<Reservation<'_>> {
        if !epsilon.is_finite() || epsilon <= 0.0 || !delta.is_finite() || delta < 0.0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "invalid privacy cost ε={epsilon} δ={delta}"
            )));
        }
        let eps_units = to_units(epsilon);
        let delta_units = to_units(delta);

        let mut state = self.state();
        let eps_left = self.epsilon_total.saturating_sub(state.epsilon_used);
        let delta_left = self.delta_total.saturating_sub(state.delta_used);
        if eps_units > eps_left || delta_units > delta_left {
            log::warn!(
                "budget exhausted for {}: need ε={epsilon} δ={delta}, left ε={:.6} δ={:e}",
                state.period,
                from_units(eps_left),
                from_units(delta_left)
            );
            return Err(EngineError::BudgetExhausted {
                epsilon_needed:    epsilon,
                delta_needed:      delta,
                epsilon_remaining: from_units(eps_left),
                delta_remaining:   from_units(delta_left),
            });
        }
        state.epsilon_used += eps_units;
        state.delta_used += delta_units;
        state.open_reservations += 1;
        let period = state.period;
        drop(state);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("reservation {id} took ε={epsilon} δ={delta} in {period}");
        Ok(Reservation {
            ledger: self,
            id,
            period,
            epsilon: eps_units,
            delta: delta_units,
            drawn_epsilon: 0,
            drawn_delta: 0,
            settled: false,
        })
    }

    /// Close a reservation, keeping (keep_eps, keep_delta) of it as
    /// committed spend and returning the remainder.
    fn settle(&self, r: &Reservation<'_>, keep_eps: u64, keep_delta: u64) {
        let mut state = self.state();
        if state.period != r.period {
            // The period rolled over while this was in flight; its spend
            // belonged to a ledger that no longer exists.
            log::debug!(
                "reservation {} from {} settled after rollover to {}",
                r.id,
                r.period,
                state.period
            );
            return;
        }
        state.open_reservations = state.open_reservations.saturating_sub(1);
        state.epsilon_committed += keep_eps;
        state.delta_committed += keep_delta;
        state.epsilon_used -= r.epsilon - keep_eps;
        state.delta_used -= r.delta - keep_delta;
    }

    /// Start a new accounting period. Returns false if `period` is
    /// already current. Counters reset; open reservations from the old
    /// period settle as no-ops.
    pub fn roll_over(&self, period: BudgetPeriod) -> bool {
        let mut state = self.state();
        if state.period == period {
            return false;
        }
        log::info!(
            "privacy budget rollover {} → {} (ε used {:.6})",
            state.period,
            period,
            from_units(state.epsilon_used)
        );
        *state = LedgerState::fresh(period);
        true
    }

    pub fn period(&self) -> BudgetPeriod {
        self.state().period
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state();
        LedgerSnapshot {
            period:            state.period,
            epsilon_total:     from_units(self.epsilon_total),
            epsilon_used:      from_units(state.epsilon_used),
            delta_total:       from_units(self.delta_total),
            delta_used:        from_units(state.delta_used),
            epsilon_committed: from_units(state.epsilon_committed),
            delta_committed:   from_units(state.delta_committed),
            open_reservations: state.open_reservations,
        }
    }

    /// Epsilon usage against the thresholds in `config`.
    pub fn budget_status(&self, config: &BudgetConfig) -> BudgetStatus {
        let snap = self.snapshot();
        let pct = if snap.epsilon_total > 0.0 {
            snap.epsilon_used / snap.epsilon_total * 100.0
        } else {
            100.0
        };
        let health = if pct >= config.critical_pct {
            BudgetHealth::Critical
        } else if pct >= config.warning_pct {
            BudgetHealth::Warning
        } else {
            BudgetHealth::Healthy
        };
        BudgetStatus {
            used_budget:            snap.epsilon_used,
            total_budget:           snap.epsilon_total,
            budget_used_percentage: (pct * 100.0).round() / 100.0,
            budget_status:          health,
        }
    }
}

/// A provisional spend. Commit it to keep it; drop it to give it back.
///
/// A reservation can also act as a hold that several releases draw from.
/// `commit_drawn` then keeps only what was drawn.
#[must_use = "an uncommitted reservation is rolled back when dropped"]
pub struct Reservation<'a> {
    ledger:        &'a PrivacyBudgetLedger,
    id:            u64,
    period:        BudgetPeriod,
    epsilon:       u64,
    delta:         u64,
    drawn_epsilon: u64,
    drawn_delta:   u64,
    settled:       bool,
}

impl Reservation<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn period(&self) -> BudgetPeriod {
        self.period
    }

    pub fn epsilon(&self) -> f64 {
        from_units(self.epsilon)
    }

    pub fn delta(&self) -> f64 {
        from_units(self.delta)
    }

    pub fn belongs_to(&self, ledger: &PrivacyBudgetLedger) -> bool {
        std::ptr::eq(self.ledger, ledger)
    }

    pub fn drawn_epsilon(&self) -> f64 {
        from_units(self.drawn_epsilon)
    }

    /// Fail with BudgetExhausted unless the undrawn part covers (epsilon, delta).
    pub fn ensure_covers(&self, epsilon: f64, delta: f64) -> EngineResult<()> {
        let eps_left = self.epsilon - self.drawn_epsilon;
        let delta_left = self.delta - self.drawn_delta;
        if to_units(epsilon) > eps_left || to_units(delta) > delta_left {
            return Err(EngineError::BudgetExhausted {
                epsilon_needed:    epsilon,
                delta_needed:      delta,
                epsilon_remaining: from_units(eps_left),
                delta_remaining:   from_units(delta_left),
            });
        }
        Ok(())
    }

    /// Mark (epsilon, delta) of this hold as spent by a release.
    pub fn draw(&mut self, epsilon: f64, delta: f64) -> EngineResult<()> {
        self.ensure_covers(epsilon, delta)?;
        self.drawn_epsilon += to_units(epsilon);
        self.drawn_delta += to_units(delta);
        Ok(())
    }

    /// Finalize. Counters were already incremented by reserve().
    pub fn commit(mut self) {
        self.ledger.settle(&self, self.epsilon, self.delta);
        self.settled = true;
        log::debug!("reservation {} committed", self.id);
    }

    /// Keep what was drawn and give the rest back.
    pub fn commit_drawn(mut self) {
        self.ledger.settle(&self, self.drawn_epsilon, self.drawn_delta);
        self.settled = true;
        log::debug!(
            "reservation {} committed ε={} of ε={}",
            self.id,
            from_units(self.drawn_epsilon),
            from_units(self.epsilon)
        );
    }

    /// Give the budget back exactly as if reserve() never happened.
    pub fn rollback(mut self) {
        self.ledger.settle(&self, 0, 0);
        self.settled = true;
        log::debug!("reservation {} rolled back", self.id);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("reservation {} abandoned; rolling back", self.id);
            self.ledger.settle(self, 0, 0);
            self.settled = true;
        }
    }
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("epsilon", &self.epsilon())
            .field("delta", &self.delta())
            .field("drawn_epsilon", &self.drawn_epsilon())
            .field("settled", &self.settled)
            .finish()
    }
}
