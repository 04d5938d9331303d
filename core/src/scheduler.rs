//! Calendar-driven report generation.
//!
//! Weekly reports fall due on Mondays and cover the previous Monday to
//! Sunday. Monthly reports fall due on the 1st and cover the previous
//! calendar month. A period that already has a report is skipped, so
//! running the schedule twice on the same day generates nothing new.
//! Runs are serialized, so concurrent callers cannot both see a period
//! as missing.

use crate::{
    error::EngineResult,
    report::{InsightsReport, ReportGenerator, ReportType},
};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuePeriod {
    pub report_type: ReportType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleRun {
    pub generated: Vec<InsightsReport>,
    pub already_present: Vec<DuePeriod>,
    /// Periods whose generation failed, with the error text.
    pub failed: Vec<(DuePeriod, String)>,
}

/// Periods that fall due on `today`, weekly first.
pub fn due_periods(today: NaiveDate) -> Vec<DuePeriod> {
    let mut due = Vec::new();
    if today.weekday() == Weekday::Mon {
        due.push(DuePeriod {
            report_type: ReportType::Weekly,
            period_start: today - Duration::days(7),
            period_end: today - Duration::days(1),
        });
    }
    if today.day() == 1 {
        let period_end = today - Duration::days(1);
        if let Some(period_start) = period_end.with_day(1) {
            due.push(DuePeriod {
                report_type: ReportType::Monthly,
                period_start,
                period_end,
            });
        }
    }
    due
}

pub struct ReportScheduler {
    generator: ReportGenerator,
    run_lock:  Mutex<()>,
}

impl ReportScheduler {
    pub fn new(generator: ReportGenerator) -> Self {
        Self {
            generator,
            run_lock: Mutex::new(()),
        }
    }

    pub fn generator(&self) -> &ReportGenerator {
        &self.generator
    }

    /// Generate every report due on `today` that the store does not hold yet.
    /// A failed period is recorded and the remaining periods still run.
    pub fn run_due(&self, today: NaiveDate) -> EngineResult<ScheduleRun> {
        // Guards no data, so a poisoned lock is still usable.
        let _running = self.run_lock.lock().unwrap_or_else(|p| p.into_inner());
        let store = self.generator.executor().store();
        let mut run = ScheduleRun::default();

        for due in due_periods(today) {
            if store
                .find_report_by_period(due.report_type, due.period_start, due.period_end)?
                .is_some()
            {
                log::debug!(
                    "{} report for {}..{} already stored",
                    due.report_type.as_str(),
                    due.period_start,
                    due.period_end
                );
                run.already_present.push(due);
                continue;
            }

            match self.generator.generate(
                due.report_type,
                due.period_start,
                due.period_end,
                self.generator.generator_role(),
            ) {
                Ok(report) => run.generated.push(report),
                Err(e) => {
                    log::warn!(
                        "scheduled {} report for {}..{} failed: {e}",
                        due.report_type.as_str(),
                        due.period_start,
                        due.period_end
                    );
                    run.failed.push((due, e.to_string()));
                }
            }
        }

        Ok(run)
    }
}
