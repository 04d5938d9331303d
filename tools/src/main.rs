//! insights-runner: headless host for the insights engine.
//!
//! Usage:
//!   insights-runner --db insights.db --data-dir ./data
//!   insights-runner --db insights.db --ipc-mode --schedule-every-secs 3600
//!   insights-runner --demo-subjects 500 --seed 7 --ipc-mode
//!
//! In IPC mode one JSON command is read per stdin line and one JSON
//! response is written per stdout line.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use insights_core::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    demo::seed_demo_population,
    executor::{QueryExecutor, QueryRequest},
    noise::NoiseInjector,
    report::{ReportGenerator, ReportType},
    scheduler::ReportScheduler,
    store::InsightsStore,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Query(QueryRequest),
    PrivacyAudit,
    ListReports {
        report_type: Option<String>,
        limit: Option<u32>,
        offset: Option<u32>,
    },
    GetReport {
        id: String,
    },
    GenerateReport {
        report_type: ReportType,
        period_start: NaiveDate,
        period_end: NaiveDate,
        requester_role: String,
    },
    RunSchedule {
        today: Option<NaiveDate>,
    },
    ListQueries,
    Quit,
}

#[derive(serde::Serialize)]
struct CatalogListing<'a> {
    name: &'a str,
    label: &'a str,
    epsilon_cost: f64,
    delta_cost: f64,
}

const DEFAULT_PAGE: u32 = 20;
const MAX_PAGE: u32 = 100;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed: Option<u64> = args
        .windows(2)
        .find(|w| w[0] == "--seed")
        .and_then(|w| w[1].parse().ok());
    let demo_subjects = parse_arg(&args, "--demo-subjects", 0usize);
    let schedule_every_secs = parse_arg(&args, "--schedule-every-secs", 0u64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");

    if !ipc_mode {
        println!("insights-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!("  noise:     {}", if seed.is_some() { "seeded" } else { "secure" });
        println!();
    }

    let config = EngineConfig::load(data_dir)?;
    let store = Arc::new(InsightsStore::open(db)?);
    store.migrate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let noise = match seed {
        Some(s) => {
            log::warn!("noise stream seeded with {s}; released counts are reproducible");
            NoiseInjector::seeded(s)
        }
        None => NoiseInjector::secure(),
    };

    if demo_subjects > 0 {
        let today = clock.today();
        seed_demo_population(
            &store,
            seed.unwrap_or(42),
            demo_subjects,
            today - Duration::days(90),
            90,
            clock.now(),
        )?;
    }

    let executor = Arc::new(QueryExecutor::build(&config, store.clone(), noise, clock.clone()));
    let scheduler = Arc::new(ReportScheduler::new(ReportGenerator::new(
        executor.clone(),
        config.reports.clone(),
    )));

    if schedule_every_secs > 0 {
        spawn_schedule_loop(scheduler.clone(), clock.clone(), schedule_every_secs);
    }

    if ipc_mode {
        run_ipc_loop(&executor, &scheduler)?;
    } else {
        print_summary(&executor)?;
    }

    Ok(())
}

fn spawn_schedule_loop(scheduler: Arc<ReportScheduler>, clock: Arc<dyn Clock>, every_secs: u64) {
    std::thread::spawn(move || loop {
        match scheduler.run_due(clock.today()) {
            Ok(run) => {
                if !run.generated.is_empty() {
                    log::info!("scheduler generated {} report(s)", run.generated.len());
                }
            }
            Err(e) => log::error!("scheduler pass failed: {e}"),
        }
        std::thread::sleep(std::time::Duration::from_secs(every_secs));
    });
}

fn run_ipc_loop(executor: &QueryExecutor, scheduler: &ReportScheduler) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };

        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let reply = match handle_command(executor, scheduler, cmd) {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(
    executor: &QueryExecutor,
    scheduler: &ReportScheduler,
    cmd: IpcCommand,
) -> Result<serde_json::Value> {
    let value = match cmd {
        // A failed query is still a well-formed response with success=false.
        IpcCommand::Query(request) => serde_json::to_value(executor.execute(&request).response)?,
        IpcCommand::PrivacyAudit => serde_json::to_value(executor.privacy_audit()?)?,
        IpcCommand::ListReports { report_type, limit, offset } => {
            let report_type = match report_type.as_deref() {
                None | Some("") => None,
                Some(raw) => Some(
                    ReportType::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("unknown report_type '{raw}'"))?,
                ),
            };
            let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
            let page = executor
                .store()
                .list_reports(report_type, limit, offset.unwrap_or(0))?;
            serde_json::to_value(page)?
        }
        IpcCommand::GetReport { id } => serde_json::to_value(executor.store().get_report(&id)?)?,
        IpcCommand::GenerateReport {
            report_type,
            period_start,
            period_end,
            requester_role,
        } => serde_json::to_value(scheduler.generator().generate(
            report_type,
            period_start,
            period_end,
            &requester_role,
        )?)?,
        IpcCommand::RunSchedule { today } => {
            let today = today.unwrap_or_else(|| executor.clock().today());
            serde_json::to_value(scheduler.run_due(today)?)?
        }
        IpcCommand::ListQueries => {
            let listing: Vec<CatalogListing<'_>> = executor
                .catalog()
                .entries()
                .iter()
                .map(|q| CatalogListing {
                    name: q.name,
                    label: &q.label,
                    epsilon_cost: q.epsilon_cost,
                    delta_cost: q.delta_cost,
                })
                .collect();
            serde_json::to_value(listing)?
        }
        IpcCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

fn print_summary(executor: &QueryExecutor) -> Result<()> {
    let audit = executor.privacy_audit()?;
    let store = executor.store();

    println!("=== PRIVACY BUDGET ({}) ===", audit.period);
    println!(
        "  epsilon:   {:.4} / {:.4} ({:.1}%, {:?})",
        audit.budget_status.used_budget,
        audit.budget_status.total_budget,
        audit.budget_status.budget_used_percentage,
        audit.budget_status.budget_status
    );
    println!("  delta:     {:e} / {:e}", audit.ledger.delta_used, audit.ledger.delta_total);
    println!();
    println!("=== POPULATION ===");
    println!("  subjects:  {}", audit.population.total);
    println!("  consented: {}", audit.population.consented);
    println!("  records:   {}", store.source_record_count()?);
    println!();
    println!("=== CATALOG ===");
    for q in executor.catalog().entries() {
        println!("  {:<24} ε={:<5} {}", q.name, q.epsilon_cost, q.label);
    }
    println!();
    println!("  reports stored:  {}", store.report_count()?);
    println!("  audited queries: {}", store.query_audit_count()?);
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
