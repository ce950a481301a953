//! Rollup Report
//!
//! Prints rollup rows as JSON lines, read straight from the store's
//! `meta.db` through a query-only connection, so it never migrates or writes
//! the store and can run next to a live `pipeline_runtime`.
//!
//! ## Usage
//!
//! ```bash
//! rollup_report energy [--machine <ID>] [--hours <N>]
//! rollup_report maintenance [--machine <ID>] [--hours <N>]
//! ```
//!
//! The store root comes from `CNCFLOW_STORE_PATH` like the runtime.
//! `--hours` defaults to 24 for `energy` and 30 days for `maintenance`; the
//! range starts at the bucket holding `now - hours`.

use chrono::{DateTime, Duration, Utc};
use cncflow::store::{time_bucket, RollupStore, TimeRange, META_DB};
use dotenv::dotenv;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
enum Report {
    Energy,
    Maintenance,
}

impl Report {
    fn bucket_width(self) -> Duration {
        match self {
            Report::Energy => Duration::hours(1),
            Report::Maintenance => Duration::days(1),
        }
    }
}

struct ReportArgs {
    report: Report,
    machine: Option<String>,
    hours: i64,
    store_path: PathBuf,
}

impl ReportArgs {
    fn from_env_and_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().collect();
        let usage = "Usage: rollup_report <energy|maintenance> [--machine <ID>] [--hours <N>]";

        let report = match args.get(1).map(|s| s.as_str()) {
            Some("energy") => Report::Energy,
            Some("maintenance") => Report::Maintenance,
            _ => return Err(usage.into()),
        };

        let machine = args
            .windows(2)
            .find(|w| w[0] == "--machine")
            .map(|w| w[1].clone());

        let hours = match args.windows(2).find(|w| w[0] == "--hours") {
            Some(w) => w[1]
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| format!("Invalid --hours value: {}", w[1]))?,
            None => match report {
                Report::Energy => 24,
                Report::Maintenance => 30 * 24,
            },
        };

        let store_path = std::env::var("CNCFLOW_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/cncflow/store"));

        Ok(Self {
            report,
            machine,
            hours,
            store_path,
        })
    }
}

/// `[bucket(now - hours), now)`, or an error when `hours` is out of range.
fn report_range(report: Report, hours: i64, now: DateTime<Utc>) -> Result<TimeRange, String> {
    let start = Duration::try_hours(hours)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| format!("--hours {} reaches past the earliest timestamp", hours))?;
    Ok(TimeRange::new(time_bucket(start, report.bucket_width()), now))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = ReportArgs::from_env_and_args()?;
    let meta_path = args.store_path.join(META_DB);
    if !meta_path.exists() {
        return Err(format!("No store found at {}", args.store_path.display()).into());
    }

    let rollups = RollupStore::open_read_only(&meta_path)?;
    let now = Utc::now();
    let range = report_range(args.report, args.hours, now)?;
    let machine = args.machine.as_deref();

    let lines = match args.report {
        Report::Energy => rollups
            .hourly_energy_usage(range, machine)?
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?,
        Report::Maintenance => rollups
            .daily_maintenance_trend(range, machine)?
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?,
    };

    for line in &lines {
        println!("{}", line);
    }
    log::info!("{} rows", lines.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_range_starts_on_a_bucket_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 25, 0).unwrap();

        let energy = report_range(Report::Energy, 24, now).unwrap();
        assert_eq!(energy.start, Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap());
        assert_eq!(energy.end, now);

        let maintenance = report_range(Report::Maintenance, 30 * 24, now).unwrap();
        assert_eq!(maintenance.start, Utc.with_ymd_and_hms(2024, 2, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_oversized_hours_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 25, 0).unwrap();
        assert!(report_range(Report::Energy, i64::MAX, now).is_err());
        assert!(report_range(Report::Maintenance, 3_000_000_000, now).is_err());
    }
}
