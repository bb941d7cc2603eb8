use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::Parser;
use dealwatch_sync::{build_pipeline, NotificationStatus, RunSummary, TrackerConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealwatch")]
#[command(about = "Capture today's listings, record them, and mail new deals")]
struct Cli {
    /// History CSV; overrides DEALWATCH_STORE_PATH.
    #[arg(long)]
    store: Option<PathBuf>,
    /// Replay a captured fixture bundle instead of fetching live pages.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Capture date (YYYY-MM-DD). Defaults to the local calendar date.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Record the run but never send mail.
    #[arg(long)]
    no_notify: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

const DEFAULT_LOG_FILTER: &str = "info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn config_from(cli: &Cli) -> TrackerConfig {
    let mut config = TrackerConfig::from_env();
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Some(fixture) = &cli.fixture {
        config.fixture_path = Some(fixture.clone());
    }
    if cli.no_notify {
        config.mail = None;
    }
    config
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let config = config_from(&cli);
    let pipeline = build_pipeline(&config)?;
    let date = cli.date.unwrap_or_else(|| Local::now().date_naive());
    Ok(pipeline.run_once(date).await?)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let notification = match &summary.notification {
        NotificationStatus::NothingToSend => "nothing-to-send".to_string(),
        NotificationStatus::NotConfigured => "not-configured".to_string(),
        NotificationStatus::Sent { rows } => format!("sent({rows})"),
        NotificationStatus::Failed { error } => format!("failed({error})"),
    };
    println!(
        concat!(
            "run complete: run_id={} date={} listings={} new={} price_changed={} ",
            "unchanged={} alerts={} stored_rows={} notification={}"
        ),
        summary.run_id,
        summary.run_date,
        summary.observations,
        summary.counts.new,
        summary.counts.price_changed,
        summary.counts.unchanged,
        summary.alerts.len(),
        summary.stored_rows,
        notification
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(summary) => {
            if let Err(err) = print_summary(&summary, json) {
                error!(error = %err, "could not print run summary");
            }
            ExitCode::from(summary.exit_code())
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "run aborted");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn flags_override_store_fixture_and_mail() {
        let cli = Cli::parse_from([
            "dealwatch",
            "--store",
            "/tmp/history.csv",
            "--fixture",
            "fixtures/amazon-ca/sample/bundle.json",
            "--date",
            "2026-10-19",
            "--no-notify",
        ]);
        assert_eq!(cli.date, NaiveDate::from_ymd_opt(2026, 10, 19));
        let config = config_from(&cli);
        assert_eq!(config.store_path, PathBuf::from("/tmp/history.csv"));
        assert_eq!(
            config.fixture_path,
            Some(PathBuf::from("fixtures/amazon-ca/sample/bundle.json"))
        );
        assert!(config.mail.is_none());
    }
}
