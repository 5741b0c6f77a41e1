//! CLI entrypoint for the SafePool scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use safepool_harness::structured_log::{self, LogEmitter};
use safepool_harness::{ScenarioReport, ScenarioRunner, scenarios};

/// Scenario and evidence tooling for the SafePool runtime.
#[derive(Debug, Parser)]
#[command(name = "safepool-harness")]
#[command(about = "Scenario harness for the SafePool runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Run scenarios and write a report.
    RunScenarios {
        /// Only run scenarios whose id contains this string.
        #[arg(long)]
        filter: Option<String>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output report path (markdown).
        #[arg(long)]
        report_md: Option<PathBuf>,
        /// Output report path (JSON). Printed to stdout when no report path is given.
        #[arg(long)]
        report_json: Option<PathBuf>,
        /// Run id used in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
        /// Optional fixed timestamp string for deterministic reports.
        #[arg(long)]
        timestamp: Option<String>,
        /// Enable the page-remap dangling detector where supported.
        #[arg(long)]
        dangling: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// Log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in scenarios::all() {
                println!(
                    "{:<24} {:<13} {}",
                    scenario.id,
                    scenario.indexing.as_str(),
                    scenario.property
                );
            }
        }
        Command::RunScenarios {
            filter,
            log,
            report_md,
            report_json,
            run_id,
            timestamp,
            dangling,
        } => {
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::sink(&run_id),
            };
            let runner = ScenarioRunner::new(dangling);
            let results = runner.run(filter.as_deref(), &mut emitter)?;
            drop(emitter);

            for r in &results {
                let status = if r.passed() { "PASS" } else { "FAIL" };
                eprintln!("[{status}] {}", r.id);
                if let Some(reason) = &r.failure {
                    eprintln!("       {reason}");
                }
            }

            let timestamp = timestamp.unwrap_or_else(structured_log::now_utc);
            let mut report = ScenarioReport::new("SafePool scenario report", timestamp, &run_id, results);
            if let Some(path) = &log {
                let content = std::fs::read(path)?;
                report.add_artifact(path.display().to_string(), &content);
            }

            if let Some(path) = &report_md {
                std::fs::write(path, report.to_markdown())?;
                eprintln!("Markdown report written to {}", path.display());
            }
            match &report_json {
                Some(path) => {
                    std::fs::write(path, report.to_json())?;
                    eprintln!("JSON report written to {}", path.display());
                }
                None if report_md.is_none() => println!("{}", report.to_json()),
                None => {}
            }

            eprintln!(
                "{} scenarios: {} passed, {} failed",
                report.summary.total, report.summary.passed, report.summary.failed
            );
            if !report.summary.all_passed() {
                std::process::exit(1);
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = structured_log::validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
