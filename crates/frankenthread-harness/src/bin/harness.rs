//! CLI entrypoint for the frankenthread verification harness.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use frankenthread_harness::report::{ReportFormat, RunSummary, write_summary};
use frankenthread_harness::scenarios::{self, SCENARIOS};

/// Property scenarios for the frankenthread runtime.
#[derive(Debug, Parser)]
#[command(name = "frankenthread-harness")]
#[command(about = "Run frankenthread property scenarios and report results")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every scenario with its description.
    List,
    /// Run scenarios and write a report.
    Run {
        /// Run only this scenario (repeatable); all scenarios when omitted.
        #[arg(long)]
        scenario: Vec<String>,
        /// Output report path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Output format: `json` (default) or `jsonl`.
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            let width = SCENARIOS.iter().map(|s| s.name.len()).max().unwrap_or(0);
            for scenario in SCENARIOS {
                println!("{:width$}  {}", scenario.name, scenario.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            scenario,
            output,
            format,
        } => {
            let format: ReportFormat = format.parse()?;
            let summary = if scenario.is_empty() {
                scenarios::run_all()
            } else {
                let selected = scenario
                    .iter()
                    .map(|name| scenarios::find(name))
                    .collect::<Result<Vec<_>, _>>()?;
                RunSummary::from_reports(selected.into_iter().map(scenarios::run_scenario).collect())
            };

            match &output {
                Some(path) => {
                    let mut out = BufWriter::new(File::create(path)?);
                    write_summary(&summary, format, &mut out)?;
                    out.flush()?;
                    eprintln!("Report written to {}", path.display());
                }
                None => write_summary(&summary, format, &mut std::io::stdout().lock())?,
            }

            for report in summary.reports.iter().filter(|r| r.details.get("error").is_some()) {
                eprintln!("FAIL {}: {}", report.name, report.details["error"]);
            }
            eprintln!(
                "{} scenarios: {} passed, {} failed",
                summary.total, summary.passed, summary.failed
            );
            Ok(if summary.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
