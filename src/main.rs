use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use fault_localization::benchmark::{calculate_exam_score, run_benchmark, save_report};
use fault_localization::config::FaultConfig;
use fault_localization::coverage::{read_coverage_file, total_executable_statements};
use fault_localization::evidence::{filter_out_unexecuted, gather_file_results};
use fault_localization::faults::{read_fault_file, record_faults, sort_by_suspiciousness, Fault};
use fault_localization::messages::TestOutcome;
use fault_localization::sbfl::{localize_faults, Formula, IgnoreGlobs};
use fault_localization::sqlite;
use fault_localization::{FaultError, Result};

#[derive(Parser)]
#[command(name = "fault-localization")]
#[command(about = "Statement-level fault localization for test suites")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank statements from recorded test outcomes
    Localize {
        /// JSON array of test outcomes
        #[arg(short, long)]
        results: PathBuf,

        /// Suspiciousness formula
        #[arg(long, value_enum)]
        formula: Option<Formula>,

        /// dStar exponent
        #[arg(short, long)]
        exponent: Option<f64>,

        /// Source files to leave out (repeatable)
        #[arg(long = "ignore", value_name = "GLOB")]
        ignore: Vec<String>,

        /// Where to write the fault file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Optional path to SQLite database file (default: db/fault-localization.db)
        #[arg(long, value_name = "PATH")]
        sqlite: Option<Option<PathBuf>>,
    },
    /// EXAM score of a fault file against the expected faults
    Exam {
        #[arg(short, long)]
        actual: PathBuf,

        #[arg(short = 'x', long)]
        expected: PathBuf,

        /// Number of executable statements
        #[arg(short, long, conflicts_with = "coverage")]
        total: Option<usize>,

        /// Istanbul coverage file to count executable statements from
        #[arg(short, long)]
        coverage: Option<PathBuf>,
    },
    /// Score every formula against the expected faults
    Benchmark {
        #[arg(short, long)]
        results: PathBuf,

        #[arg(short = 'x', long)]
        expected: PathBuf,

        #[arg(short, long)]
        coverage: PathBuf,

        /// Project name used in the report
        #[arg(short, long, default_value = "project")]
        name: String,

        #[arg(long, default_value = "benchmark.json")]
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FaultConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Localize {
            results,
            formula,
            exponent,
            ignore,
            output,
            sqlite,
        } => {
            let formula = formula.unwrap_or(config.sbfl.formula);
            let exponent = exponent.unwrap_or(config.sbfl.dstar_exponent);
            let mut globs = config.sbfl.ignore_globs.clone();
            globs.extend(ignore);
            let ignore = IgnoreGlobs::new(&globs)?;

            let outcomes = read_outcomes(&results)?;
            let file_results = filter_out_unexecuted(gather_file_results(&outcomes));
            let mut faults =
                localize_faults(&outcomes, &file_results, &ignore, formula.scorer(exponent));
            sort_by_suspiciousness(&mut faults);

            let output = output.unwrap_or(config.fault_file.clone());
            record_faults(&output, &faults)?;
            println!(
                "Ranked {} statements with {} ({} tests), faults written to {}",
                faults.len(),
                formula.name(),
                outcomes.len(),
                output.display()
            );
            print_faults(&faults, 10);

            let db_path = match sqlite {
                Some(Some(path)) => Some(path),
                Some(None) => Some(PathBuf::from("db/fault-localization.db")),
                None => None,
            };
            if let Some(ref path) = db_path {
                let exit_code = if outcomes.iter().any(|o| !o.passed) { 1 } else { 0 };
                sqlite::check_db(path)?;
                let run_id = sqlite::store_run(path, formula.name(), exit_code)?;
                sqlite::store_outcomes(path, run_id, &outcomes)?;
                sqlite::store_faults(path, run_id, &faults)?;
                println!("Run {} stored in {}", run_id, path.display());
            }
        }
        Commands::Exam {
            actual,
            expected,
            total,
            coverage,
        } => {
            let total = match (total, coverage) {
                (Some(total), _) => total,
                (None, Some(coverage)) => {
                    total_executable_statements(&read_coverage_file(&coverage)?)
                }
                (None, None) => {
                    return Err(FaultError::InvalidInput(
                        "Either --total or --coverage is required".to_string(),
                    ))
                }
            };
            let actual = read_fault_file(&actual)?;
            let expected = read_fault_file(&expected)?;
            match calculate_exam_score(&actual, &expected, total) {
                Some(score) => println!("EXAM score: {:.6}", score),
                None => println!("EXAM score: n/a (no expected faults or statements)"),
            }
        }
        Commands::Benchmark {
            results,
            expected,
            coverage,
            name,
            report,
        } => {
            let outcomes = read_outcomes(&results)?;
            let expected = read_fault_file(&expected)?;
            let coverage = read_coverage_file(&coverage)?;
            let ignore = IgnoreGlobs::new(&config.sbfl.ignore_globs)?;

            let benchmark = run_benchmark(
                &name,
                &outcomes,
                &expected,
                &coverage,
                config.sbfl.dstar_exponent,
                &ignore,
            );
            for (formula, score) in &benchmark.scores {
                match score {
                    Some(score) => println!("{:<10} {:.6}", formula, score),
                    None => println!("{:<10} n/a", formula),
                }
            }
            save_report(&benchmark, &report)?;
            println!("Report saved to {}", report.display());
        }
    }

    Ok(())
}

fn read_outcomes(path: &Path) -> Result<Vec<TestOutcome>> {
    let content = std::fs::read_to_string(path)?;
    let outcomes: Vec<TestOutcome> = serde_json::from_str(&content)?;
    Ok(outcomes)
}

fn print_faults(faults: &[Fault], limit: usize) {
    for (rank, fault) in faults.iter().take(limit).enumerate() {
        let score = match fault.score {
            Some(score) => format!("{:.4}", score),
            None => "-".to_string(),
        };
        println!(
            "{:>3}. {}:{}:{} {}",
            rank + 1,
            fault.source_path,
            fault.location.start.line,
            fault.location.start.column,
            score
        );
    }
}
