use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use cohort_core::batch::plan_for_all;
use cohort_core::cohort::{find_cohort, load_index_dates};
use cohort_core::sink::write_report;
use cohort_core::*;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cohortvars")]
#[command(about = "Derive study variables from multi-source clinical records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/cohortvars/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log level; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Csv,
    Jsonl,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive all variables for every subject in the data directory
    Derive {
        /// Cohort regime (prevax, vax, unvax or one from the config)
        #[arg(long)]
        cohort: Option<String>,

        /// Explicit index date (YYYY-MM-DD) instead of a cohort
        #[arg(long, value_parser = parse_date, conflicts_with = "cohort")]
        index: Option<NaiveDate>,

        /// Outcome end date used with --index
        #[arg(long, value_parser = parse_date, requires = "index")]
        end: Option<NaiveDate>,

        /// Exposure end date used with --index
        #[arg(long, value_parser = parse_date, requires = "index")]
        exposure_end: Option<NaiveDate>,

        /// Per-subject dates from a wide index-dates CSV (needs --cohort)
        #[arg(long, requires = "cohort")]
        index_dates: Option<PathBuf>,

        /// Variable table (TOML) to use instead of the built-in one
        #[arg(long)]
        variables: Option<PathBuf>,

        /// Output file (default: <data-dir>/output/input_<cohort>.<ext>)
        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Report file (default: <data-dir>/output/reports.jsonl)
        #[arg(long)]
        report: Option<PathBuf>,

        /// Worker threads (0 = one per core)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Validate code lists and the variable table
    Check {
        /// Variable table (TOML) to use instead of the built-in one
        #[arg(long)]
        variables: Option<PathBuf>,
    },

    /// List loaded code lists
    Codelists,
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    cohort_core::logging::init_with_level(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Commands::Derive {
            cohort,
            index,
            end,
            exposure_end,
            index_dates,
            variables,
            output,
            format,
            report,
            threads,
        } => {
            let dates = match index {
                Some(index) => DateSource::Explicit(
                    IndexDates::new(index, end).with_exposure_end(exposure_end),
                ),
                None => {
                    let name = cohort.ok_or_else(|| {
                        Error::Config("Either --cohort or --index is required".into())
                    })?;
                    match index_dates {
                        Some(path) => DateSource::File { cohort: name, path },
                        None => DateSource::Cohort(name),
                    }
                }
            };
            cmd_derive(
                &config,
                DeriveArgs {
                    dates,
                    variables,
                    output,
                    format,
                    report,
                    threads,
                },
            )
        }
        Commands::Check { variables } => cmd_check(&config, variables),
        Commands::Codelists => cmd_codelists(&config),
    }
}

enum DateSource {
    Explicit(IndexDates),
    Cohort(String),
    File { cohort: String, path: PathBuf },
}

struct DeriveArgs {
    dates: DateSource,
    variables: Option<PathBuf>,
    output: Option<PathBuf>,
    format: OutputFormat,
    report: Option<PathBuf>,
    threads: Option<usize>,
}

fn load_library(config: &Config) -> Result<CodeLibrary> {
    CodeLibrary::load_dir(
        &config.codelist_dir(),
        &config.codelists.code_column,
        config.codelists.category_column.as_deref(),
    )
}

fn load_table(config: &Config, variables: Option<PathBuf>) -> Result<VariableTable> {
    match variables.or_else(|| config.data.variables.clone()) {
        Some(path) => VariableTable::load_from(&path),
        None => Ok(get_default_table().clone()),
    }
}

fn cmd_derive(config: &Config, args: DeriveArgs) -> Result<()> {
    let data_dir = &config.data.data_dir;
    if !data_dir.is_dir() {
        return Err(Error::Config(format!(
            "Data directory {} does not exist",
            data_dir.display()
        )));
    }
    let library = load_library(config)?;
    let table = load_table(config, args.variables)?;
    let deriver = Deriver::new(&table, &library)?;
    let store = MemoryStore::load_dir(data_dir)?;

    let (label, plan) = match args.dates {
        DateSource::Explicit(dates) => ("custom".to_string(), plan_for_all(&store, dates)),
        DateSource::Cohort(name) => {
            let dates = find_cohort(&config.cohorts, &name)?.dates();
            let plan = plan_for_all(&store, dates);
            (name, plan)
        }
        DateSource::File { cohort, path } => {
            let plan = load_index_dates(&path, &cohort)?;
            (cohort, plan)
        }
    };

    let threads = args.threads.unwrap_or(config.batch.threads);
    let mut output = run_batch(&store, &deriver, &plan, threads)?;
    output.report.cohort = Some(label.clone());

    let output_dir = data_dir.join("output");
    let extension = match args.format {
        OutputFormat::Csv => "csv",
        OutputFormat::Jsonl => "jsonl",
    };
    let output_path = args
        .output
        .unwrap_or_else(|| output_dir.join(format!("input_{}.{}", label, extension)));
    let report_path = args
        .report
        .unwrap_or_else(|| output_dir.join("reports.jsonl"));

    let names = deriver.names();
    let mut sink: Box<dyn RowSink> = match args.format {
        OutputFormat::Csv => Box::new(CsvSink::new(&output_path)),
        OutputFormat::Jsonl => Box::new(JsonlSink::new(&output_path)),
    };
    sink.write_rows(&names, &output.rows)?;
    write_report(&report_path, &output.report)?;

    let report = &output.report;
    println!("✓ Derived {} variables for {} subjects ({})", names.len(), report.subjects, label);
    println!("  Output: {}", output_path.display());
    println!("  Report: {} (run {})", report_path.display(), report.run_id);
    if report.failed_subjects > 0 || report.degenerate_windows > 0 {
        println!(
            "  ⚠ {} subjects with failed values, {} degenerate windows",
            report.failed_subjects, report.degenerate_windows
        );
    }

    Ok(())
}

fn cmd_check(config: &Config, variables: Option<PathBuf>) -> Result<()> {
    let library = load_library(config)?;
    let table = load_table(config, variables)?;

    let errors = table.validate(&library);
    if !errors.is_empty() {
        eprintln!("Variable table validation errors:");
        for error in &errors {
            eprintln!("  - {}", error);
        }
        return Err(Error::Config(format!("{} validation errors", errors.len())));
    }

    println!(
        "✓ {} variables valid against {} code lists",
        table.variables.len(),
        library.len()
    );
    report_data_dir(&config.data.data_dir);
    Ok(())
}

fn report_data_dir(dir: &Path) {
    if !dir.is_dir() {
        println!("  ⚠ Data directory {} does not exist", dir.display());
    }
}

fn cmd_codelists(config: &Config) -> Result<()> {
    let library = load_library(config)?;
    if library.is_empty() {
        println!("No code lists found in {}", config.codelist_dir().display());
        return Ok(());
    }

    for name in library.names() {
        if let Some(set) = library.get(name) {
            let categories = set.categories();
            if categories.is_empty() {
                println!("{:<40} {:>6} codes", name, set.len());
            } else {
                println!(
                    "{:<40} {:>6} codes  [{}]",
                    name,
                    set.len(),
                    categories.join(", ")
                );
            }
        }
    }
    Ok(())
}
