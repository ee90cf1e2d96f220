use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use edustats::store::RecordStore;
use edustats::{BulkOptions, BulkReport, FileReportSink, Population, SqliteStore};

#[derive(Parser)]
#[command(name = "edustats", about = "School statistics recomputation")]
struct Cli {
    /// Directory holding the database and report artifacts.
    #[arg(long, default_value = "./edustats-data")]
    workspace: PathBuf,

    /// Snapshots younger than this many seconds are left alone.
    #[arg(long, default_value_t = 3600)]
    cooldown_secs: u64,

    /// Where report artifacts are written. Defaults to `reports/` inside
    /// the workspace.
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema and exit.
    Init,
    /// Recompute student statistics.
    RecomputeStudents {
        /// Recompute even when the snapshot is within the cooldown window.
        #[arg(long)]
        force: bool,
        /// Restrict the run to one teacher's students.
        #[arg(long)]
        teacher: Option<String>,
    },
    /// Recompute teacher roster statistics.
    RecomputeTeachers {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.workspace);

    let (population, force) = match cli.command {
        Command::Init => {
            store.ensure_connected()?;
            println!("database ready at {}", store.db_path().display());
            return Ok(());
        }
        Command::RecomputeStudents {
            force,
            teacher: Some(teacher_id),
        } => (Population::TeacherStudents { teacher_id }, force),
        Command::RecomputeStudents {
            force,
            teacher: None,
        } => (Population::ActiveStudents, force),
        Command::RecomputeTeachers { force } => (Population::ActiveTeachers, force),
    };

    let options = BulkOptions {
        force_update: force,
        cooldown: Duration::from_secs(cli.cooldown_secs),
        ..BulkOptions::default()
    };
    let reports_dir = cli
        .reports_dir
        .unwrap_or_else(|| cli.workspace.join("reports"));
    let sink = FileReportSink::new(&reports_dir);

    let report = edustats::recompute(&mut store, &population, &options, &sink)?;
    print_summary(&report);
    Ok(())
}

fn print_summary(report: &BulkReport) {
    let label = report.entity_label.to_lowercase();
    println!("{}s processed: {}", label, report.total);
    println!("  updated:      {}", report.updated);
    println!("  skipped:      {}", report.skipped);
    println!("  without data: {}", report.without_data);
    if !report.failures.is_empty() {
        println!("  failed:       {}", report.failures.len());
        for failure in &report.failures {
            println!("    {} ({}): {}", failure.entity_name, failure.entity_id, failure.error);
        }
    }
    if let Some(path) = &report.artifact {
        println!("report: {}", path.display());
    }
}
