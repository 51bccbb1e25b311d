use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use similar::TextDiff;
use wikimigrate_core::config::{self, MigrationConfig};
use wikimigrate_core::convert;
use wikimigrate_core::engine::{ConversionResult, PandocEngine};
use wikimigrate_core::export;
use wikimigrate_core::ledger;
use wikimigrate_core::migrate::{self, MigrateOptions, MigrationReport};

#[derive(Debug, Parser)]
#[command(
    name = "wikimigrate",
    version,
    about = "Migrate a MediaWiki wiki into Wiki.js, full revision history included"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Config file (default: wikimigrate.toml)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Convert every source page and push it into Wiki.js")]
    Migrate(MigrateArgs),
    #[command(about = "Convert every source page into a local directory tree")]
    Export(ExportArgs),
    #[command(about = "Convert one markup file and print the markdown")]
    Convert(ConvertArgs),
    #[command(about = "Show what the migration ledger recorded so far")]
    Status,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, help = "List the planned pages without converting or pushing")]
    dry_run: bool,
    #[arg(long, value_name = "N", help = "Stop after N pages")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, value_name = "DIR", help = "Export directory (default from config)")]
    out: Option<PathBuf>,
    #[arg(long, help = "List the planned pages without converting or writing")]
    dry_run: bool,
    #[arg(long, value_name = "N", help = "Stop after N pages")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    file: PathBuf,
    #[arg(long, help = "Print the repairs applied to the source markup")]
    diff: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_cli_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(&config, args),
        Some(Commands::Export(args)) => run_export(&config, args),
        Some(Commands::Convert(args)) => run_convert(&config, args),
        Some(Commands::Status) => run_status(&config),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn load_cli_config(path: Option<&Path>) -> Result<MigrationConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILENAME));
    config::load_config(&path)
}

fn run_migrate(config: &MigrationConfig, args: MigrateArgs) -> Result<()> {
    let options = MigrateOptions {
        dry_run: args.dry_run,
        limit: args.limit,
    };
    let report = migrate::run_migration(config, &options)?;
    print_report("migrate", &report);
    if !report.success {
        bail!("migration finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn run_export(config: &MigrationConfig, args: ExportArgs) -> Result<()> {
    let out_dir = args.out.unwrap_or_else(|| config.export_dir());
    let options = MigrateOptions {
        dry_run: args.dry_run,
        limit: args.limit,
    };
    let report = migrate::run_export(config, &out_dir, &options)?;
    print_report("export", &report);
    println!("export_dir: {}", normalize_path(&out_dir));
    let stats = export::scan_export_tree(&out_dir)?;
    println!("export.files: {}", stats.files);
    println!("export.total_bytes: {}", stats.total_bytes);
    if !report.success {
        bail!("export finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn run_convert(config: &MigrationConfig, args: ConvertArgs) -> Result<()> {
    let source = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let engine = PandocEngine::from_config(config);
    let outcome = convert::convert_document(&engine, &source)?;

    // The diff goes to stderr so the markdown on stdout stays clean for
    // piping into a file.
    if args.diff
        && let Some(repaired) = outcome.repaired_source.as_deref()
    {
        let diff = TextDiff::from_lines(source.as_str(), repaired);
        eprint!(
            "{}",
            diff.unified_diff()
                .context_radius(2)
                .header("source", "repaired")
        );
    }

    match outcome.result {
        ConversionResult::Converted { output } => {
            print!("{output}");
            if !output.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        ConversionResult::Failed { diagnostics } => {
            bail!(
                "conversion failed after {} attempt(s):\n{diagnostics}",
                outcome.attempts
            )
        }
    }
}

fn run_status(config: &MigrationConfig) -> Result<()> {
    let ledger_path = config.ledger_path();
    println!("migration status");
    println!("ledger: {}", normalize_path(&ledger_path));
    if ledger_path.exists() {
        let connection = ledger::open_ledger(&ledger_path)?;
        println!("ledger_exists: yes");
        println!("pages_recorded: {}", ledger::page_count(&connection)?);
        println!("failures_recorded: {}", ledger::failure_count(&connection)?);
        match ledger::get_ledger_config(&connection, migrate::LAST_MIGRATE_KEY)? {
            Some(value) => println!("last_migrate_unix: {value}"),
            None => println!("last_migrate_unix: n/a"),
        }
        let failures = ledger::recent_failures(&connection, 10)?;
        if !failures.is_empty() {
            println!("recent_failures:");
            for failure in &failures {
                println!("  - {} @ {}", failure.page_path, failure.timestamp);
            }
        }
    } else {
        println!("ledger_exists: no");
        println!("pages_recorded: 0");
        println!("failures_recorded: 0");
    }

    let export_dir = config.export_dir();
    let stats = export::scan_export_tree(&export_dir)?;
    println!("export_dir: {}", normalize_path(&export_dir));
    println!("export.files: {}", stats.files);
    println!("export.total_bytes: {}", stats.total_bytes);
    Ok(())
}

fn print_report(prefix: &str, report: &MigrationReport) {
    println!("{prefix} report");
    println!("success: {}", format_flag(report.success));
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("pages_total: {}", report.pages_total);
    println!("pages_migrated: {}", report.pages_migrated);
    println!("pages_failed: {}", report.pages_failed);
    println!("revisions_converted: {}", report.revisions_converted);
    println!("revisions_repaired: {}", report.revisions_repaired);
    println!("revisions_skipped: {}", report.revisions_skipped);
    println!("source_requests: {}", report.source_request_count);
    println!("store_requests: {}", report.store_request_count);
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("page.{}: {} ({detail})", page.action, page.path),
            None => println!("page.{}: {}", page.action, page.path),
        }
    }
    if !report.failures.is_empty() {
        println!("skipped_revisions:");
        for failure in &report.failures {
            println!("  - {} @ {}", failure.page_path, failure.timestamp);
        }
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
