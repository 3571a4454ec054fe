//! Argos passive scanner CLI

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use argos_pscan::alerts::MemoryAlertStore;
use argos_pscan::config::{self, AppConfig};
use argos_pscan::history::MemoryHistory;
use argos_pscan::models::{Finding, Severity};
use argos_pscan::proxy::{har, InterceptProxy, Recorder};
use argos_pscan::pscan::PassiveScanner;
use argos_pscan::report;
use argos_pscan::rules::{self, RuleCatalog};

/// How long to wait for running rules after shutdown
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Argos passive scanner: scan proxied or archived traffic without sending
/// a single request of its own
#[derive(Parser)]
#[command(name = "argos-pscan", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ScanArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URL regexes that define the scope (repeatable); only in-scope
    /// traffic is scanned when set
    #[arg(long)]
    scope: Option<Vec<String>>,

    /// Number of passive scan worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Skip bodies larger than this many bytes (0 = no limit)
    #[arg(long)]
    max_body_size: Option<usize>,

    /// Disable a rule after it raised this many alerts (0 = no limit)
    #[arg(long)]
    max_alerts: Option<u32>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an intercept proxy and passively scan what passes through
    Proxy {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// JSON report written on exit
        #[arg(short, long, default_value = "argos_pscan.json")]
        output: String,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Passively scan every entry of a HAR file
    ScanHar {
        /// HAR file to import
        #[arg(short, long)]
        input: PathBuf,

        /// JSON report output path
        #[arg(short, long, default_value = "argos_pscan.json")]
        output: String,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// List built-in passive rules
    Rules,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "argos_pscan=debug"
    } else {
        "argos_pscan=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

fn print_banner() {
    let banner = r#"
    ╔═══════════════════════════════════════╗
    ║  🔱 ARGOS PANOPTES v0.1.0            ║
    ║  Passive Scanner                     ║
    ║  "El que todo lo ve"                 ║
    ╚═══════════════════════════════════════╝
    "#;
    println!("{}", banner.cyan());
}

fn print_summary(findings: &[Finding]) {
    let severities = [
        (Severity::Critical, "Critical"),
        (Severity::High, "High"),
        (Severity::Medium, "Medium"),
        (Severity::Low, "Low"),
        (Severity::Info, "Info"),
    ];

    println!("\n{}", "  Passive Scan Summary".bold());
    println!("  {}", "─".repeat(35));

    let mut builder = Builder::default();
    builder.push_record(["Severity", "Count"]);
    let mut counts = Vec::with_capacity(severities.len());
    for (severity, label) in &severities {
        let count = findings.iter().filter(|f| &f.severity == severity).count();
        counts.push(count);
        builder.push_record([label.to_string(), count.to_string()]);
    }
    builder.push_record(["Total".to_string(), findings.len().to_string()]);

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");

    println!(
        "\n  {} {} {} {} {}",
        format!("{} Critical", counts[0]).red().bold(),
        format!("{} High", counts[1]).bright_red(),
        format!("{} Medium", counts[2]).yellow(),
        format!("{} Low", counts[3]).blue(),
        format!("{} Info", counts[4]).white(),
    );
}

/// Config file (explicit, else `config/default.toml` when present) with CLI
/// overrides on top
fn resolve_config(args: &ScanArgs) -> argos_pscan::error::Result<AppConfig> {
    let mut app_config = match args.config.as_ref() {
        Some(path) => config::load_config(path)?,
        None => {
            let default_path = Path::new("config/default.toml");
            if default_path.exists() {
                config::load_config(default_path)?
            } else {
                AppConfig::default()
            }
        }
    };
    config::merge_cli_args(
        &mut app_config,
        args.threads,
        args.max_body_size,
        args.max_alerts,
        args.scope.clone(),
    )?;
    Ok(app_config)
}

struct Session {
    history: MemoryHistory,
    alerts: MemoryAlertStore,
    scanner: PassiveScanner,
}

fn build_session(app_config: AppConfig) -> argos_pscan::error::Result<Session> {
    let history = MemoryHistory::new();
    history.set_scope(&app_config.scope)?;
    let alerts = MemoryAlertStore::new();
    let catalog = Arc::new(RuleCatalog::with_rules(rules::builtin_rules()?)?);

    println!(
        "  {} {}",
        "Threads:".bold(),
        app_config.options.threads.to_string().cyan()
    );
    if !app_config.scope.is_empty() {
        println!("  {} {}", "Scope:".bold(), app_config.scope.join(", ").cyan());
    }

    let scanner = PassiveScanner::new(
        Arc::new(history.clone()),
        Arc::new(alerts.clone()),
        catalog,
        app_config.options,
    )?;
    Ok(Session {
        history,
        alerts,
        scanner,
    })
}

/// Stops the scanner, prints the summary and writes the report
fn finish(session: Session, output: &str) -> argos_pscan::error::Result<()> {
    session.scanner.shutdown();
    if !session.scanner.await_termination(TERMINATION_TIMEOUT) {
        if let Some(task) = session.scanner.current_rule() {
            warn!(
                "Rule '{}' still running on {} after {}ms",
                task.rule, task.url, task.elapsed_ms
            );
        }
    }

    let report = session.scanner.report(session.alerts.findings());
    print_summary(&report.findings);
    report::json::export(&report, Path::new(output))?;
    println!("\n  {} {}", "Report saved to:".bold(), output.green());
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy { port, output, scan } => {
            init_logging(scan.verbose);
            print_banner();

            let session = build_session(resolve_config(&scan)?)?;
            session.scanner.start()?;

            let recorder = Recorder::new(session.history.clone(), Some(session.scanner.waker()))?;
            let proxy = InterceptProxy::bind(port, recorder).await?;

            println!("  {} {}", "Proxy mode:".bold(), "Intercept Proxy".cyan());
            println!("  {} {}", "Listening:".bold(), proxy.local_addr()?.to_string().green());
            println!("  {} {}", "Output:".bold(), output.green());
            println!(
                "\n  {}",
                "Press Ctrl+C to stop, scan what is left and write the report.".yellow()
            );
            println!();

            tokio::select! {
                result = proxy.run() => {
                    if let Err(e) = result {
                        error!("Proxy stopped: {}", e);
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for ctrl+c: {}", e);
                    }
                    info!("Shutting down proxy...");
                }
            }

            info!("Captured {} transactions", session.history.len());
            finish(session, &output)?;
        }

        Commands::ScanHar {
            input,
            output,
            scan,
        } => {
            init_logging(scan.verbose);
            print_banner();

            let session = build_session(resolve_config(&scan)?)?;
            let imported = har::import_har(&input, &session.history)?;
            println!(
                "  {} {} ({} entries)\n",
                "Input:".bold(),
                input.display().to_string().green(),
                imported
            );

            session.scanner.start_at(1)?;

            let pb = ProgressBar::new(imported as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            loop {
                let backlog = session.scanner.records_to_scan();
                pb.set_position((imported as u64).saturating_sub(backlog));
                if let Some(task) = session.scanner.current_rule() {
                    pb.set_message(task.rule);
                }
                if backlog == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            pb.finish_with_message("done");

            finish(session, &output)?;
        }

        Commands::Rules => {
            print_banner();
            let catalog = RuleCatalog::with_rules(rules::builtin_rules()?)?;

            let mut builder = Builder::default();
            builder.push_record(["Id", "Name", "Kind", "Description"]);
            for entry in catalog.entries() {
                builder.push_record([
                    entry.id().to_string(),
                    entry.name().to_string(),
                    if entry.is_tag_rule() { "tag" } else { "alert" }.to_string(),
                    entry.rule().description().to_string(),
                ]);
            }
            let mut table = builder.build();
            table.with(Style::rounded());
            println!("  {}\n", "Built-in Passive Rules:".bold());
            println!("{table}");
        }
    }

    Ok(())
}
