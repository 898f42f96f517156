mod modules;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use stepflow_core::app::{Registry, Settings};
use stepflow_core::observability::init_logging;
use stepflow_core::schedule::CronSchedule;
use tracing::{error, info};

/// Runs step modules against their brokers until they finish or Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "stepflow", version, about)]
struct Cli {
    /// Step modules to load (memory, cron, retry). Path style is accepted.
    #[arg(required_unless_present = "cron", conflicts_with = "cron")]
    steps: Vec<String>,

    /// Only start this group.
    #[arg(short = 'G', long)]
    group: Option<String>,

    /// Print the job table after starting.
    #[arg(long)]
    print: bool,

    /// Directories searched for stepflow.toml.
    #[arg(short = 'P', long = "path", default_value = ".")]
    paths: Vec<PathBuf>,

    /// Print the next 10 fire times of a cron expression and exit.
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.paths) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("stepflow: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&settings.log);

    if let Some(expr) = &cli.cron {
        return print_schedule(expr);
    }
    run(&cli, settings).await
}

fn print_schedule(expr: &str) -> ExitCode {
    match CronSchedule::parse(expr) {
        Ok(schedule) => {
            println!("{expr} => {}", schedule.expr());
            for at in schedule.upcoming(&Local::now(), 10) {
                println!("  {}", at.format("%Y-%m-%d %H:%M:%S %a"));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("stepflow: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, settings: Settings) -> ExitCode {
    let registry = Registry::with_settings(settings);
    let group = cli.group.as_deref();

    let mut loaded = 0;
    for name in &cli.steps {
        match modules::load(name, &registry).await {
            Ok(true) => loaded += 1,
            Ok(false) => error!(
                module = %name,
                available = %modules::CATALOGUE.join(", "),
                "unknown step module"
            ),
            Err(e) => error!(module = %name, error = %e, "failed to load step module"),
        }
    }
    if loaded == 0 {
        error!("no step module loaded");
        return ExitCode::FAILURE;
    }

    let started = registry.start(group);
    info!(group = group.unwrap_or("*"), workers = started, "stepflow running");
    if cli.print {
        print!("{}", registry.render_jobs(group));
    }

    tokio::select! {
        _ = registry.wait(group) => {
            info!("all brokers shut down");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("interrupted, shutting down");
            registry.shutdown(None);
            registry.join(None).await;
        }
    }
    ExitCode::SUCCESS
}
