use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geneset_refinery::aggregate::Aggregator;
use geneset_refinery::app::{Refinery, RunReport, TracingSink};
use geneset_refinery::config::{ConfigLoader, OutputTarget, Secrets, TribeCredentials};
use geneset_refinery::download::HttpDownloader;
use geneset_refinery::error::RefineryError;
use geneset_refinery::output::{FlatFileWriter, JsonOutput, ReportFormat};
use geneset_refinery::router::{OutputRouter, RouteOutcome};
use geneset_refinery::sync::SyncClient;
use geneset_refinery::tribe::TribeHttpClient;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "refinery")]
#[command(about = "Build GO, KEGG and Disease Ontology gene sets and publish them to Tribe or JSON files")]
#[command(version, author)]
struct Cli {
    /// Main configuration file (defaults to ./refinery.json).
    #[arg(short = 'i', long = "config")]
    config: Option<String>,

    /// Detect changes against Tribe without uploading anything.
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<RefineryError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &RefineryError) -> u8 {
    if error.is_config() {
        2
    } else if error.is_auth() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = if cli.json {
        ReportFormat::Json
    } else {
        ReportFormat::Human
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if cli.dry_run {
        match &mut config.output {
            OutputTarget::RemoteSync(settings) => settings.dry_run = true,
            OutputTarget::FlatFile(_) => {
                tracing::warn!("--dry-run only applies to Tribe output; ignoring it");
            }
        }
    }
    let secrets = Secrets::load(config.secrets_file.as_deref())?;

    let router = OutputRouter::for_mode(
        config.output.mode(),
        || match &config.output {
            OutputTarget::RemoteSync(settings) => {
                let credentials = TribeCredentials::resolve(&secrets)?;
                let api = TribeHttpClient::new(settings)?;
                Ok(SyncClient::from_settings(api, credentials, settings))
            }
            OutputTarget::FlatFile(_) => Err(RefineryError::Config(
                "Tribe output requested without Tribe settings".to_string(),
            )),
        },
        || match &config.output {
            OutputTarget::FlatFile(settings) => Ok(FlatFileWriter::new(settings.clone())),
            OutputTarget::RemoteSync(_) => Err(RefineryError::Config(
                "JSON file output requested without a json_file".to_string(),
            )),
        },
    )?;
    if let OutputRouter::RemoteSync(client) = &router {
        // Reject bad credentials before spending time on downloads.
        client.authenticate()?;
    }

    let downloader = HttpDownloader::new(DOWNLOAD_TIMEOUT)?;
    let refinery = Refinery::new(&config, secrets, downloader, Aggregator::default());
    let report = refinery.run(&router, &TracingSink)?;

    match format {
        ReportFormat::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        ReportFormat::Human => print_summary(&report),
    }
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}refinery summary{reset}");
    for organism in &report.organisms {
        match &organism.outcome {
            RouteOutcome::Written { path, records } => {
                println!("{green}{}: wrote {records} gene sets to {path}{reset}", organism.organism);
            }
            RouteOutcome::Synced(sync) if sync.dry_run => {
                println!(
                    "{cyan}{}: dry run, {} to create, {} to update, {} unchanged{reset}",
                    organism.organism, sync.planned_creates, sync.planned_updates, sync.unchanged
                );
            }
            RouteOutcome::Synced(sync) => {
                let color = if sync.has_failures() { yellow } else { green };
                println!(
                    "{color}{}: {} created, {} updated, {} skipped, {} failed, {} unchanged{reset}",
                    organism.organism,
                    sync.created.len(),
                    sync.updated.len(),
                    sync.skipped.len(),
                    sync.failures.len(),
                    sync.unchanged
                );
                for failure in &sync.failures {
                    println!("{red}   {failure}{reset}");
                }
            }
        }
    }
    for failure in &report.failures {
        println!(
            "{red}{}: {} failed: {}{reset}",
            failure.organism, failure.stage, failure.error
        );
    }
    if report.stopped {
        println!("{yellow}run stopped early after an authentication failure{reset}");
    }
}
