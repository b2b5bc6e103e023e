use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};

use crate::aggregate::Aggregator;
use crate::config::{ConfigLoader, OrganismConfig, ResolvedConfig, Secrets};
use crate::download::{self, Downloader};
use crate::error::RefineryError;
use crate::router::{FileSink, OutputRouter, RemoteSink, RouteOutcome};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Aggregate,
    Detect,
    Sync,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Aggregate => "aggregate",
            Stage::Detect => "detect",
            Stage::Sync => "sync",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress to the `tracing` subscriber installed by the binary.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(
                stage = %event.stage,
                elapsed_ms = elapsed_millis(elapsed),
                "{}",
                event.message
            ),
            None => tracing::info!(stage = %event.stage, "{}", event.message),
        }
    }
}

fn elapsed_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|event| event.message.clone()).collect())
            .unwrap_or_default()
    }
}

impl ProgressSink for CollectingSink {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrganismFailure {
    pub organism: String,
    pub stage: Stage,
    #[serde(serialize_with = "display_error")]
    pub error: RefineryError,
}

fn display_error<S: Serializer>(error: &RefineryError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Serialize)]
pub struct OrganismReport {
    pub organism: String,
    pub records: usize,
    pub outcome: RouteOutcome,
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub organisms: Vec<OrganismReport>,
    pub failures: Vec<OrganismFailure>,
    /// Set when an authentication failure cut the run short.
    pub stopped: bool,
}

impl RunReport {
    pub fn upload_failures(&self) -> usize {
        self.organisms
            .iter()
            .map(|report| match &report.outcome {
                RouteOutcome::Synced(sync) => sync.failures.len(),
                RouteOutcome::Written { .. } => 0,
            })
            .sum()
    }

    /// 0 ok, 1 organism failure, 2 configuration, 3 authentication, 4 upload failures.
    pub fn exit_code(&self) -> u8 {
        if self.failures.iter().any(|failure| failure.error.is_config()) {
            2
        } else if self.failures.iter().any(|failure| failure.error.is_auth()) {
            3
        } else if !self.failures.is_empty() {
            1
        } else if self.upload_failures() > 0 {
            4
        } else {
            0
        }
    }
}

/// Runs download, aggregation and routing for every configured organism.
pub struct Refinery<D: Downloader> {
    store: Store,
    species_files: Vec<Utf8PathBuf>,
    secrets: Secrets,
    downloader: D,
    aggregator: Aggregator,
}

impl<D: Downloader> Refinery<D> {
    pub fn new(config: &ResolvedConfig, secrets: Secrets, downloader: D, aggregator: Aggregator) -> Self {
        Self {
            store: Store::new(config.download_folder.clone()),
            species_files: config.species_files.clone(),
            secrets,
            downloader,
            aggregator,
        }
    }

    /// Loads every organism file up front so configuration mistakes surface
    /// before any download starts.
    pub fn load_organisms(&self) -> Result<Vec<OrganismConfig>, RefineryError> {
        self.species_files
            .iter()
            .map(|path| ConfigLoader::load_organism(path))
            .collect()
    }

    pub fn run<R: RemoteSink, W: FileSink>(
        &self,
        router: &OutputRouter<R, W>,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, RefineryError> {
        let organisms = self.load_organisms()?;
        let mut report = RunReport::default();

        for organism in &organisms {
            match self.run_organism(organism, router, sink) {
                Ok(organism_report) => report.organisms.push(organism_report),
                Err(failure) => {
                    tracing::error!(
                        organism = %failure.organism,
                        stage = %failure.stage,
                        error = %failure.error,
                        "organism failed"
                    );
                    let fatal = failure.error.is_auth();
                    report.failures.push(failure);
                    if fatal {
                        report.stopped = true;
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    pub fn run_organism<R: RemoteSink, W: FileSink>(
        &self,
        organism: &OrganismConfig,
        router: &OutputRouter<R, W>,
        sink: &dyn ProgressSink,
    ) -> Result<OrganismReport, OrganismFailure> {
        let fail = |stage: Stage| {
            move |error: RefineryError| OrganismFailure {
                organism: organism.name.clone(),
                stage,
                error,
            }
        };

        let start = Instant::now();
        sink.event(ProgressEvent::new(
            Stage::Download,
            format!("downloading annotation files for {}", organism.name),
        ));
        let files =
            download::download_organism_files(&self.downloader, &self.store, organism, &self.secrets)
                .map_err(fail(Stage::Download))?;
        sink.event(
            ProgressEvent::new(Stage::Download, format!("downloads ready in {files}"))
                .with_elapsed(start.elapsed()),
        );

        let records = self
            .aggregator
            .collect(organism, &files, sink)
            .map_err(fail(Stage::Aggregate))?;
        let count = records.len();

        let output_stage = match router {
            OutputRouter::RemoteSync(_) => Stage::Sync,
            OutputRouter::FlatFile(_) => Stage::Write,
        };
        let outcome = router
            .route(organism, records, sink)
            .map_err(fail(output_stage))?;

        Ok(OrganismReport {
            organism: organism.name.clone(),
            records: count,
            outcome,
        })
    }
}
