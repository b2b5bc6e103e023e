use std::collections::HashMap;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use geneset_refinery::aggregate::Aggregator;
use geneset_refinery::app::{CollectingSink, ProgressSink, Refinery, Stage};
use geneset_refinery::config::{
    BasicAuth, Config, ConfigLoader, OrganismConfig, OutputSection, OutputTarget, ResolvedConfig,
    Secrets, SpeciesFiles, SpeciesSection,
};
use geneset_refinery::domain::{GenesetRecord, OutputMode};
use geneset_refinery::download::Downloader;
use geneset_refinery::error::RefineryError;
use geneset_refinery::output::FlatFileWriter;
use geneset_refinery::router::{FileSink, OutputRouter, RemoteSink, RouteOutcome};
use geneset_refinery::store::Store;
use geneset_refinery::sync::SyncReport;

const DOID_OBO: &str = "format-version: 1.2
data-version: doid/releases/2024-01-31

[Term]
id: DOID:4
name: disease

[Term]
id: DOID:162
name: cancer
is_a: DOID:4 ! disease
";

const HUMAN: &str = r#"{
    "name": "human",
    "scientific_name": "Homo sapiens",
    "do": { "obo_url": "mem://doid.obo", "associations_url": "mem://human-do.tsv" }
}"#;

const MOUSE: &str = r#"{
    "name": "mouse",
    "scientific_name": "Mus musculus",
    "kegg": { "organism_code": "mmu", "list_url": "mem://mmu-list", "link_url": "mem://mmu-link" }
}"#;

struct MockDownloader {
    files: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MockDownloader {
    fn new() -> Self {
        let files = [
            ("mem://doid.obo", DOID_OBO),
            ("mem://human-do.tsv", "7157\tDOID:162\n"),
            ("mem://mmu-list", "path:mmu00010\tGlycolysis - Mus musculus (house mouse)\n"),
            ("mem://mmu-link", "this line has no tab\n"),
        ]
        .into_iter()
        .map(|(url, body)| (url.to_string(), body.to_string()))
        .collect();
        Self {
            files,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Downloader for &MockDownloader {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        _auth: Option<&BasicAuth>,
    ) -> Result<(), RefineryError> {
        self.calls.lock().unwrap().push(url.to_string());
        let body = self
            .files
            .get(url)
            .ok_or_else(|| RefineryError::DownloadStatus {
                url: url.to_string(),
                status: 404,
            })?;
        Store::write_bytes_atomic(destination, body.as_bytes())
    }
}

#[derive(Default)]
struct MockRemote {
    fail_auth: bool,
    organisms: Mutex<Vec<String>>,
}

impl RemoteSink for MockRemote {
    fn sync_organism(
        &self,
        organism: &OrganismConfig,
        records: Vec<GenesetRecord>,
        _sink: &dyn ProgressSink,
    ) -> Result<SyncReport, RefineryError> {
        self.organisms.lock().unwrap().push(organism.name.clone());
        if self.fail_auth {
            return Err(RefineryError::Auth("token exchange returned status 401".to_string()));
        }
        Ok(SyncReport {
            organism: organism.name.clone(),
            planned_creates: records.len(),
            ..SyncReport::default()
        })
    }
}

struct UnusedWriter;

impl FileSink for UnusedWriter {
    fn write_organism(
        &self,
        _organism: &OrganismConfig,
        _records: &[GenesetRecord],
        _sink: &dyn ProgressSink,
    ) -> Result<Utf8PathBuf, RefineryError> {
        Err(RefineryError::Filesystem("writer must not be used".to_string()))
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new(species: &[(&str, &str)]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("species").as_std_path()).unwrap();
        for (name, body) in species {
            std::fs::write(root.join("species").join(name).as_std_path(), body).unwrap();
        }
        Self { _temp: temp, root }
    }

    fn config(&self, files: &[&str], output: OutputSection) -> ResolvedConfig {
        let config = Config {
            download_folder: Some("downloads".to_string()),
            secrets_file: None,
            species: SpeciesSection {
                dir: Some("species".to_string()),
                files: SpeciesFiles::List(files.iter().map(|file| file.to_string()).collect()),
            },
            output,
        };
        ConfigLoader::resolve_config(config, &self.root).unwrap()
    }

    fn flat_output(&self) -> OutputSection {
        OutputSection {
            mode: "JSON file".to_string(),
            json_file: Some(self.root.join("out").join("{organism}.json").to_string()),
            ..OutputSection::default()
        }
    }
}

fn tribe_output() -> OutputSection {
    OutputSection {
        mode: "Tribe".to_string(),
        tribe_url: Some("https://tribe.example.org".to_string()),
        ..OutputSection::default()
    }
}

#[test]
fn flat_file_run_continues_past_failing_organism() {
    let fixture = Fixture::new(&[("human.json", HUMAN), ("mouse.json", MOUSE)]);
    let config = fixture.config(&["mouse.json", "human.json"], fixture.flat_output());
    let OutputTarget::FlatFile(settings) = config.output.clone() else {
        panic!("expected flat-file target");
    };
    let router = OutputRouter::<MockRemote, FlatFileWriter>::for_mode(
        OutputMode::FlatFile,
        || Ok(MockRemote::default()),
        || Ok(FlatFileWriter::new(settings)),
    )
    .unwrap();
    let downloader = MockDownloader::new();
    let refinery = Refinery::new(&config, Secrets::default(), &downloader, Aggregator::default());
    let sink = CollectingSink::default();

    let report = refinery.run(&router, &sink).unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].organism, "mouse");
    assert_eq!(report.failures[0].stage, Stage::Aggregate);
    assert_matches!(report.failures[0].error, RefineryError::SourceProcessing { .. });
    assert_eq!(report.exit_code(), 1);

    assert_eq!(report.organisms.len(), 1);
    assert_matches!(
        &report.organisms[0].outcome,
        RouteOutcome::Written { records: 2, .. }
    );
    let written = std::fs::read_to_string(fixture.root.join("out/human.json").as_std_path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(value[0]["abbreviation"], "DOID:162");
    assert_eq!(value[0]["version"], "doid/releases/2024-01-31");
    assert!(fixture.root.join("downloads/human/doid.obo").as_std_path().exists());
    assert!(!sink.messages().is_empty());
}

#[test]
fn auth_failure_stops_the_run() {
    let second = HUMAN.replace("\"human\"", "\"human2\"");
    let fixture = Fixture::new(&[("human.json", HUMAN), ("human2.json", second.as_str())]);
    let config = fixture.config(&["human.json", "human2.json"], tribe_output());
    let router = OutputRouter::<MockRemote, UnusedWriter>::for_mode(
        OutputMode::RemoteSync,
        || {
            Ok(MockRemote {
                fail_auth: true,
                ..MockRemote::default()
            })
        },
        || Ok(UnusedWriter),
    )
    .unwrap();
    let downloader = MockDownloader::new();
    let refinery = Refinery::new(&config, Secrets::default(), &downloader, Aggregator::default());

    let report = refinery.run(&router, &CollectingSink::default()).unwrap();

    assert!(report.stopped);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Sync);
    assert_eq!(report.exit_code(), 3);
    let OutputRouter::RemoteSync(remote) = &router else {
        panic!("expected remote target");
    };
    assert_eq!(*remote.organisms.lock().unwrap(), vec!["human".to_string()]);
}

#[test]
fn remote_run_hands_aggregated_records_to_sync() {
    let fixture = Fixture::new(&[("human.json", HUMAN)]);
    let config = fixture.config(&["human.json"], tribe_output());
    let router = OutputRouter::<MockRemote, UnusedWriter>::for_mode(
        OutputMode::RemoteSync,
        || Ok(MockRemote::default()),
        || Ok(UnusedWriter),
    )
    .unwrap();
    let downloader = MockDownloader::new();
    let refinery = Refinery::new(&config, Secrets::default(), &downloader, Aggregator::default());

    let report = refinery.run(&router, &CollectingSink::default()).unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_matches!(
        &report.organisms[0].outcome,
        RouteOutcome::Synced(sync) if sync.planned_creates == 2
    );
}

#[test]
fn download_failure_is_reported_with_its_stage() {
    let broken = HUMAN.replace("mem://human-do.tsv", "mem://missing.tsv");
    let fixture = Fixture::new(&[("human.json", broken.as_str())]);
    let config = fixture.config(&["human.json"], tribe_output());
    let router = OutputRouter::<MockRemote, UnusedWriter>::for_mode(
        OutputMode::RemoteSync,
        || Ok(MockRemote::default()),
        || Ok(UnusedWriter),
    )
    .unwrap();
    let downloader = MockDownloader::new();
    let refinery = Refinery::new(&config, Secrets::default(), &downloader, Aggregator::default());

    let report = refinery.run(&router, &CollectingSink::default()).unwrap();

    assert_eq!(report.failures[0].stage, Stage::Download);
    assert_matches!(
        report.failures[0].error,
        RefineryError::DownloadStatus { status: 404, .. }
    );
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn invalid_organism_file_fails_before_any_download() {
    let fixture = Fixture::new(&[("human.json", HUMAN), ("broken.json", "{ \"name\": ")]);
    let config = fixture.config(&["human.json", "broken.json"], tribe_output());
    let router = OutputRouter::<MockRemote, UnusedWriter>::for_mode(
        OutputMode::RemoteSync,
        || Ok(MockRemote::default()),
        || Ok(UnusedWriter),
    )
    .unwrap();
    let downloader = MockDownloader::new();
    let refinery = Refinery::new(&config, Secrets::default(), &downloader, Aggregator::default());

    let err = refinery.run(&router, &CollectingSink::default()).unwrap_err();

    assert_matches!(err, RefineryError::ConfigParse(_));
    assert!(err.is_config());
    assert!(downloader.calls.lock().unwrap().is_empty());
}
