use std::cell::Cell;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use geneset_refinery::app::{NullSink, ProgressSink};
use geneset_refinery::config::{FlatFileSettings, OrganismConfig};
use geneset_refinery::domain::{GenesetRecord, OutputMode, SourceTag};
use geneset_refinery::error::RefineryError;
use geneset_refinery::output::{FlatFileWriter, render_records};
use geneset_refinery::router::{FileSink, OutputRouter, RemoteSink, RouteOutcome};
use geneset_refinery::sync::SyncReport;

#[derive(Debug, Default)]
struct MockRemote {
    received: Mutex<Vec<usize>>,
}

impl RemoteSink for MockRemote {
    fn sync_organism(
        &self,
        organism: &OrganismConfig,
        records: Vec<GenesetRecord>,
        _sink: &dyn ProgressSink,
    ) -> Result<SyncReport, RefineryError> {
        self.received.lock().unwrap().push(records.len());
        Ok(SyncReport {
            organism: organism.name.clone(),
            ..SyncReport::default()
        })
    }
}

#[derive(Debug, Default)]
struct MockWriter {
    received: Mutex<Vec<usize>>,
}

impl FileSink for MockWriter {
    fn write_organism(
        &self,
        organism: &OrganismConfig,
        records: &[GenesetRecord],
        _sink: &dyn ProgressSink,
    ) -> Result<Utf8PathBuf, RefineryError> {
        self.received.lock().unwrap().push(records.len());
        Ok(Utf8PathBuf::from(format!("{}.json", organism.name)))
    }
}

fn records() -> Vec<GenesetRecord> {
    vec![
        GenesetRecord::new("Homo sapiens", SourceTag::Go, "GO:1", "GO-BP-a").with_genes(["A"]),
        GenesetRecord::new("Homo sapiens", SourceTag::Kegg, "hsa00010", "KEGG-Pathway-b")
            .with_genes(["B"]),
    ]
}

#[test]
fn remote_mode_never_builds_the_writer() {
    let writer_built = Cell::new(false);
    let router = OutputRouter::<MockRemote, MockWriter>::for_mode(
        OutputMode::RemoteSync,
        || Ok(MockRemote::default()),
        || {
            writer_built.set(true);
            Ok(MockWriter::default())
        },
    )
    .unwrap();

    let organism = OrganismConfig::new("human", "Homo sapiens");
    let outcome = router.route(&organism, records(), &NullSink).unwrap();

    assert!(!writer_built.get());
    assert_eq!(router.mode(), OutputMode::RemoteSync);
    assert_matches!(outcome, RouteOutcome::Synced(report) if report.organism == "human");
    let OutputRouter::RemoteSync(remote) = &router else {
        panic!("expected remote target");
    };
    assert_eq!(*remote.received.lock().unwrap(), vec![2]);
}

#[test]
fn flat_file_mode_never_builds_the_remote() {
    let remote_built = Cell::new(false);
    let router = OutputRouter::<MockRemote, MockWriter>::for_mode(
        OutputMode::FlatFile,
        || {
            remote_built.set(true);
            Ok(MockRemote::default())
        },
        || Ok(MockWriter::default()),
    )
    .unwrap();

    let organism = OrganismConfig::new("human", "Homo sapiens");
    let outcome = router.route(&organism, records(), &NullSink).unwrap();

    assert!(!remote_built.get());
    assert_eq!(
        outcome,
        RouteOutcome::Written {
            path: Utf8PathBuf::from("human.json"),
            records: 2
        }
    );
}

#[test]
fn construction_failure_is_propagated() {
    let result = OutputRouter::<MockRemote, MockWriter>::for_mode(
        OutputMode::RemoteSync,
        || Err(RefineryError::Auth("missing TRIBE_USERNAME".to_string())),
        || Ok(MockWriter::default()),
    );
    assert_matches!(result, Err(RefineryError::Auth(_)));
}

#[test]
fn flat_file_is_identical_for_permuted_input() {
    let mut forward = records();
    forward[0] = forward[0].clone().with_genes(["C", "A", "B"]);
    let mut backward = forward.clone();
    backward.reverse();

    assert_eq!(render_records(&forward).unwrap(), render_records(&backward).unwrap());
}

#[test]
fn flat_file_writer_substitutes_organism() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let writer = FlatFileWriter::new(FlatFileSettings {
        json_file: root.join("genesets-{organism}.json").to_string(),
    });

    let organism = OrganismConfig::new("mouse", "Mus musculus");
    let path = writer.write_organism(&organism, &records(), &NullSink).unwrap();

    assert_eq!(path, root.join("genesets-mouse.json"));
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
    let sources = value
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["source"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(sources, vec!["GO", "KEGG"]);
}
