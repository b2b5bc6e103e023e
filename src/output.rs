use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::app::{ProgressEvent, ProgressSink, RunReport, Stage};
use crate::config::{FlatFileSettings, OrganismConfig};
use crate::domain::GenesetRecord;
use crate::error::RefineryError;
use crate::router::FileSink;
use crate::store::Store;

/// Writes one JSON array of gene sets per organism.
#[derive(Debug, Clone)]
pub struct FlatFileWriter {
    settings: FlatFileSettings,
}

impl FlatFileWriter {
    pub fn new(settings: FlatFileSettings) -> Self {
        Self { settings }
    }
}

impl FileSink for FlatFileWriter {
    fn write_organism(
        &self,
        organism: &OrganismConfig,
        records: &[GenesetRecord],
        sink: &dyn ProgressSink,
    ) -> Result<Utf8PathBuf, RefineryError> {
        let path = self.settings.path_for(&organism.name);
        let bytes = render_records(records)?;
        Store::write_bytes_atomic(&path, &bytes)?;
        sink.event(ProgressEvent::new(
            Stage::Write,
            format!("wrote {} gene sets for {} to {path}", records.len(), organism.name),
        ));
        Ok(path)
    }
}

/// Serializes records deterministically: records ordered by identity, keys
/// sorted, genes sorted, metadata flattened into each object. The `public`
/// flag is a sync-time concern and is never written.
pub fn render_records(records: &[GenesetRecord]) -> Result<Vec<u8>, RefineryError> {
    let mut ordered = records.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|record| record.identity());

    let array = ordered
        .into_iter()
        .map(record_object)
        .collect::<Result<Vec<_>, _>>()?;
    let mut bytes = serde_json::to_vec_pretty(&Value::Array(array))
        .map_err(|err| RefineryError::Serialization(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn record_object(record: &GenesetRecord) -> Result<Value, RefineryError> {
    let mut object = Map::new();
    for (key, value) in &record.metadata {
        let value = serde_json::to_value(value)
            .map_err(|err| RefineryError::Serialization(err.to_string()))?;
        object.insert(key.clone(), value);
    }
    object.insert("organism".to_string(), Value::from(record.organism.as_str()));
    object.insert("source".to_string(), Value::from(record.source.as_str()));
    object.insert("abbreviation".to_string(), Value::from(record.abbreviation.as_str()));
    object.insert("title".to_string(), Value::from(record.title.as_str()));
    object.insert(
        "genes".to_string(),
        Value::Array(record.genes.iter().map(|gene| Value::from(gene.as_str())).collect()),
    );
    if let Some(version) = &record.version {
        object.insert("version".to_string(), Value::from(version.as_str()));
    }
    Ok(Value::Object(object))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceTag;

    #[test]
    fn metadata_is_flattened_and_public_omitted() {
        let mut record = GenesetRecord::new("Homo sapiens", SourceTag::Go, "GO:1", "GO-BP-x")
            .with_genes(["b", "a"])
            .with_metadata("namespace", "biological_process");
        record.public = true;
        let text = String::from_utf8(render_records(&[record]).unwrap()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        let object = value[0].as_object().unwrap();
        assert_eq!(object["namespace"], "biological_process");
        assert_eq!(object["genes"], serde_json::json!(["a", "b"]));
        assert!(object.get("public").is_none());
        assert!(object.get("version").is_none());
    }

    #[test]
    fn fixed_fields_win_over_metadata() {
        let record = GenesetRecord::new("Homo sapiens", SourceTag::Do, "DOID:4", "DO-disease")
            .with_metadata("title", "shadow");
        let value: Value = serde_json::from_slice(&render_records(&[record]).unwrap()).unwrap();
        assert_eq!(value[0]["title"], "DO-disease");
    }
}
