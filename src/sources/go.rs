use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;

use camino::Utf8Path;

use crate::config::{GoSection, OrganismConfig};
use crate::domain::{GenesetRecord, SourceTag};
use crate::error::RefineryError;
use crate::fs_util;
use crate::sources::obo::Ontology;
use crate::sources::{SourceProcessor, insert_annotation, processing_error, within_bounds};

/// Gene Ontology terms built from an OBO ontology and a GAF annotation file.
pub struct GoProcessor;

impl SourceProcessor for GoProcessor {
    fn tag(&self) -> SourceTag {
        SourceTag::Go
    }

    fn produce(
        &self,
        organism: &OrganismConfig,
        files: &Utf8Path,
    ) -> Result<Vec<GenesetRecord>, RefineryError> {
        let Some(section) = organism.go.as_ref() else {
            return Ok(Vec::new());
        };
        let ontology = Ontology::load(&files.join(GoSection::OBO_FILE))
            .map_err(|err| processing_error(organism, SourceTag::Go, err.to_string()))?;
        if ontology.is_empty() {
            return Err(processing_error(
                organism,
                SourceTag::Go,
                "ontology file contains no terms",
            ));
        }
        let reader = fs_util::open_lines(&files.join(section.gaf_file()))
            .map_err(|err| processing_error(organism, SourceTag::Go, err.to_string()))?;
        let direct = read_gaf(reader, section)
            .map_err(|message| processing_error(organism, SourceTag::Go, message))?;

        let propagated = ontology.propagate(&direct, section.include_part_of);
        let mut records = Vec::new();
        for (id, genes) in propagated {
            if !within_bounds(&genes, section.min_genes, section.max_genes) {
                continue;
            }
            let Some(term) = ontology.term(&id) else {
                continue;
            };
            let namespace = term.namespace.as_deref().unwrap_or("unknown");
            let mut record = GenesetRecord::new(
                organism.scientific_name.clone(),
                SourceTag::Go,
                term.id.clone(),
                format!("GO-{}-{}", namespace_code(namespace), term.name),
            )
            .with_genes(genes)
            .with_metadata("namespace", namespace);
            record.version = ontology.version.clone();
            records.push(record);
        }
        tracing::debug!(organism = %organism.name, count = records.len(), "built GO gene sets");
        Ok(records)
    }
}

fn namespace_code(namespace: &str) -> &str {
    match namespace {
        "biological_process" => "BP",
        "molecular_function" => "MF",
        "cellular_component" => "CC",
        other => other,
    }
}

/// Direct term to gene annotations, skipping `NOT` rows and filtered evidence.
fn read_gaf<R: BufRead>(
    reader: R,
    section: &GoSection,
) -> Result<BTreeMap<String, BTreeSet<String>>, String> {
    let allowed: Option<BTreeSet<&str>> = section
        .evidence_codes
        .as_ref()
        .map(|codes| codes.iter().map(String::as_str).collect());
    let mut direct = BTreeMap::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| format!("read annotations: {err}"))?;
        if line.starts_with('!') || line.trim().is_empty() {
            continue;
        }
        let columns = line.split('\t').collect::<Vec<_>>();
        if columns.len() < 7 {
            return Err(format!(
                "annotation line {} has {} columns, expected at least 7",
                index + 1,
                columns.len()
            ));
        }
        if columns[3].split('|').any(|qualifier| qualifier == "NOT") {
            continue;
        }
        if let Some(allowed) = &allowed {
            if !allowed.contains(columns[6]) {
                continue;
            }
        }
        let gene = if section.use_symbols {
            columns[2]
        } else {
            columns[1]
        };
        if gene.is_empty() {
            continue;
        }
        insert_annotation(&mut direct, columns[4], gene);
    }
    Ok(direct)
}
