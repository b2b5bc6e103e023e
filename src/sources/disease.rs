use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;

use crate::config::{DoSection, OrganismConfig};
use crate::domain::{GenesetRecord, SourceTag};
use crate::error::RefineryError;
use crate::fs_util;
use crate::sources::obo::Ontology;
use crate::sources::{SourceProcessor, insert_annotation, processing_error, within_bounds};

/// Disease Ontology terms from `doid.obo` plus a gene to DOID association table.
pub struct DoProcessor;

impl SourceProcessor for DoProcessor {
    fn tag(&self) -> SourceTag {
        SourceTag::Do
    }

    fn produce(
        &self,
        organism: &OrganismConfig,
        files: &Utf8Path,
    ) -> Result<Vec<GenesetRecord>, RefineryError> {
        let Some(section) = organism.disease_ontology.as_ref() else {
            return Ok(Vec::new());
        };
        let fail = |message: String| processing_error(organism, SourceTag::Do, message);

        let ontology = Ontology::load(&files.join(DoSection::OBO_FILE))
            .map_err(|err| fail(err.to_string()))?;
        let lines = fs_util::read_lines(&files.join(DoSection::ASSOCIATIONS_FILE))
            .map_err(|err| fail(err.to_string()))?;
        let direct = parse_associations(&lines).map_err(fail)?;

        let annotated = if section.propagate {
            ontology.propagate(&direct, false)
        } else {
            let mut resolved: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (id, genes) in direct {
                if let Some(term) = ontology.term(&id) {
                    resolved
                        .entry(term.id.clone())
                        .or_default()
                        .extend(genes);
                }
            }
            resolved
        };

        let records = annotated
            .into_iter()
            .filter(|(_, genes)| within_bounds(genes, section.min_genes, None))
            .filter_map(|(id, genes)| {
                let term = ontology.term(&id)?;
                let mut record = GenesetRecord::new(
                    organism.scientific_name.clone(),
                    SourceTag::Do,
                    term.id.clone(),
                    format!("DO-{}", term.name),
                )
                .with_genes(genes);
                record.version = ontology.version.clone();
                Some(record)
            })
            .collect();
        Ok(records)
    }
}

fn parse_associations(lines: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>, String> {
    let mut direct = BTreeMap::new();
    for (index, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut columns = line.split('\t');
        let (Some(gene), Some(term)) = (columns.next(), columns.next()) else {
            return Err(format!(
                "association line {} must be gene<TAB>DOID",
                index + 1
            ));
        };
        insert_annotation(&mut direct, term.trim(), gene.trim());
    }
    Ok(direct)
}
