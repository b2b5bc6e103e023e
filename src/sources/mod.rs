//! Per-source gene set processors.
//!
//! Each processor reads the raw files the downloader placed in the organism's
//! cache directory and returns normalized [`GenesetRecord`]s.

pub mod disease;
pub mod go;
pub mod kegg;
pub mod obo;

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;

use crate::config::OrganismConfig;
use crate::domain::{GenesetRecord, SourceTag};
use crate::error::RefineryError;

pub use disease::DoProcessor;
pub use go::GoProcessor;
pub use kegg::KeggProcessor;

pub trait SourceProcessor: Send + Sync {
    fn tag(&self) -> SourceTag;

    fn produce(
        &self,
        organism: &OrganismConfig,
        files: &Utf8Path,
    ) -> Result<Vec<GenesetRecord>, RefineryError>;
}

pub fn default_processors() -> Vec<Box<dyn SourceProcessor>> {
    vec![
        Box::new(GoProcessor),
        Box::new(KeggProcessor),
        Box::new(DoProcessor),
    ]
}

pub(crate) fn processing_error(
    organism: &OrganismConfig,
    tag: SourceTag,
    message: impl Into<String>,
) -> RefineryError {
    RefineryError::SourceProcessing {
        organism: organism.name.clone(),
        source_tag: tag,
        message: message.into(),
    }
}

pub(crate) fn within_bounds(genes: &BTreeSet<String>, min: usize, max: Option<usize>) -> bool {
    genes.len() >= min.max(1) && max.is_none_or(|max| genes.len() <= max)
}

pub(crate) fn insert_annotation(
    direct: &mut BTreeMap<String, BTreeSet<String>>,
    term: &str,
    gene: &str,
) {
    direct
        .entry(term.to_string())
        .or_default()
        .insert(gene.to_string());
}
