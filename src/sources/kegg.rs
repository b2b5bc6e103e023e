use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use camino::Utf8Path;
use regex::Regex;

use crate::config::{KeggSection, OrganismConfig};
use crate::domain::{GenesetRecord, SourceTag};
use crate::error::RefineryError;
use crate::fs_util;
use crate::sources::{SourceProcessor, insert_annotation, processing_error, within_bounds};

/// KEGG pathways from the REST `list/pathway` and `link/pathway` tables.
pub struct KeggProcessor;

impl SourceProcessor for KeggProcessor {
    fn tag(&self) -> SourceTag {
        SourceTag::Kegg
    }

    fn produce(
        &self,
        organism: &OrganismConfig,
        files: &Utf8Path,
    ) -> Result<Vec<GenesetRecord>, RefineryError> {
        let Some(section) = organism.kegg.as_ref() else {
            return Ok(Vec::new());
        };
        let fail = |message: String| processing_error(organism, SourceTag::Kegg, message);

        let read = |name: &str| {
            fs_util::read_lines(&files.join(name)).map_err(|err| fail(err.to_string()))
        };

        let titles = parse_pathway_list(&read(KeggSection::LIST_FILE)?).map_err(fail)?;
        let links = parse_pathway_links(&read(KeggSection::LINK_FILE)?).map_err(fail)?;
        let version = if files.join(KeggSection::INFO_FILE).as_std_path().exists() {
            parse_release(&read(KeggSection::INFO_FILE)?)
        } else {
            tracing::warn!(
                organism = %organism.name,
                "KEGG release info unavailable, pathways carry no version"
            );
            None
        };

        let mut records = Vec::new();
        for (pathway, genes) in links {
            if !within_bounds(&genes, section.min_genes, None) {
                continue;
            }
            let Some(name) = titles.get(&pathway) else {
                tracing::warn!(pathway = %pathway, "KEGG link references unlisted pathway");
                continue;
            };
            let mut record = GenesetRecord::new(
                organism.scientific_name.clone(),
                SourceTag::Kegg,
                pathway.clone(),
                format!(
                    "KEGG-Pathway-{}",
                    strip_species_suffix(name, &organism.scientific_name)
                ),
            )
            .with_genes(genes)
            .with_metadata("kegg_organism", section.organism_code.trim());
            record.version = version.clone();
            records.push(record);
        }
        Ok(records)
    }
}

fn strip_prefix_tag(value: &str) -> &str {
    value.split_once(':').map(|(_, rest)| rest).unwrap_or(value)
}

fn parse_pathway_list(lines: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut titles = BTreeMap::new();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (id, name) = line
            .split_once('\t')
            .ok_or_else(|| format!("pathway list line {} is not tab-separated", index + 1))?;
        titles.insert(strip_prefix_tag(id.trim()).to_string(), name.trim().to_string());
    }
    Ok(titles)
}

fn parse_pathway_links(lines: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>, String> {
    let mut links = BTreeMap::new();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (gene, pathway) = line
            .split_once('\t')
            .ok_or_else(|| format!("pathway link line {} is not tab-separated", index + 1))?;
        insert_annotation(
            &mut links,
            strip_prefix_tag(pathway.trim()),
            strip_prefix_tag(gene.trim()),
        );
    }
    Ok(links)
}

fn release_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Release\s+([^,\s]+)").expect("static regex is valid"))
}

fn parse_release(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .find_map(|line| release_re().captures(line))
        .map(|caps| caps[1].to_string())
}

fn strip_species_suffix<'a>(name: &'a str, scientific_name: &str) -> &'a str {
    match name.rsplit_once(" - ") {
        Some((title, suffix)) if suffix.starts_with(scientific_name) => title,
        _ => name,
    }
}
