//! Minimal OBO 1.2 reader covering what GO and DO gene sets need.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use camino::Utf8Path;
use regex::Regex;

use crate::error::RefineryError;
use crate::fs_util;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OboTerm {
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub is_a: Vec<String>,
    pub part_of: Vec<String>,
    pub alt_ids: Vec<String>,
    pub obsolete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Ontology {
    pub version: Option<String>,
    terms: BTreeMap<String, OboTerm>,
    alt_index: HashMap<String, String>,
}

fn relationship_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^relationship:\s*part_of\s+(\S+)").expect("static regex is valid")
    })
}

fn strip_comment(value: &str) -> &str {
    value.split(" !").next().unwrap_or(value).trim()
}

impl Ontology {
    pub fn load(path: &Utf8Path) -> Result<Self, RefineryError> {
        Ok(Self::parse(fs_util::read_lines(path)?))
    }

    pub fn parse<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut data_version = None;
        let mut date = None;
        let mut terms = BTreeMap::new();
        let mut current: Option<OboTerm> = None;
        let mut in_header = true;
        let mut in_term = false;

        for line in lines {
            let line = line.as_ref().trim();
            if line.starts_with('[') {
                in_header = false;
                if let Some(term) = current.take().filter(|term| !term.id.is_empty()) {
                    terms.insert(term.id.clone(), term);
                }
                in_term = line == "[Term]";
                if in_term {
                    current = Some(OboTerm::default());
                }
                continue;
            }
            if in_header {
                if let Some(value) = line.strip_prefix("data-version:") {
                    data_version = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("date:") {
                    date = Some(value.trim().to_string());
                }
                continue;
            }
            let Some(term) = current.as_mut().filter(|_| in_term) else {
                continue;
            };
            if let Some(value) = line.strip_prefix("id:") {
                term.id = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("name:") {
                term.name = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("namespace:") {
                term.namespace = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("is_a:") {
                term.is_a.push(strip_comment(value).to_string());
            } else if let Some(value) = line.strip_prefix("alt_id:") {
                term.alt_ids.push(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("is_obsolete:") {
                term.obsolete = value.trim() == "true";
            } else if let Some(caps) = relationship_re().captures(line) {
                term.part_of.push(caps[1].to_string());
            }
        }
        if let Some(term) = current.take().filter(|term| !term.id.is_empty()) {
            terms.insert(term.id.clone(), term);
        }

        let alt_index = terms
            .values()
            .filter(|term| !term.obsolete)
            .flat_map(|term| {
                term.alt_ids
                    .iter()
                    .map(move |alt| (alt.clone(), term.id.clone()))
            })
            .collect();

        Self {
            version: data_version.or(date),
            terms,
            alt_index,
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Resolves alternate ids to primary ids, hiding obsolete terms.
    pub fn term(&self, id: &str) -> Option<&OboTerm> {
        let id = self.alt_index.get(id).map(String::as_str).unwrap_or(id);
        self.terms.get(id).filter(|term| !term.obsolete)
    }

    pub fn ancestors(&self, id: &str, include_part_of: bool) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = match self.term(id) {
            Some(term) => parents(term, include_part_of),
            None => return seen,
        };
        while let Some(parent_id) = stack.pop() {
            let Some(parent) = self.term(&parent_id) else {
                continue;
            };
            if seen.insert(parent.id.clone()) {
                stack.extend(parents(parent, include_part_of));
            }
        }
        seen
    }

    /// Adds every term's genes to all of its ancestors.
    pub fn propagate(
        &self,
        direct: &BTreeMap<String, BTreeSet<String>>,
        include_part_of: bool,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut propagated: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, genes) in direct {
            let Some(term) = self.term(id) else {
                continue;
            };
            propagated
                .entry(term.id.clone())
                .or_default()
                .extend(genes.iter().cloned());
            for ancestor in self.ancestors(&term.id, include_part_of) {
                propagated
                    .entry(ancestor)
                    .or_default()
                    .extend(genes.iter().cloned());
            }
        }
        propagated
    }
}

fn parents(term: &OboTerm, include_part_of: bool) -> Vec<String> {
    let mut parents = term.is_a.clone();
    if include_part_of {
        parents.extend(term.part_of.iter().cloned());
    }
    parents
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "format-version: 1.2
data-version: releases/2024-01-17
date: 17:01:2024 10:00

[Term]
id: GO:0000001
name: root process
namespace: biological_process

[Term]
id: GO:0000002
name: middle process
namespace: biological_process
alt_id: GO:0000099
is_a: GO:0000001 ! root process

[Term]
id: GO:0000003
name: leaf process
namespace: biological_process
relationship: part_of GO:0000002 ! middle process

[Term]
id: GO:0000004
name: retired process
is_obsolete: true

[Typedef]
id: part_of
name: part of
";

    #[test]
    fn parses_terms_and_version() {
        let ontology = Ontology::parse(SAMPLE.lines());
        assert_eq!(ontology.version.as_deref(), Some("releases/2024-01-17"));
        assert_eq!(ontology.len(), 4);
        assert_eq!(ontology.term("GO:0000099").unwrap().id, "GO:0000002");
        assert!(ontology.term("GO:0000004").is_none());
        assert!(ontology.term("part_of").is_none());
    }

    #[test]
    fn ancestors_respect_part_of_flag() {
        let ontology = Ontology::parse(SAMPLE.lines());
        let with_part_of = ontology.ancestors("GO:0000003", true);
        assert_eq!(
            with_part_of.into_iter().collect::<Vec<_>>(),
            vec!["GO:0000001", "GO:0000002"]
        );
        assert!(ontology.ancestors("GO:0000003", false).is_empty());
    }

    #[test]
    fn propagation_reaches_root() {
        let ontology = Ontology::parse(SAMPLE.lines());
        let mut direct = BTreeMap::new();
        direct.insert(
            "GO:0000003".to_string(),
            BTreeSet::from(["A".to_string()]),
        );
        direct.insert(
            "GO:0000099".to_string(),
            BTreeSet::from(["B".to_string()]),
        );
        let propagated = ontology.propagate(&direct, true);
        assert_eq!(propagated["GO:0000001"].len(), 2);
        assert_eq!(propagated["GO:0000002"].len(), 2);
        assert_eq!(propagated["GO:0000003"].len(), 1);
    }
}
