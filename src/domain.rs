use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RefineryError;

/// Annotation sources, in the order their gene sets are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "KEGG")]
    Kegg,
    #[serde(rename = "DO")]
    Do,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [SourceTag::Go, SourceTag::Kegg, SourceTag::Do];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Go => "GO",
            SourceTag::Kegg => "KEGG",
            SourceTag::Do => "DO",
        }
    }

    /// Key used for this source in organism and secrets files.
    pub fn config_key(&self) -> &'static str {
        match self {
            SourceTag::Go => "go",
            SourceTag::Kegg => "kegg",
            SourceTag::Do => "do",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = RefineryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GO" => Ok(SourceTag::Go),
            "KEGG" => Ok(SourceTag::Kegg),
            "DO" => Ok(SourceTag::Do),
            _ => Err(RefineryError::Config(format!("unknown source tag: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GenesetIdentity {
    pub organism: String,
    pub source: SourceTag,
    pub abbreviation: String,
}

impl fmt::Display for GenesetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organism, self.source, self.abbreviation)
    }
}

/// Content marker used to decide whether a gene set changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub genes: BTreeSet<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenesetRecord {
    pub organism: String,
    pub source: SourceTag,
    pub abbreviation: String,
    pub title: String,
    pub genes: BTreeSet<String>,
    pub version: Option<String>,
    pub public: bool,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl GenesetRecord {
    pub fn new(
        organism: impl Into<String>,
        source: SourceTag,
        abbreviation: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            organism: organism.into(),
            source,
            abbreviation: abbreviation.into(),
            title: title.into(),
            genes: BTreeSet::new(),
            version: None,
            public: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_genes<I, S>(mut self, genes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.genes = genes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn identity(&self) -> GenesetIdentity {
        GenesetIdentity {
            organism: self.organism.clone(),
            source: self.source,
            abbreviation: self.abbreviation.clone(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            genes: self.genes.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteGenesetSnapshot {
    pub remote_id: String,
    pub identity: GenesetIdentity,
    pub fingerprint: Fingerprint,
    pub title: String,
    pub metadata: BTreeMap<String, MetadataValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Create,
    Update {
        remote_id: String,
        remote_fingerprint: Fingerprint,
    },
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub record: GenesetRecord,
}

/// Records that must be pushed to Tribe, in local record order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn creates(&self) -> impl Iterator<Item = &Change> {
        self.changes
            .iter()
            .filter(|change| matches!(change.kind, ChangeKind::Create))
    }

    pub fn updates(&self) -> impl Iterator<Item = &Change> {
        self.changes
            .iter()
            .filter(|change| matches!(change.kind, ChangeKind::Update { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn from_public(public: bool) -> Self {
        if public {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Visibility::Public)
    }
}

/// What to do when the remote record moved between detection and upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePreference {
    PreferUpdate,
    PreferExisting,
}

impl UpdatePreference {
    pub fn from_prefer_update(prefer_update: bool) -> Self {
        if prefer_update {
            UpdatePreference::PreferUpdate
        } else {
            UpdatePreference::PreferExisting
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    RemoteSync,
    FlatFile,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::RemoteSync => write!(f, "remote-sync"),
            OutputMode::FlatFile => write!(f, "flat-file"),
        }
    }
}

impl FromStr for OutputMode {
    type Err = RefineryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "Tribe" | "tribe" | "remote-sync" => Ok(OutputMode::RemoteSync),
            "JSON file" | "json file" | "flat-file" => Ok(OutputMode::FlatFile),
            _ => Err(RefineryError::UnknownOutputMode(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_output_mode_aliases() {
        assert_eq!("Tribe".parse::<OutputMode>().unwrap(), OutputMode::RemoteSync);
        assert_eq!("remote-sync".parse::<OutputMode>().unwrap(), OutputMode::RemoteSync);
        assert_eq!("JSON file".parse::<OutputMode>().unwrap(), OutputMode::FlatFile);
        assert_eq!("flat-file".parse::<OutputMode>().unwrap(), OutputMode::FlatFile);
    }

    #[test]
    fn parse_output_mode_unknown() {
        let err = "both".parse::<OutputMode>().unwrap_err();
        assert_matches!(err, RefineryError::UnknownOutputMode(_));
    }

    #[test]
    fn fingerprint_ignores_gene_order() {
        let a = GenesetRecord::new("human", SourceTag::Go, "GO:1", "t").with_genes(["B", "A"]);
        let b = GenesetRecord::new("human", SourceTag::Go, "GO:1", "t").with_genes(["A", "B", "A"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn source_order_is_go_kegg_do() {
        let mut tags = vec![SourceTag::Do, SourceTag::Go, SourceTag::Kegg];
        tags.sort();
        assert_eq!(tags, SourceTag::ALL.to_vec());
    }
}
