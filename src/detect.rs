//! Decides which local gene sets must be created or updated remotely.
//!
//! The detector never talks to the network itself: remote state comes from an
//! injected [`SnapshotFetcher`], and "has this record changed" is answered by
//! an injected [`ChangePolicy`].

use std::collections::hash_map::Entry;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::{Change, ChangeKind, ChangeSet, GenesetIdentity, GenesetRecord, RemoteGenesetSnapshot};
use crate::error::RefineryError;

pub trait ChangePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_changed(&self, local: &GenesetRecord, remote: &RemoteGenesetSnapshot) -> bool;
}

/// Changed when the gene membership or the annotation version differ.
pub struct FingerprintPolicy;

impl ChangePolicy for FingerprintPolicy {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn has_changed(&self, local: &GenesetRecord, remote: &RemoteGenesetSnapshot) -> bool {
        local.genes != remote.fingerprint.genes || local.version != remote.fingerprint.version
    }
}

/// Like [`FingerprintPolicy`], but title and metadata edits also count.
pub struct ContentPolicy;

impl ChangePolicy for ContentPolicy {
    fn name(&self) -> &'static str {
        "content"
    }

    fn has_changed(&self, local: &GenesetRecord, remote: &RemoteGenesetSnapshot) -> bool {
        FingerprintPolicy.has_changed(local, remote)
            || local.title != remote.title
            || local.metadata != remote.metadata
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparePolicy {
    #[default]
    Fingerprint,
    Content,
}

impl ComparePolicy {
    pub fn comparator(self) -> Box<dyn ChangePolicy> {
        match self {
            ComparePolicy::Fingerprint => Box::new(FingerprintPolicy),
            ComparePolicy::Content => Box::new(ContentPolicy),
        }
    }
}

pub trait SnapshotFetcher {
    fn fetch(&self, organism: &str) -> Result<Vec<RemoteGenesetSnapshot>, RefineryError>;
}

pub struct ChangeDetector {
    policy: Box<dyn ChangePolicy>,
}

impl ChangeDetector {
    pub fn new(policy: Box<dyn ChangePolicy>) -> Self {
        Self { policy }
    }

    pub fn from_policy(policy: ComparePolicy) -> Self {
        Self::new(policy.comparator())
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Classifies each local record as create, update or unchanged.
    ///
    /// Fails closed: if remote state for any organism cannot be fetched, no
    /// change set is produced at all.
    pub fn detect(
        &self,
        local: &[GenesetRecord],
        fetcher: &dyn SnapshotFetcher,
    ) -> Result<ChangeSet, RefineryError> {
        let organisms = local
            .iter()
            .map(|record| record.organism.as_str())
            .collect::<BTreeSet<_>>();

        let mut remote = HashMap::new();
        for organism in organisms {
            let snapshots = fetcher.fetch(organism).map_err(|err| match err {
                RefineryError::Auth(_) | RefineryError::SnapshotFetch { .. } => err,
                other => RefineryError::SnapshotFetch {
                    organism: organism.to_string(),
                    message: other.to_string(),
                },
            })?;
            index_snapshots(&mut remote, snapshots);
        }

        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for record in local {
            let identity = record.identity();
            if !seen.insert(identity.clone()) {
                tracing::warn!(identity = %identity, "duplicate local gene set ignored");
                continue;
            }
            let kind = match remote.get(&identity) {
                None => ChangeKind::Create,
                Some(snapshot) if self.policy.has_changed(record, snapshot) => ChangeKind::Update {
                    remote_id: snapshot.remote_id.clone(),
                    remote_fingerprint: snapshot.fingerprint.clone(),
                },
                Some(_) => continue,
            };
            changes.push(Change {
                kind,
                record: record.clone(),
            });
        }
        Ok(ChangeSet { changes })
    }
}

/// Duplicate remote identities resolve to the smallest remote id.
fn index_snapshots(
    index: &mut HashMap<GenesetIdentity, RemoteGenesetSnapshot>,
    snapshots: Vec<RemoteGenesetSnapshot>,
) {
    for snapshot in snapshots {
        match index.entry(snapshot.identity.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
            }
            Entry::Occupied(mut slot) => {
                tracing::warn!(
                    identity = %snapshot.identity,
                    first = %slot.get().remote_id,
                    second = %snapshot.remote_id,
                    "remote holds duplicate gene sets"
                );
                if compare_remote_ids(&snapshot.remote_id, &slot.get().remote_id) == Ordering::Less {
                    slot.insert(snapshot);
                }
            }
        }
    }
}

/// Numeric ids compare as numbers so that "9" sorts before "10".
pub(crate) fn compare_remote_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{Fingerprint, SourceTag};

    struct FixedFetcher(Vec<RemoteGenesetSnapshot>);

    impl SnapshotFetcher for FixedFetcher {
        fn fetch(&self, organism: &str) -> Result<Vec<RemoteGenesetSnapshot>, RefineryError> {
            Ok(self
                .0
                .iter()
                .filter(|snapshot| snapshot.identity.organism == organism)
                .cloned()
                .collect())
        }
    }

    fn snapshot(remote_id: &str, record: &GenesetRecord) -> RemoteGenesetSnapshot {
        RemoteGenesetSnapshot {
            remote_id: remote_id.to_string(),
            identity: record.identity(),
            fingerprint: record.fingerprint(),
            title: record.title.clone(),
            metadata: record.metadata.clone(),
        }
    }

    fn go(id: &str, genes: &[&str]) -> GenesetRecord {
        GenesetRecord::new("human", SourceTag::Go, id, format!("GO-BP-{id}"))
            .with_genes(genes.iter().copied())
            .with_version("2021")
    }

    #[test]
    fn duplicate_remote_identity_uses_smallest_id() {
        let record = go("GO:1", &["A"]);
        let mut stale = snapshot("7", &record);
        stale.fingerprint = Fingerprint {
            genes: BTreeSet::new(),
            version: None,
        };
        let fetcher = FixedFetcher(vec![snapshot("10", &record), stale]);
        let changes = ChangeDetector::from_policy(ComparePolicy::Fingerprint)
            .detect(&[record], &fetcher)
            .unwrap();
        assert_matches!(
            &changes.changes[0].kind,
            ChangeKind::Update { remote_id, .. } if remote_id == "7"
        );
    }

    #[test]
    fn duplicate_local_identity_counted_once() {
        let record = go("GO:2", &["A"]);
        let changes = ChangeDetector::from_policy(ComparePolicy::Fingerprint)
            .detect(&[record.clone(), record], &FixedFetcher(Vec::new()))
            .unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn content_policy_sees_metadata_edits() {
        let record = go("GO:3", &["A"]);
        let mut remote = snapshot("1", &record);
        remote.metadata = BTreeMap::from([("namespace".to_string(), "old".into())]);
        assert!(!FingerprintPolicy.has_changed(&record, &remote));
        assert!(ContentPolicy.has_changed(&record, &remote));
    }

    #[test]
    fn compare_policy_parses_lowercase() {
        let policy: ComparePolicy = serde_json::from_str("\"content\"").unwrap();
        assert_eq!(policy, ComparePolicy::Content);
        assert_eq!(policy.comparator().name(), "content");
    }
}
