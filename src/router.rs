use camino::Utf8PathBuf;
use serde::Serialize;

use crate::app::ProgressSink;
use crate::config::OrganismConfig;
use crate::domain::{GenesetRecord, OutputMode};
use crate::error::RefineryError;
use crate::sync::SyncReport;

/// Destination that reconciles records with a remote repository.
pub trait RemoteSink {
    fn sync_organism(
        &self,
        organism: &OrganismConfig,
        records: Vec<GenesetRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, RefineryError>;
}

/// Destination that serializes records to disk.
pub trait FileSink {
    fn write_organism(
        &self,
        organism: &OrganismConfig,
        records: &[GenesetRecord],
        sink: &dyn ProgressSink,
    ) -> Result<Utf8PathBuf, RefineryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteOutcome {
    Synced(SyncReport),
    Written { path: Utf8PathBuf, records: usize },
}

/// Exactly one output target per run.
#[derive(Debug)]
pub enum OutputRouter<R, W> {
    RemoteSync(R),
    FlatFile(W),
}

impl<R: RemoteSink, W: FileSink> OutputRouter<R, W> {
    /// Builds only the target `mode` names; the other constructor never runs.
    pub fn for_mode<MR, MW>(
        mode: OutputMode,
        make_remote: MR,
        make_writer: MW,
    ) -> Result<Self, RefineryError>
    where
        MR: FnOnce() -> Result<R, RefineryError>,
        MW: FnOnce() -> Result<W, RefineryError>,
    {
        Ok(match mode {
            OutputMode::RemoteSync => OutputRouter::RemoteSync(make_remote()?),
            OutputMode::FlatFile => OutputRouter::FlatFile(make_writer()?),
        })
    }

    pub fn mode(&self) -> OutputMode {
        match self {
            OutputRouter::RemoteSync(_) => OutputMode::RemoteSync,
            OutputRouter::FlatFile(_) => OutputMode::FlatFile,
        }
    }

    pub fn route(
        &self,
        organism: &OrganismConfig,
        records: Vec<GenesetRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<RouteOutcome, RefineryError> {
        match self {
            OutputRouter::RemoteSync(remote) => remote
                .sync_organism(organism, records, sink)
                .map(RouteOutcome::Synced),
            OutputRouter::FlatFile(writer) => {
                let path = writer.write_organism(organism, &records, sink)?;
                Ok(RouteOutcome::Written {
                    path,
                    records: records.len(),
                })
            }
        }
    }
}
