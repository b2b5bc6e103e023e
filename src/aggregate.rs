use std::time::Instant;

use camino::Utf8Path;

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::config::OrganismConfig;
use crate::domain::{GenesetRecord, SourceTag};
use crate::error::RefineryError;
use crate::sources::{self, SourceProcessor};

/// Runs the enabled source processors for one organism and concatenates
/// their output in [`SourceTag::ALL`] order.
pub struct Aggregator {
    processors: Vec<Box<dyn SourceProcessor>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(sources::default_processors())
    }
}

impl Aggregator {
    pub fn new(processors: Vec<Box<dyn SourceProcessor>>) -> Self {
        Self { processors }
    }

    fn processor(&self, tag: SourceTag) -> Option<&dyn SourceProcessor> {
        self.processors
            .iter()
            .find(|processor| processor.tag() == tag)
            .map(|processor| processor.as_ref())
    }

    pub fn collect(
        &self,
        organism: &OrganismConfig,
        files: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<GenesetRecord>, RefineryError> {
        let mut all = Vec::new();
        for tag in organism.enabled_sources() {
            let processor = self.processor(tag).ok_or_else(|| {
                RefineryError::Config(format!(
                    "organism {} enables {tag} but no processor is registered for it",
                    organism.name
                ))
            })?;

            sink.event(ProgressEvent::new(
                Stage::Aggregate,
                format!("processing {tag} for {}", organism.name),
            ));
            let start = Instant::now();
            let records = processor.produce(organism, files).map_err(|err| match err {
                RefineryError::SourceProcessing { .. } => err,
                other => sources::processing_error(organism, tag, other.to_string()),
            })?;
            sink.event(
                ProgressEvent::new(
                    Stage::Aggregate,
                    format!("{tag} produced {} gene sets for {}", records.len(), organism.name),
                )
                .with_elapsed(start.elapsed()),
            );
            all.extend(records);
        }
        Ok(all)
    }
}
