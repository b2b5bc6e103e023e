//! Pushes change sets to Tribe.
//!
//! One [`SyncClient`] lives for a whole run. It owns the bearer token, refreshes
//! it under a lock when it expires or the server rejects it, and uploads the
//! records of a change set on a bounded pool of scoped threads. Every record is
//! independent: a failed upload is collected into the [`SyncReport`] and never
//! cancels its siblings.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::config::{OrganismConfig, TribeCredentials, TribeSettings};
use crate::detect::{self, ChangeDetector, SnapshotFetcher};
use crate::domain::{
    Change, ChangeKind, GenesetIdentity, GenesetRecord, RemoteGenesetSnapshot, UpdatePreference,
    Visibility,
};
use crate::error::{RefineryError, UploadError, UploadFailure};
use crate::http::RetryPolicy;
use crate::router::RemoteSink;
use crate::tribe::{GenesetPayload, SyncCredential, TribeApi};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Created { remote_id: String },
    Updated { remote_id: String },
    SkippedConflict { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub identity: GenesetIdentity,
    pub reason: String,
}

/// Per-organism result of a sync. Every list is ordered by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub organism: String,
    pub dry_run: bool,
    pub unchanged: usize,
    pub planned_creates: usize,
    pub planned_updates: usize,
    pub created: Vec<GenesetIdentity>,
    pub updated: Vec<GenesetIdentity>,
    pub skipped: Vec<SkippedRecord>,
    pub failures: Vec<UploadFailure>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.created.len() + self.updated.len() + self.skipped.len() + self.failures.len()
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub visibility: Visibility,
    pub update_preference: UpdatePreference,
    pub update_visibility: bool,
    pub creator: Option<String>,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub dry_run: bool,
}

impl From<&TribeSettings> for SyncOptions {
    fn from(settings: &TribeSettings) -> Self {
        Self {
            visibility: settings.visibility,
            update_preference: settings.update_preference,
            update_visibility: settings.update_visibility,
            creator: settings.creator.clone(),
            workers: settings.workers,
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: settings.retry_delay,
            },
            dry_run: settings.dry_run,
        }
    }
}

/// Token state shared by the upload workers.
enum TokenSlot {
    Empty,
    Ready(SyncCredential),
    /// A refresh was rejected; later workers fail fast instead of exchanging again.
    Rejected(String),
}

pub struct SyncClient<A: TribeApi> {
    api: A,
    credentials: TribeCredentials,
    options: SyncOptions,
    detector: ChangeDetector,
    credential: Mutex<TokenSlot>,
}

impl<A: TribeApi> SyncClient<A> {
    pub fn new(
        api: A,
        credentials: TribeCredentials,
        options: SyncOptions,
        detector: ChangeDetector,
    ) -> Self {
        Self {
            api,
            credentials,
            options,
            detector,
            credential: Mutex::new(TokenSlot::Empty),
        }
    }

    pub fn from_settings(api: A, credentials: TribeCredentials, settings: &TribeSettings) -> Self {
        Self::new(
            api,
            credentials,
            SyncOptions::from(settings),
            ChangeDetector::from_policy(settings.compare),
        )
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Exchanges the configured credentials for a fresh token and caches it.
    pub fn authenticate(&self) -> Result<SyncCredential, RefineryError> {
        let mut slot = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
        self.exchange(&mut slot)
    }

    /// Returns the cached token, refreshing it while the lock is held so that
    /// concurrent workers wait for a single exchange. Once a refresh has been
    /// rejected every caller gets the same error without another exchange.
    fn current_credential(&self) -> Result<SyncCredential, RefineryError> {
        let mut slot = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            TokenSlot::Ready(credential) if !credential.is_expired(Utc::now()) => {
                return Ok(credential.clone());
            }
            TokenSlot::Rejected(message) => return Err(RefineryError::Auth(message.clone())),
            TokenSlot::Ready(_) | TokenSlot::Empty => {}
        }
        self.exchange(&mut slot)
    }

    fn exchange(&self, slot: &mut TokenSlot) -> Result<SyncCredential, RefineryError> {
        match self.api.exchange_token(&self.credentials) {
            Ok(fresh) => {
                tracing::debug!(expires_at = %fresh.expires_at(), "obtained Tribe token");
                *slot = TokenSlot::Ready(fresh.clone());
                Ok(fresh)
            }
            Err(err) => {
                let message = match err {
                    RefineryError::Auth(message) => message,
                    other => other.to_string(),
                };
                tracing::error!(error = %message, "Tribe token exchange rejected");
                *slot = TokenSlot::Rejected(message.clone());
                Err(RefineryError::Auth(message))
            }
        }
    }

    /// Drops the cached token unless another worker already replaced it.
    fn invalidate(&self, stale: &SyncCredential) {
        let mut slot = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*slot, TokenSlot::Ready(current) if current.token() == stale.token()) {
            *slot = TokenSlot::Empty;
        }
    }

    pub fn snapshots(&self) -> TribeSnapshots<'_, A> {
        TribeSnapshots { client: self }
    }

    /// Performs one upload attempt for `change`.
    pub fn upload(
        &self,
        change: &Change,
        credential: &SyncCredential,
        visibility: Visibility,
        preference: UpdatePreference,
    ) -> Result<UploadOutcome, UploadError> {
        let token = credential.token();
        let record = &change.record;
        match &change.kind {
            ChangeKind::Create => self.create(token, record, visibility, preference),
            ChangeKind::Update {
                remote_id,
                remote_fingerprint,
            } => {
                if preference == UpdatePreference::PreferExisting {
                    match self.api.get_geneset(token, remote_id) {
                        Ok(current) if current.fingerprint != *remote_fingerprint => {
                            return Ok(UploadOutcome::SkippedConflict {
                                reason: format!("remote gene set {remote_id} changed since detection"),
                            });
                        }
                        Ok(_) => {}
                        Err(UploadError::NotFound(_)) => {
                            return Ok(UploadOutcome::SkippedConflict {
                                reason: format!("remote gene set {remote_id} was deleted since detection"),
                            });
                        }
                        Err(err) => return Err(err),
                    }
                }

                let payload =
                    GenesetPayload::for_update(record, visibility, self.options.update_visibility);
                match self.api.update_geneset(token, remote_id, &payload) {
                    Ok(()) => Ok(UploadOutcome::Updated {
                        remote_id: remote_id.clone(),
                    }),
                    Err(UploadError::NotFound(_)) if preference == UpdatePreference::PreferUpdate => {
                        tracing::info!(identity = %record.identity(), "remote gene set vanished, creating it");
                        self.create(token, record, visibility, preference)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    fn create(
        &self,
        token: &str,
        record: &GenesetRecord,
        visibility: Visibility,
        preference: UpdatePreference,
    ) -> Result<UploadOutcome, UploadError> {
        let payload = GenesetPayload::for_create(record, visibility);
        match self.api.create_geneset(token, &payload) {
            Ok(remote_id) => Ok(UploadOutcome::Created { remote_id }),
            Err(UploadError::Conflict(message)) => match preference {
                UpdatePreference::PreferExisting => Ok(UploadOutcome::SkippedConflict {
                    reason: format!("created remotely since detection: {message}"),
                }),
                UpdatePreference::PreferUpdate => {
                    self.overwrite_existing(token, record, visibility, message)
                }
            },
            Err(err) => Err(err),
        }
    }

    /// Another actor created the record after detection: look it up by
    /// identity and overwrite it.
    fn overwrite_existing(
        &self,
        token: &str,
        record: &GenesetRecord,
        visibility: Visibility,
        conflict: String,
    ) -> Result<UploadOutcome, UploadError> {
        let identity = record.identity();
        let existing = self
            .api
            .list_genesets(token, &record.organism, self.options.creator.as_deref())
            .map_err(|err| UploadError::Transport(err.to_string()))?
            .into_iter()
            .filter(|snapshot| snapshot.identity == identity)
            .min_by(|a, b| detect::compare_remote_ids(&a.remote_id, &b.remote_id));
        let Some(existing) = existing else {
            return Err(UploadError::Conflict(conflict));
        };
        tracing::info!(
            identity = %identity,
            remote_id = %existing.remote_id,
            "gene set created remotely, overwriting it"
        );
        let payload = GenesetPayload::for_update(record, visibility, self.options.update_visibility);
        self.api.update_geneset(token, &existing.remote_id, &payload)?;
        Ok(UploadOutcome::Updated {
            remote_id: existing.remote_id,
        })
    }

    /// Uploads one change, retrying transient failures with linear back-off
    /// and refreshing the token once on a 401.
    fn upload_with_retry(&self, change: &Change) -> Result<UploadOutcome, UploadFailure> {
        let identity = change.record.identity();
        let policy = self.options.retry;
        let mut attempts = 0u32;
        let mut refreshed = false;
        loop {
            attempts += 1;
            let credential = match self.current_credential() {
                Ok(credential) => credential,
                Err(RefineryError::Auth(message)) => {
                    return Err(UploadFailure {
                        identity,
                        attempts,
                        error: UploadError::Auth(message),
                    });
                }
                Err(err) => {
                    return Err(UploadFailure {
                        identity,
                        attempts,
                        error: UploadError::Auth(err.to_string()),
                    });
                }
            };
            match self.upload(
                change,
                &credential,
                self.options.visibility,
                self.options.update_preference,
            ) {
                Ok(outcome) => return Ok(outcome),
                Err(UploadError::Unauthorized) if !refreshed => {
                    tracing::debug!(identity = %identity, "token rejected, refreshing");
                    refreshed = true;
                    self.invalidate(&credential);
                }
                Err(err) if err.is_transient() && attempts <= policy.max_retries => {
                    tracing::debug!(identity = %identity, attempts, error = %err, "retrying upload");
                    thread::sleep(policy.delay_for(attempts - 1));
                }
                Err(error) => {
                    return Err(UploadFailure {
                        identity,
                        attempts,
                        error,
                    });
                }
            }
        }
    }

    /// Results are indexed by change position, never by completion order.
    /// A lost token stops every worker and fails the whole batch with `Auth`.
    fn upload_all(
        &self,
        changes: &[Change],
    ) -> Result<Vec<Result<UploadOutcome, UploadFailure>>, RefineryError> {
        let workers = self.options.workers.clamp(1, changes.len().max(1));
        let cursor = AtomicUsize::new(0);
        let halted = AtomicBool::new(false);
        let next = &cursor;
        let stop = &halted;
        let mut results: Vec<Option<Result<UploadOutcome, UploadFailure>>> =
            (0..changes.len()).map(|_| None).collect();

        thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        while !stop.load(Ordering::Acquire) {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            let Some(change) = changes.get(index) else {
                                break;
                            };
                            let result = self.upload_with_retry(change);
                            if let Err(UploadFailure {
                                error: UploadError::Auth(_),
                                ..
                            }) = &result
                            {
                                stop.store(true, Ordering::Release);
                            }
                            done.push((index, result));
                        }
                        done
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (index, result) in done {
                            results[index] = Some(result);
                        }
                    }
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
        });

        let mut uploaded = Vec::with_capacity(results.len());
        for result in results.into_iter().flatten() {
            if let Err(UploadFailure {
                error: UploadError::Auth(message),
                ..
            }) = &result
            {
                return Err(RefineryError::Auth(message.clone()));
            }
            uploaded.push(result);
        }
        Ok(uploaded)
    }

    /// Detects changes for one organism's records and uploads them.
    pub fn sync(
        &self,
        organism: &str,
        mut records: Vec<GenesetRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, RefineryError> {
        let start = Instant::now();
        for record in &mut records {
            record.public = self.options.visibility.is_public();
        }

        let changes = self.detector.detect(&records, &self.snapshots())?;
        let distinct = records
            .iter()
            .map(GenesetRecord::identity)
            .collect::<BTreeSet<_>>()
            .len();
        let mut report = SyncReport {
            organism: organism.to_string(),
            dry_run: self.options.dry_run,
            unchanged: distinct.saturating_sub(changes.len()),
            planned_creates: changes.creates().count(),
            planned_updates: changes.updates().count(),
            ..SyncReport::default()
        };

        if changes.is_empty() {
            sink.event(ProgressEvent::new(
                Stage::Detect,
                format!("annotations unchanged for {organism}"),
            ));
            return Ok(report);
        }
        sink.event(ProgressEvent::new(
            Stage::Detect,
            format!(
                "{organism}: {} to create, {} to update, {} unchanged ({} comparison)",
                report.planned_creates,
                report.planned_updates,
                report.unchanged,
                self.detector.policy_name()
            ),
        ));
        if self.options.dry_run {
            sink.event(ProgressEvent::new(
                Stage::Sync,
                format!("dry run: skipping {} uploads for {organism}", changes.len()),
            ));
            return Ok(report);
        }

        let results = self.upload_all(&changes.changes)?;
        for (change, result) in changes.changes.iter().zip(results) {
            let identity = change.record.identity();
            match result {
                Ok(UploadOutcome::Created { .. }) => report.created.push(identity),
                Ok(UploadOutcome::Updated { .. }) => report.updated.push(identity),
                Ok(UploadOutcome::SkippedConflict { reason }) => {
                    tracing::info!(identity = %identity, reason = %reason, "skipped conflicting gene set");
                    report.skipped.push(SkippedRecord { identity, reason });
                }
                Err(failure) => {
                    tracing::warn!(failure = %failure, "upload failed");
                    report.failures.push(failure);
                }
            }
        }
        report.created.sort();
        report.updated.sort();
        report.skipped.sort_by(|a, b| a.identity.cmp(&b.identity));
        report.failures.sort_by(|a, b| a.identity.cmp(&b.identity));

        sink.event(
            ProgressEvent::new(
                Stage::Sync,
                format!(
                    "{organism}: {} created, {} updated, {} skipped, {} failed",
                    report.created.len(),
                    report.updated.len(),
                    report.skipped.len(),
                    report.failures.len()
                ),
            )
            .with_elapsed(start.elapsed()),
        );
        Ok(report)
    }
}

impl<A: TribeApi> RemoteSink for SyncClient<A> {
    fn sync_organism(
        &self,
        organism: &OrganismConfig,
        records: Vec<GenesetRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, RefineryError> {
        self.sync(&organism.name, records, sink)
    }
}

/// Reads remote state through the client's shared token.
pub struct TribeSnapshots<'a, A: TribeApi> {
    client: &'a SyncClient<A>,
}

impl<A: TribeApi> SnapshotFetcher for TribeSnapshots<'_, A> {
    fn fetch(&self, organism: &str) -> Result<Vec<RemoteGenesetSnapshot>, RefineryError> {
        let credential = self.client.current_credential()?;
        self.client.api.list_genesets(
            credential.token(),
            organism,
            self.client.options.creator.as_deref(),
        )
    }
}
