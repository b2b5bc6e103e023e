use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::{TribeCredentials, TribeSettings};
use crate::domain::{
    Fingerprint, GenesetIdentity, GenesetRecord, MetadataValue, RemoteGenesetSnapshot, SourceTag,
    Visibility,
};
use crate::error::{RefineryError, UploadError};
use crate::http::{self, RetryPolicy};

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
const EXPIRY_SKEW_SECS: i64 = 30;

/// Bearer token for one run. Never written to disk.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncCredential {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl SyncCredential {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Treats tokens about to expire as already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + TimeDelta::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

impl fmt::Debug for SyncCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body of create and update calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenesetPayload {
    pub organism: String,
    pub source: SourceTag,
    pub abbreviation: String,
    pub title: String,
    pub genes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub metadata: BTreeMap<String, MetadataValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
}

impl GenesetPayload {
    fn from_record(record: &GenesetRecord, public: Option<bool>) -> Self {
        Self {
            organism: record.organism.clone(),
            source: record.source,
            abbreviation: record.abbreviation.clone(),
            title: record.title.clone(),
            genes: record.genes.iter().cloned().collect(),
            version: record.version.clone(),
            metadata: record.metadata.clone(),
            public,
        }
    }

    pub fn for_create(record: &GenesetRecord, visibility: Visibility) -> Self {
        Self::from_record(record, Some(visibility.is_public()))
    }

    /// Existing records keep their visibility unless `update_visibility` is set.
    pub fn for_update(record: &GenesetRecord, visibility: Visibility, update_visibility: bool) -> Self {
        Self::from_record(record, update_visibility.then(|| visibility.is_public()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RemoteId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(value) => write!(f, "{value}"),
            RemoteId::Text(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteGeneset {
    id: RemoteId,
    organism: String,
    source: String,
    abbreviation: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    genes: Vec<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, MetadataValue>,
}

impl RemoteGeneset {
    fn into_snapshot(self) -> Option<RemoteGenesetSnapshot> {
        let source = self.source.parse::<SourceTag>().ok()?;
        Some(RemoteGenesetSnapshot {
            remote_id: self.id.to_string(),
            identity: GenesetIdentity {
                organism: self.organism,
                source,
                abbreviation: self.abbreviation,
            },
            fingerprint: Fingerprint {
                genes: self.genes.into_iter().collect::<BTreeSet<_>>(),
                version: self.version,
            },
            title: self.title,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    meta: ListMeta,
    #[serde(default)]
    objects: Vec<RemoteGeneset>,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: RemoteId,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// The record was stored, so an unreadable body must not be retried as a
/// transient failure: that would create a duplicate.
fn created_id(status: u16, body: &str) -> Result<String, UploadError> {
    serde_json::from_str::<CreatedResponse>(body)
        .map(|created| created.id.to_string())
        .map_err(|err| UploadError::Rejected {
            status,
            message: format!("create succeeded but the response has no readable id: {err}"),
        })
}

/// The Tribe REST surface the sync client relies on.
pub trait TribeApi: Send + Sync {
    fn exchange_token(&self, credentials: &TribeCredentials) -> Result<SyncCredential, RefineryError>;

    fn list_genesets(
        &self,
        token: &str,
        organism: &str,
        creator: Option<&str>,
    ) -> Result<Vec<RemoteGenesetSnapshot>, RefineryError>;

    fn get_geneset(&self, token: &str, remote_id: &str) -> Result<RemoteGenesetSnapshot, UploadError>;

    fn create_geneset(&self, token: &str, payload: &GenesetPayload) -> Result<String, UploadError>;

    fn update_geneset(
        &self,
        token: &str,
        remote_id: &str,
        payload: &GenesetPayload,
    ) -> Result<(), UploadError>;
}

#[derive(Clone)]
pub struct TribeHttpClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    page_size: usize,
}

impl TribeHttpClient {
    pub fn new(settings: &TribeSettings) -> Result<Self, RefineryError> {
        Ok(Self {
            client: http::build_client(settings.timeout)?,
            base_url: settings.url.trim_end_matches('/').to_string(),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: settings.retry_delay,
            },
            page_size: 200,
        })
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/token/", self.base_url)
    }

    fn genesets_url(&self) -> String {
        format!("{}/api/v1/geneset/", self.base_url)
    }

    fn geneset_url(&self, remote_id: &str) -> String {
        format!("{}/api/v1/geneset/{remote_id}/", self.base_url)
    }

    fn check_upload_status(response: Response) -> Result<Response, UploadError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "Tribe request failed".to_string());
        Err(UploadError::from_status(status, message))
    }
}

impl TribeApi for TribeHttpClient {
    fn exchange_token(&self, credentials: &TribeCredentials) -> Result<SyncCredential, RefineryError> {
        let url = self.token_url();
        let form = [
            ("grant_type", "password"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ];
        let response = http::send_with_retries(self.retry, || self.client.post(&url).form(&form))
            .map_err(|err| RefineryError::Auth(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            return Err(RefineryError::Auth(format!(
                "token exchange returned status {status}: {message}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| RefineryError::Auth(format!("malformed token response: {err}")))?;
        if token.access_token.trim().is_empty() {
            return Err(RefineryError::Auth("token response has no access_token".to_string()));
        }
        let lifetime = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Ok(SyncCredential::new(
            token.access_token,
            Utc::now() + TimeDelta::seconds(lifetime),
        ))
    }

    fn list_genesets(
        &self,
        token: &str,
        organism: &str,
        creator: Option<&str>,
    ) -> Result<Vec<RemoteGenesetSnapshot>, RefineryError> {
        let fail = |message: String| RefineryError::SnapshotFetch {
            organism: organism.to_string(),
            message,
        };
        let url = self.genesets_url();
        let limit = self.page_size.to_string();
        let mut offset = 0usize;
        let mut snapshots = Vec::new();
        loop {
            let offset_param = offset.to_string();
            let response = http::send_with_retries(self.retry, || {
                let mut request = self
                    .client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[
                        ("organism", organism),
                        ("limit", limit.as_str()),
                        ("offset", offset_param.as_str()),
                    ]);
                if let Some(creator) = creator {
                    request = request.query(&[("creator", creator)]);
                }
                request
            })
            .map_err(|err| fail(err.to_string()))?;
            if !response.status().is_success() {
                return Err(fail(format!("status {}", response.status().as_u16())));
            }
            let page: ListResponse = response
                .json()
                .map_err(|err| fail(format!("malformed listing: {err}")))?;
            let fetched = page.objects.len();
            for remote in page.objects {
                let id = remote.id.to_string();
                match remote.into_snapshot() {
                    Some(snapshot) => snapshots.push(snapshot),
                    None => tracing::debug!(remote_id = %id, "skipping gene set with unknown source"),
                }
            }
            if page.meta.next.is_none() || fetched == 0 {
                break;
            }
            offset += fetched;
        }
        tracing::debug!(organism, count = snapshots.len(), "fetched remote gene sets");
        Ok(snapshots)
    }

    fn get_geneset(&self, token: &str, remote_id: &str) -> Result<RemoteGenesetSnapshot, UploadError> {
        let response = self
            .client
            .get(self.geneset_url(remote_id))
            .bearer_auth(token)
            .send()
            .map_err(|err| UploadError::from_reqwest(&err))?;
        let response = Self::check_upload_status(response)?;
        let remote: RemoteGeneset = response
            .json()
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        remote.into_snapshot().ok_or_else(|| UploadError::Rejected {
            status: 200,
            message: format!("remote gene set {remote_id} has an unknown source"),
        })
    }

    fn create_geneset(&self, token: &str, payload: &GenesetPayload) -> Result<String, UploadError> {
        let response = self
            .client
            .post(self.genesets_url())
            .bearer_auth(token)
            .json(payload)
            .send()
            .map_err(|err| UploadError::from_reqwest(&err))?;
        let response = Self::check_upload_status(response)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| UploadError::from_reqwest(&err))?;
        created_id(status, &body)
    }

    fn update_geneset(
        &self,
        token: &str,
        remote_id: &str,
        payload: &GenesetPayload,
    ) -> Result<(), UploadError> {
        let response = self
            .client
            .put(self.geneset_url(remote_id))
            .bearer_auth(token)
            .json(payload)
            .send()
            .map_err(|err| UploadError::from_reqwest(&err))?;
        Self::check_upload_status(response)?;
        Ok(())
    }
}
