use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;

use crate::config::{BasicAuth, OrganismConfig, Secrets};
use crate::error::RefineryError;
use crate::http::{self, RetryPolicy};
use crate::store::Store;

/// A raw file a source processor needs, and where it lands in the organism cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub url: String,
    pub file_name: String,
    pub optional: bool,
}

impl DownloadSpec {
    pub fn new(url: &str, file_name: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            file_name: file_name.to_string(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

pub trait Downloader: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        auth: Option<&BasicAuth>,
    ) -> Result<(), RefineryError>;
}

#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
    retry: RetryPolicy,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, RefineryError> {
        Ok(Self {
            client: http::build_client(timeout)?,
            retry: RetryPolicy::default(),
        })
    }

    fn download(
        &self,
        url: &str,
        destination: &Utf8Path,
        auth: Option<&BasicAuth>,
    ) -> Result<(), RefineryError> {
        let mut response = http::send_with_retries(self.retry, || {
            let request = self.client.get(url);
            match auth {
                Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
                None => request,
            }
        })
        .map_err(|err| RefineryError::Download {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(RefineryError::DownloadStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| RefineryError::Filesystem(format!("create {parent}: {err}")))?;
        let mut staged = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| RefineryError::Filesystem(err.to_string()))?;
        io::copy(&mut response, staged.as_file_mut()).map_err(|err| RefineryError::Download {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        staged
            .persist(destination.as_std_path())
            .map_err(|err| RefineryError::Filesystem(format!("persist {destination}: {}", err.error)))?;
        Ok(())
    }
}

impl Downloader for HttpDownloader {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        auth: Option<&BasicAuth>,
    ) -> Result<(), RefineryError> {
        match local_path(url) {
            Some(path) => Store::copy_file_atomic(&path, destination),
            None => self.download(url, destination, auth),
        }
    }
}

/// `file://` URLs and bare paths are read from disk instead of the network.
pub fn local_path(url: &str) -> Option<Utf8PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(Utf8PathBuf::from(path));
    }
    if url.contains("://") {
        return None;
    }
    Some(Utf8PathBuf::from(url))
}

/// Fetches every file the organism's enabled sources need into its cache dir.
pub fn download_organism_files<D: Downloader + ?Sized>(
    downloader: &D,
    store: &Store,
    organism: &OrganismConfig,
    secrets: &Secrets,
) -> Result<Utf8PathBuf, RefineryError> {
    let dir = store.ensure_organism_dir(&organism.name)?;
    for tag in organism.enabled_sources() {
        let auth = secrets.source_auth(tag);
        for spec in organism.downloads_for(tag) {
            let destination = dir.join(&spec.file_name);
            tracing::info!(organism = %organism.name, source = %tag, url = %spec.url, "downloading");
            match downloader.fetch(&spec.url, &destination, auth) {
                Ok(()) => {}
                Err(err) if spec.optional => {
                    // A copy left by an earlier run would describe a different release.
                    Store::remove_if_present(&destination)?;
                    tracing::warn!(url = %spec.url, error = %err, "optional download failed");
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::KeggSection;

    #[derive(Default)]
    struct RecordingDownloader {
        urls: Mutex<Vec<String>>,
    }

    impl Downloader for RecordingDownloader {
        fn fetch(
            &self,
            url: &str,
            destination: &Utf8Path,
            _auth: Option<&BasicAuth>,
        ) -> Result<(), RefineryError> {
            self.urls.lock().unwrap().push(url.to_string());
            if url.contains("/info/") {
                return Err(RefineryError::DownloadStatus {
                    url: url.to_string(),
                    status: 404,
                });
            }
            Store::write_bytes_atomic(destination, b"")
        }
    }

    #[test]
    fn local_paths_are_detected() {
        assert_eq!(local_path("file:///tmp/go.obo"), Some(Utf8PathBuf::from("/tmp/go.obo")));
        assert_eq!(local_path("fixtures/go.obo"), Some(Utf8PathBuf::from("fixtures/go.obo")));
        assert_eq!(local_path("https://rest.kegg.jp/list/pathway/hsa"), None);
    }

    #[test]
    fn optional_download_failure_is_tolerated() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root);
        let mut organism = OrganismConfig::new("human", "Homo sapiens");
        organism.kegg = Some(KeggSection {
            organism_code: "hsa".to_string(),
            list_url: None,
            link_url: None,
            info_url: None,
            min_genes: 1,
        });
        let stale = store.ensure_organism_dir("human").unwrap().join(KeggSection::INFO_FILE);
        std::fs::write(stale.as_std_path(), "Release 90.0, Apr 19\n").unwrap();
        let downloader = RecordingDownloader::default();
        let dir = download_organism_files(&downloader, &store, &organism, &Secrets::default()).unwrap();
        assert!(dir.join(KeggSection::LINK_FILE).as_std_path().exists());
        assert!(!stale.as_std_path().exists());
        assert_eq!(downloader.urls.lock().unwrap().len(), 3);
    }

    #[test]
    fn local_file_copy() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("source.txt");
        std::fs::write(source.as_std_path(), b"payload").unwrap();
        let downloader = HttpDownloader::new(Duration::from_secs(5)).unwrap();
        let destination = root.join("cache").join("copy.txt");
        downloader.fetch(source.as_str(), &destination, None).unwrap();
        assert_eq!(std::fs::read(destination.as_std_path()).unwrap(), b"payload");
    }
}
