use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::detect::ComparePolicy;
use crate::domain::{OutputMode, SourceTag, UpdatePreference, Visibility};
use crate::download::DownloadSpec;
use crate::error::RefineryError;

pub const DEFAULT_CONFIG_FILE: &str = "refinery.json";
pub const ORGANISM_PLACEHOLDER: &str = "{organism}";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub download_folder: Option<String>,
    #[serde(default)]
    pub secrets_file: Option<String>,
    pub species: SpeciesSection,
    pub output: OutputSection,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpeciesSection {
    #[serde(default)]
    pub dir: Option<String>,
    pub files: SpeciesFiles,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SpeciesFiles {
    Shorthand(String),
    List(Vec<String>),
}

impl SpeciesFiles {
    fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            SpeciesFiles::Shorthand(value) => value.split(',').collect(),
            SpeciesFiles::List(values) => values.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OutputSection {
    pub mode: String,
    #[serde(default)]
    pub json_file: Option<String>,
    #[serde(default)]
    pub tribe_url: Option<String>,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub prefer_update: Option<bool>,
    #[serde(default)]
    pub update_visibility: Option<bool>,
    #[serde(default)]
    pub compare: Option<ComparePolicy>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TribeSettings {
    pub url: String,
    pub visibility: Visibility,
    pub update_preference: UpdatePreference,
    pub update_visibility: bool,
    pub compare: ComparePolicy,
    pub creator: Option<String>,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub dry_run: bool,
}

impl TribeSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            visibility: Visibility::Private,
            update_preference: UpdatePreference::PreferExisting,
            update_visibility: false,
            compare: ComparePolicy::default(),
            creator: None,
            workers: 4,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlatFileSettings {
    pub json_file: String,
}

impl FlatFileSettings {
    pub fn path_for(&self, organism_name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(self.json_file.replace(ORGANISM_PLACEHOLDER, organism_name))
    }
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    RemoteSync(TribeSettings),
    FlatFile(FlatFileSettings),
}

impl OutputTarget {
    pub fn mode(&self) -> OutputMode {
        match self {
            OutputTarget::RemoteSync(_) => OutputMode::RemoteSync,
            OutputTarget::FlatFile(_) => OutputMode::FlatFile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub download_folder: Utf8PathBuf,
    pub secrets_file: Option<Utf8PathBuf>,
    pub species_files: Vec<Utf8PathBuf>,
    pub output: OutputTarget,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, RefineryError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(RefineryError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RefineryError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RefineryError::ConfigParse(err.to_string()))?;

        let base_dir = config_path
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_default();
        let base_dir = Utf8PathBuf::from_path_buf(base_dir)
            .map_err(|_| RefineryError::Config("non-utf8 config path".to_string()))?;
        Self::resolve_config(config, &base_dir)
    }

    pub fn resolve_config(
        config: Config,
        base_dir: &Utf8Path,
    ) -> Result<ResolvedConfig, RefineryError> {
        let download_folder = config
            .download_folder
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                RefineryError::Config(
                    "main configuration must set \"download_folder\"; per-species download \
                     folders are created under it"
                        .to_string(),
                )
            })?;
        let download_folder = relative_to(base_dir, &download_folder);
        let secrets_file = config
            .secrets_file
            .filter(|value| !value.trim().is_empty())
            .map(|value| relative_to(base_dir, &value));

        let species_dir = config
            .species
            .dir
            .as_deref()
            .map(|dir| relative_to(base_dir, dir))
            .unwrap_or_else(|| base_dir.to_path_buf());
        let species_files = config
            .species
            .files
            .names()
            .into_iter()
            .map(|name| species_dir.join(name))
            .collect::<Vec<_>>();
        if species_files.is_empty() {
            return Err(RefineryError::Config(
                "\"species.files\" must list at least one organism file".to_string(),
            ));
        }

        let output = Self::resolve_output(config.output, species_files.len())?;

        Ok(ResolvedConfig {
            download_folder,
            secrets_file,
            species_files,
            output,
        })
    }

    fn resolve_output(
        output: OutputSection,
        species_count: usize,
    ) -> Result<OutputTarget, RefineryError> {
        match output.mode.parse::<OutputMode>()? {
            OutputMode::FlatFile => {
                let json_file = output
                    .json_file
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| {
                        RefineryError::Config(
                            "\"output.json_file\" is required for JSON file output".to_string(),
                        )
                    })?;
                if species_count > 1 && !json_file.contains(ORGANISM_PLACEHOLDER) {
                    return Err(RefineryError::Config(format!(
                        "\"output.json_file\" must contain {ORGANISM_PLACEHOLDER} when more than \
                         one species file is configured"
                    )));
                }
                Ok(OutputTarget::FlatFile(FlatFileSettings { json_file }))
            }
            OutputMode::RemoteSync => {
                let url = output
                    .tribe_url
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| {
                        RefineryError::Config(
                            "\"output.tribe_url\" is required to save gene sets to Tribe"
                                .to_string(),
                        )
                    })?;
                let mut settings = TribeSettings::new(url);
                settings.visibility = Visibility::from_public(output.public.unwrap_or(false));
                settings.update_preference =
                    UpdatePreference::from_prefer_update(output.prefer_update.unwrap_or(false));
                settings.update_visibility = output.update_visibility.unwrap_or(false);
                settings.compare = output.compare.unwrap_or_default();
                settings.creator = output.creator.filter(|value| !value.trim().is_empty());
                if let Some(workers) = output.workers {
                    if workers == 0 {
                        return Err(RefineryError::Config(
                            "\"output.workers\" must be at least 1".to_string(),
                        ));
                    }
                    settings.workers = workers;
                }
                if let Some(max_retries) = output.max_retries {
                    settings.max_retries = max_retries;
                }
                if let Some(delay) = output.retry_delay_ms {
                    settings.retry_delay = Duration::from_millis(delay);
                }
                if let Some(timeout) = output.timeout_secs {
                    if timeout == 0 {
                        return Err(RefineryError::Config(
                            "\"output.timeout_secs\" must be greater than zero".to_string(),
                        ));
                    }
                    settings.timeout = Duration::from_secs(timeout);
                }
                settings.dry_run = output.dry_run.unwrap_or(false);
                Ok(OutputTarget::RemoteSync(settings))
            }
        }
    }

    pub fn load_organism(path: &Utf8Path) -> Result<OrganismConfig, RefineryError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| RefineryError::ConfigRead(path.as_std_path().to_path_buf()))?;
        let organism: OrganismConfig = serde_json::from_str(&content)
            .map_err(|err| RefineryError::ConfigParse(format!("{path}: {err}")))?;
        organism.validate()?;
        Ok(organism)
    }
}

fn relative_to(base_dir: &Utf8Path, value: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(value.trim());
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Per-species settings. A source is enabled by the presence of its section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrganismConfig {
    pub name: String,
    pub scientific_name: String,
    #[serde(default)]
    pub taxonomy_id: Option<u32>,
    #[serde(default)]
    pub go: Option<GoSection>,
    #[serde(default)]
    pub kegg: Option<KeggSection>,
    #[serde(default, rename = "do")]
    pub disease_ontology: Option<DoSection>,
}

impl OrganismConfig {
    pub fn new(name: impl Into<String>, scientific_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scientific_name: scientific_name.into(),
            taxonomy_id: None,
            go: None,
            kegg: None,
            disease_ontology: None,
        }
    }

    pub fn validate(&self) -> Result<(), RefineryError> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(RefineryError::Config(format!(
                "organism name must be a non-empty plain label, got {:?}",
                self.name
            )));
        }
        if self.scientific_name.trim().is_empty() {
            return Err(RefineryError::Config(format!(
                "organism {} is missing \"scientific_name\"",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_enabled(&self, tag: SourceTag) -> bool {
        match tag {
            SourceTag::Go => self.go.is_some(),
            SourceTag::Kegg => self.kegg.is_some(),
            SourceTag::Do => self.disease_ontology.is_some(),
        }
    }

    pub fn enabled_sources(&self) -> Vec<SourceTag> {
        SourceTag::ALL
            .into_iter()
            .filter(|tag| self.is_enabled(*tag))
            .collect()
    }

    pub fn downloads_for(&self, tag: SourceTag) -> Vec<DownloadSpec> {
        match tag {
            SourceTag::Go => self.go.as_ref().map(GoSection::downloads),
            SourceTag::Kegg => self.kegg.as_ref().map(KeggSection::downloads),
            SourceTag::Do => self.disease_ontology.as_ref().map(DoSection::downloads),
        }
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GoSection {
    pub obo_url: String,
    pub gaf_url: String,
    #[serde(default)]
    pub evidence_codes: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub include_part_of: bool,
    #[serde(default = "default_min_genes")]
    pub min_genes: usize,
    #[serde(default)]
    pub max_genes: Option<usize>,
    #[serde(default)]
    pub use_symbols: bool,
}

impl GoSection {
    pub const OBO_FILE: &'static str = "go.obo";

    pub fn gaf_file(&self) -> &'static str {
        if self.gaf_url.ends_with(".gz") {
            "go_annotations.gaf.gz"
        } else {
            "go_annotations.gaf"
        }
    }

    pub fn downloads(&self) -> Vec<DownloadSpec> {
        vec![
            DownloadSpec::new(&self.obo_url, Self::OBO_FILE),
            DownloadSpec::new(&self.gaf_url, self.gaf_file()),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeggSection {
    pub organism_code: String,
    #[serde(default)]
    pub list_url: Option<String>,
    #[serde(default)]
    pub link_url: Option<String>,
    #[serde(default)]
    pub info_url: Option<String>,
    #[serde(default = "default_min_genes")]
    pub min_genes: usize,
}

impl KeggSection {
    pub const LIST_FILE: &'static str = "kegg_pathways.tsv";
    pub const LINK_FILE: &'static str = "kegg_links.tsv";
    pub const INFO_FILE: &'static str = "kegg_info.txt";

    pub fn downloads(&self) -> Vec<DownloadSpec> {
        let code = self.organism_code.trim();
        let list_url = self
            .list_url
            .clone()
            .unwrap_or_else(|| format!("https://rest.kegg.jp/list/pathway/{code}"));
        let link_url = self
            .link_url
            .clone()
            .unwrap_or_else(|| format!("https://rest.kegg.jp/link/pathway/{code}"));
        let info_url = self
            .info_url
            .clone()
            .unwrap_or_else(|| format!("https://rest.kegg.jp/info/{code}"));
        vec![
            DownloadSpec::new(&list_url, Self::LIST_FILE),
            DownloadSpec::new(&link_url, Self::LINK_FILE),
            DownloadSpec::new(&info_url, Self::INFO_FILE).optional(),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DoSection {
    pub obo_url: String,
    pub associations_url: String,
    #[serde(default = "default_true")]
    pub propagate: bool,
    #[serde(default = "default_min_genes")]
    pub min_genes: usize,
}

impl DoSection {
    pub const OBO_FILE: &'static str = "doid.obo";
    pub const ASSOCIATIONS_FILE: &'static str = "do_associations.tsv";

    pub fn downloads(&self) -> Vec<DownloadSpec> {
        vec![
            DownloadSpec::new(&self.obo_url, Self::OBO_FILE),
            DownloadSpec::new(&self.associations_url, Self::ASSOCIATIONS_FILE),
        ]
    }
}

fn default_true() -> bool {
    true
}

fn default_min_genes() -> usize {
    1
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Secrets {
    #[serde(default)]
    pub tribe: Option<TribeCredentials>,
    #[serde(default)]
    pub sources: BTreeMap<String, BasicAuth>,
}

impl Secrets {
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, RefineryError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| RefineryError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content)
            .map_err(|err| RefineryError::ConfigParse(format!("{path}: {err}")))
    }

    pub fn source_auth(&self, tag: SourceTag) -> Option<&BasicAuth> {
        self.sources.get(tag.config_key())
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct TribeCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl TribeCredentials {
    /// Secrets file first, then `TRIBE_*` environment variables.
    pub fn resolve(secrets: &Secrets) -> Result<Self, RefineryError> {
        if let Some(credentials) = &secrets.tribe {
            return Ok(credentials.clone());
        }
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| RefineryError::Auth(format!("missing Tribe credential {key}")))
        };
        Ok(Self {
            client_id: read("TRIBE_CLIENT_ID")?,
            client_secret: read("TRIBE_CLIENT_SECRET")?,
            username: read("TRIBE_USERNAME")?,
            password: read("TRIBE_PASSWORD")?,
        })
    }
}

impl fmt::Debug for TribeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TribeCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
