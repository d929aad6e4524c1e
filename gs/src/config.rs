//! Gridsched configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::JobKind;
use crate::scheduler::SchedulerConfig;

const LOCAL_CONFIG: &str = ".gridsched.yml";

/// Main configuration: one scheduler per configured job kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// TRACE, DEBUG, INFO, WARN or ERROR
    pub log_level: String,

    /// Schedulers to start, keyed by the job kind they run
    pub schedulers: BTreeMap<JobKind, SchedulerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            schedulers: JobKind::ALL
                .into_iter()
                .map(|kind| (kind, SchedulerConfig::default()))
                .collect(),
        }
    }
}

impl Config {
    /// Check every scheduler section before anything is started
    pub fn validate(&self) -> Result<()> {
        for (kind, scheduler) in &self.schedulers {
            scheduler
                .validate()
                .map_err(|reason| eyre!("Invalid scheduler config for {}: {}", kind, reason))?;
        }
        Ok(())
    }

    /// Load from `path`, or from the first usable file in [`Self::search_paths`]
    ///
    /// An explicit path is authoritative and any failure is returned. Discovered
    /// files that fail to parse or validate are skipped with a warning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        debug!(?path, "Config::load: called");
        match path {
            Some(path) => Self::from_file(path).with_context(|| format!("Failed to load config from {}", path.display())),
            None => Ok(Self::discover(&Self::search_paths())),
        }
    }

    /// Candidate config files, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("gridsched").join("gridsched.yml"));
        }
        paths
    }

    fn discover(candidates: &[PathBuf]) -> Self {
        for candidate in candidates.iter().filter(|path| path.is_file()) {
            match Self::from_file(candidate) {
                Ok(config) => return config,
                Err(e) => warn!(path = %candidate.display(), error = %e, "Config::discover: skipping unusable config"),
            }
        }
        info!("No config file found, using defaults");
        Self::default()
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        info!(path = %path.display(), schedulers = config.schedulers.len(), "Loaded config");
        Ok(config)
    }
}
