use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Working copy of the snapshot repository. Filled in and persisted on
    /// first use when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            remote: None,
            branch: default_branch(),
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
        }
    }
}

fn default_branch() -> String {
    "master".to_string()
}
fn default_committer_name() -> String {
    "driftwatch".to_string()
}
fn default_committer_email() -> String {
    "driftwatch@localhost".to_string()
}

/// Duty-cycle settings. Times and weekdays are parsed leniently by
/// [`crate::schedule::Schedule::from_config`].
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_wake_time")]
    pub wake_time: String,
    #[serde(default = "default_sleep_time")]
    pub sleep_time: String,
    #[serde(default = "default_wake_days")]
    pub wake_days: String,
    #[serde(default = "default_wake_frequency")]
    pub wake_frequency_mins: u64,
    /// Zero means no work at all while asleep.
    #[serde(default)]
    pub sleep_frequency_mins: u64,
    #[serde(default = "default_pause")]
    pub default_pause_mins: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            wake_time: default_wake_time(),
            sleep_time: default_sleep_time(),
            wake_days: default_wake_days(),
            wake_frequency_mins: default_wake_frequency(),
            sleep_frequency_mins: 0,
            default_pause_mins: default_pause(),
        }
    }
}

fn default_wake_time() -> String {
    "08:00".to_string()
}
fn default_sleep_time() -> String {
    "19:00".to_string()
}
fn default_wake_days() -> String {
    "1,2,3,4,5".to_string()
}
fn default_wake_frequency() -> u64 {
    5
}
fn default_pause() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Per-host fan-out; defaults to available parallelism minus one.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_true")]
    pub prune_removed: bool,
    #[serde(default = "default_watch_glob")]
    pub watch_glob: String,
    #[serde(default = "default_site_config_path")]
    pub site_config_path: String,
    #[serde(default = "default_service_query")]
    pub service_query: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            workers: None,
            prune_removed: true,
            watch_glob: default_watch_glob(),
            site_config_path: default_site_config_path(),
            service_query: default_service_query(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_watch_glob() -> String {
    "*.config".to_string()
}
fn default_site_config_path() -> String {
    r"\\{host}\c$\Windows\System32\inetsrv\config\applicationHost.config".to_string()
}
fn default_service_query() -> Vec<String> {
    [
        "powershell",
        "-NoProfile",
        "-NonInteractive",
        "-Command",
        "Get-CimInstance -ClassName Win32_Service -ComputerName {host} | \
         Select-Object Name,DisplayName,PathName,StartMode,StartName,State | \
         ConvertTo-Json -Compress",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl Config {
    /// All defaults, no remote, no data directory.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate schedule
    if config.schedule.wake_frequency_mins == 0 {
        bail!("schedule.wake_frequency_mins must be > 0");
    }
    if config.schedule.default_pause_mins == 0 {
        bail!("schedule.default_pause_mins must be > 0");
    }

    // Validate store
    if config.store.branch.trim().is_empty() {
        bail!("store.branch must not be empty");
    }
    if config.store.remote.as_deref().is_some_and(|r| !r.trim().is_empty()) {
        if config.store.committer_name.trim().is_empty() {
            bail!("store.committer_name must be set when a remote is configured");
        }
        if config.store.committer_email.trim().is_empty() {
            bail!("store.committer_email must be set when a remote is configured");
        }
    }

    // Validate discovery
    if config.discovery.workers == Some(0) {
        bail!("discovery.workers must be >= 1");
    }
    globset::Glob::new(&config.discovery.watch_glob).with_context(|| {
        format!(
            "discovery.watch_glob is not a valid glob: '{}'",
            config.discovery.watch_glob
        )
    })?;

    Ok(())
}

/// Platform default for the snapshot working copy.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("driftwatch")
        .join("data")
}

/// The configured data directory. When absent, the platform default is
/// written back into `[store].data_dir` of the file at `config_path` so
/// later runs keep using it.
pub fn resolve_data_dir(config_path: &Path, config: &mut Config) -> Result<PathBuf> {
    if let Some(dir) = &config.store.data_dir {
        return Ok(dir.clone());
    }
    let dir = default_data_dir();

    let mut table: toml::Table = if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        toml::Table::new()
    };
    let store = table
        .entry("store")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(store) = store.as_table_mut() else {
        bail!("[store] in {} is not a table", config_path.display());
    };
    store.insert(
        "data_dir".to_string(),
        toml::Value::String(dir.to_string_lossy().into_owned()),
    );

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(config_path, toml::to_string_pretty(&table)?)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
    info!(data_dir = %dir.display(), config = %config_path.display(), "Persisted data directory");

    config.store.data_dir = Some(dir.clone());
    Ok(dir)
}
