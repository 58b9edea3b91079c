//! Discovery orchestrator.
//!
//! Three independent entry points, each fanning out over the distinct set of
//! known hosts with bounded parallelism:
//!
//! | Entry point | Output |
//! |-------------|--------|
//! | [`Discovery::discover_apps`] | `snapshot/<env>/<host>/<app>.json` |
//! | [`Discovery::discover_sites`] | `infrastructure/site/<host>.<id>.json` |
//! | [`Discovery::discover_services`] | `infrastructure/service/<host>.json` |
//!
//! A failing host is logged and contributes nothing to the pass; the other
//! hosts proceed. Within one host, search paths and application directories
//! are processed sequentially.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::analyzer::{analyze, main_binary_path, matches_prefix};
use crate::catalog::Catalog;
use crate::config::DiscoveryConfig;
use crate::models::{Host, OsService, SearchPath, Website};
use crate::probe::{HostProbe, ShareProbe};
use crate::site_config::{attach_pools, parse_site_config};

/// Worker count for per-host fan-out: available parallelism minus one,
/// at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Counters for one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub hosts_scanned: usize,
    pub hosts_failed: usize,
    pub records_written: usize,
    pub records_unchanged: usize,
    pub records_removed: usize,
}

impl DiscoveryReport {
    pub fn absorb(&mut self, other: DiscoveryReport) {
        self.hosts_scanned += other.hosts_scanned;
        self.hosts_failed += other.hosts_failed;
        self.records_written += other.records_written;
        self.records_unchanged += other.records_unchanged;
        self.records_removed += other.records_removed;
    }

    fn record(&mut self, changed: bool) {
        if changed {
            self.records_written += 1;
        } else {
            self.records_unchanged += 1;
        }
    }
}

impl fmt::Display for DiscoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} host(s) scanned, {} failed; {} record(s) written, {} unchanged, {} removed",
            self.hosts_scanned,
            self.hosts_failed,
            self.records_written,
            self.records_unchanged,
            self.records_removed
        )
    }
}

/// Serialize `value` as pretty JSON at `path`, creating parent directories.
/// Returns `false` without touching the file when its bytes are unchanged.
pub fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    if let Ok(existing) = std::fs::read(path) {
        if existing == json.as_bytes() {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Outcome of scanning one application directory.
enum Scan {
    /// No allow-listed main binary.
    Skipped,
    /// The application could not be analyzed; its last snapshot stands.
    Failed,
    Recorded { path: PathBuf, changed: bool },
}

/// Per-host inputs shared by every application scan on that host.
struct HostContext {
    prefixes: Vec<String>,
    sites: Vec<Website>,
    services: Vec<OsService>,
}

#[derive(Clone)]
pub struct Discovery {
    catalog: Catalog,
    probe: Arc<dyn HostProbe>,
    workers: usize,
    prune_removed: bool,
}

impl Discovery {
    pub fn new(catalog: Catalog, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            catalog,
            probe,
            workers: default_workers(),
            prune_removed: true,
        }
    }

    /// Discovery over `data_dir` probing hosts through a [`ShareProbe`].
    pub fn from_config(config: &DiscoveryConfig, data_dir: &Path) -> Self {
        let probe = ShareProbe::new(config.site_config_path.clone(), config.service_query.clone());
        let discovery = Self::new(Catalog::new(data_dir), Arc::new(probe))
            .with_pruning(config.prune_removed);
        match config.workers {
            Some(workers) => discovery.with_workers(workers),
            None => discovery,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_pruning(mut self, prune_removed: bool) -> Self {
        self.prune_removed = prune_removed;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run `scan` for every host with at most `workers` in flight.
    async fn fan_out<F, Fut>(&self, label: &str, scan: F) -> Result<DiscoveryReport>
    where
        F: Fn(Host) -> Fut,
        Fut: Future<Output = Result<DiscoveryReport>> + Send + 'static,
    {
        let hosts = self.catalog.hosts()?;
        info!(hosts = hosts.len(), workers = self.workers, "Starting {} discovery", label);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for host in hosts {
            let semaphore = semaphore.clone();
            let fut = scan(host.clone());
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (host, fut.await)
            });
        }

        let mut report = DiscoveryReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((host, Ok(host_report))) => {
                    debug!(host = %host, "{} discovery finished for host", label);
                    report.hosts_scanned += 1;
                    report.absorb(host_report);
                }
                Ok((host, Err(e))) => {
                    warn!(host = %host, "{} discovery failed for host", label);
                    error!(error = ?e, "host discovery error");
                    report.hosts_failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "{} discovery task aborted", label);
                    report.hosts_failed += 1;
                }
            }
        }
        info!(%report, "Finished {} discovery", label);
        Ok(report)
    }

    /// Services, then sites, then applications, so linkage sees fresh
    /// infrastructure records.
    pub async fn discover_all(&self) -> Result<DiscoveryReport> {
        let mut report = self.discover_services().await?;
        report.absorb(self.discover_sites().await?);
        report.absorb(self.discover_apps().await?);
        Ok(report)
    }

    pub async fn discover_apps(&self) -> Result<DiscoveryReport> {
        let prefixes = Arc::new(self.catalog.prefixes()?);
        self.fan_out("application", |host| {
            let this = self.clone();
            let prefixes = prefixes.clone();
            async move {
                tokio::task::spawn_blocking(move || this.discover_host_apps(&host, &prefixes))
                    .await
                    .context("application scan task failed")?
            }
        })
        .await
    }

    pub async fn discover_sites(&self) -> Result<DiscoveryReport> {
        self.fan_out("site", |host| {
            let this = self.clone();
            async move {
                let xml = this.probe.site_config(&host).await?;
                let mut parsed = parse_site_config(&xml, &host)
                    .with_context(|| format!("Malformed site configuration for {}", host))?;
                attach_pools(&mut parsed.sites, &parsed.pools);

                let mut report = DiscoveryReport::default();
                for site in &parsed.sites {
                    let changed = write_record(&this.catalog.site_path(&host, site.id), site)?;
                    report.record(changed);
                }
                info!(host = %host, sites = parsed.sites.len(), "Sites discovered");
                Ok(report)
            }
        })
        .await
    }

    pub async fn discover_services(&self) -> Result<DiscoveryReport> {
        self.fan_out("service", |host| {
            let this = self.clone();
            async move {
                let prefixes: Vec<String> = this
                    .catalog
                    .search_paths_for(&host)?
                    .iter()
                    .map(|sp| sp.local_path().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect();

                let mut services: Vec<OsService> = this
                    .probe
                    .services(&host)
                    .await?
                    .into_iter()
                    .filter(|s| {
                        let path = s.path.to_lowercase();
                        prefixes.iter().any(|p| path.contains(p.as_str()))
                    })
                    .collect();
                services.sort_by(|a, b| a.name.cmp(&b.name));

                let mut report = DiscoveryReport::default();
                report.record(write_record(&this.catalog.service_path(&host), &services)?);
                info!(host = %host, services = services.len(), "Services discovered");
                Ok(report)
            }
        })
        .await
    }

    fn host_context(&self, host: &Host, prefixes: Vec<String>) -> Result<HostContext> {
        Ok(HostContext {
            prefixes,
            sites: self.catalog.sites(host)?,
            services: self.catalog.services(host)?,
        })
    }

    fn discover_host_apps(&self, host: &Host, prefixes: &[String]) -> Result<DiscoveryReport> {
        let ctx = self.host_context(host, prefixes.to_vec())?;
        let search_paths: Vec<SearchPath> = self
            .catalog
            .search_paths_for(host)?
            .into_iter()
            .filter(|sp| !sp.environment.trim().is_empty())
            .collect();

        let mut report = DiscoveryReport::default();
        // environment -> (complete pass, lowercase names of recorded snapshots)
        let mut seen: HashMap<String, (bool, HashSet<String>)> = HashMap::new();

        for sp in &search_paths {
            let entry = seen
                .entry(sp.environment.clone())
                .or_insert_with(|| (true, HashSet::new()));
            let dirs = match app_dirs(Path::new(&sp.share)) {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(share = %sp.share, host = %host, error = %e, "Search path share unreadable");
                    entry.0 = false;
                    continue;
                }
            };
            for dir in dirs {
                match self.scan_app(sp, &dir, &ctx)? {
                    Scan::Skipped => {}
                    Scan::Failed => entry.0 = false,
                    Scan::Recorded { path, changed } => {
                        report.record(changed);
                        entry.1.insert(snapshot_stem(&path));
                    }
                }
            }
        }

        if self.prune_removed {
            for (environment, (complete, names)) in &seen {
                if *complete {
                    report.records_removed += self.prune(environment, host, names)?;
                } else {
                    debug!(environment = %environment, host = %host, "Incomplete pass, pruning skipped");
                }
            }
        }
        Ok(report)
    }

    /// Delete snapshots of the environment that this pass did not record.
    fn prune(&self, environment: &str, host: &Host, names: &HashSet<String>) -> Result<usize> {
        let dir = self.catalog.snapshot_dir(environment, host);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(0);
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if !names.contains(&snapshot_stem(&path)) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                info!(snapshot = %path.display(), "Removed snapshot of vanished application");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Scan one application directory. Only snapshot write failures are
    /// errors.
    fn scan_app(&self, sp: &SearchPath, app_dir: &Path, ctx: &HostContext) -> Result<Scan> {
        let Some(binary) = main_binary_path(sp.role, app_dir) else {
            debug!(app_dir = %app_dir.display(), "no main binary candidate");
            return Ok(Scan::Skipped);
        };
        let file_name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !binary.is_file() || !matches_prefix(&file_name, &ctx.prefixes) {
            debug!(binary = %binary.display(), "main binary missing or not allow-listed");
            return Ok(Scan::Skipped);
        }

        let app = match analyze(&binary, sp, &ctx.prefixes, &ctx.sites, &ctx.services) {
            Ok(app) => app,
            Err(e) => {
                warn!(app_dir = %app_dir.display(), "Failed to analyze application");
                error!(error = %e, "application analysis error");
                return Ok(Scan::Failed);
            }
        };

        let path = self
            .catalog
            .snapshot_path(&app.environment, &app.host, &app.name);
        let changed = write_record(&path, &app)?;
        if changed {
            info!(app = %app.name, host = %app.host, environment = %app.environment, "Snapshot updated");
        }
        Ok(Scan::Recorded { path, changed })
    }

    /// Re-discover a single application, as triggered by a file change.
    pub fn discover_app(&self, sp: &SearchPath, app_dir: &Path) -> Result<Option<PathBuf>> {
        let ctx = self.host_context(&sp.host, self.catalog.prefixes()?)?;
        match self.scan_app(sp, app_dir, &ctx)? {
            Scan::Recorded { path, .. } => Ok(Some(path)),
            Scan::Skipped | Scan::Failed => Ok(None),
        }
    }
}

fn snapshot_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Immediate subdirectories of a share, sorted.
fn app_dirs(share: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(share)
        .with_context(|| format!("Failed to list {}", share.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}
