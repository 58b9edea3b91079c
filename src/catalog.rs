//! Read access to the data directory layout.
//!
//! ```text
//! <data_dir>/
//!   config/path/*.json                      search paths (host-prefixed names)
//!   config/default/assembly.startswith.json binary name allow-list
//!   infrastructure/site/<host>.<id>.json    websites
//!   infrastructure/service/<host>.json      OS services per host
//!   snapshot/<environment>/<host>/<app>.json applications
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::models::{Host, OsService, SearchPath, Website};

pub const CONFIG_DIR: &str = "config";
pub const SEARCH_PATH_DIR: &str = "config/path";
pub const PREFIXES_FILE: &str = "config/default/assembly.startswith.json";
pub const SITE_DIR: &str = "infrastructure/site";
pub const SERVICE_DIR: &str = "infrastructure/service";
pub const SNAPSHOT_DIR: &str = "snapshot";

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Typed view over a data directory.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, environment: &str, host: &Host) -> PathBuf {
        self.root
            .join(SNAPSHOT_DIR)
            .join(environment)
            .join(host.to_string())
    }

    pub fn snapshot_path(&self, environment: &str, host: &Host, app: &str) -> PathBuf {
        self.snapshot_dir(environment, host)
            .join(format!("{}.json", app))
    }

    pub fn site_path(&self, host: &Host, id: u32) -> PathBuf {
        self.root
            .join(SITE_DIR)
            .join(format!("{}.{}.json", host, id))
    }

    pub fn service_path(&self, host: &Host) -> PathBuf {
        self.root.join(SERVICE_DIR).join(format!("{}.json", host))
    }

    /// `*.json` files directly inside `dir` whose lower-cased name starts
    /// with `prefix`, sorted.
    fn json_files(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let json = build_globset(&["*.json".to_string()])?;
        let prefix = prefix.to_lowercase();
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if json.is_match(&name) && name.starts_with(&prefix) && !name.starts_with("dummy") {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse every file, logging and skipping the ones that fail.
    fn load_records<T: DeserializeOwned>(&self, files: &[PathBuf]) -> Vec<T> {
        let mut out = Vec::new();
        for path in files {
            match read_json::<OneOrMany<T>>(path) {
                Ok(OneOrMany::Many(records)) => out.extend(records),
                Ok(OneOrMany::One(record)) => out.push(record),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        out
    }

    /// All configured search paths.
    pub fn search_paths(&self) -> Result<Vec<SearchPath>> {
        let files = self.json_files(&self.root.join(SEARCH_PATH_DIR), "")?;
        Ok(self.load_records(&files))
    }

    /// Search paths whose record names `host`, whatever file they live in.
    pub fn search_paths_for(&self, host: &Host) -> Result<Vec<SearchPath>> {
        Ok(self
            .search_paths()?
            .into_iter()
            .filter(|sp| &sp.host == host)
            .collect())
    }

    /// Distinct hosts across all search paths.
    pub fn hosts(&self) -> Result<Vec<Host>> {
        let hosts: BTreeSet<Host> = self
            .search_paths()?
            .into_iter()
            .map(|sp| sp.host)
            .collect();
        Ok(hosts.into_iter().collect())
    }

    /// The binary name allow-list. A missing file is an empty list.
    pub fn prefixes(&self) -> Result<Vec<String>> {
        let path = self.root.join(PREFIXES_FILE);
        if !path.exists() {
            warn!(file = %path.display(), "No binary prefix allow-list; nothing will be discovered");
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    /// Websites previously discovered on `host`.
    pub fn sites(&self, host: &Host) -> Result<Vec<Website>> {
        let files = self.json_files(&self.root.join(SITE_DIR), &format!("{}.", host))?;
        Ok(self.load_records(&files))
    }

    /// OS services previously discovered on `host`.
    pub fn services(&self, host: &Host) -> Result<Vec<OsService>> {
        let path = self.service_path(host);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(&bytes);
    serde_json::from_slice(bytes).with_context(|| format!("Failed to parse {}", path.display()))
}
