//! Core data models used throughout driftwatch.
//!
//! These types describe the hosts being scanned, the applications discovered
//! on them, and the hosting infrastructure and connections those applications
//! are linked to. Every type round-trips through the pretty-printed JSON
//! records kept in the data directory, so field names follow the PascalCase
//! layout of existing snapshot repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical scan target. Identity is `name` + `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub domain: String,
}

impl Host {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            domain: domain.into().to_lowercase(),
        }
    }

    /// Resolve a host from a free-form address: a bare host name, an FQDN,
    /// or a URL such as `http://db01.corp.local:8080/path`.
    ///
    /// The first DNS label becomes the name and the remainder the domain.
    /// IPv4 literals are kept whole.
    pub fn from_address(address: &str) -> Self {
        let mut rest = address.trim();
        if let Some((_, after)) = rest.split_once("://") {
            rest = after;
        }
        if let Some(end) = rest.find(['/', '?', '#']) {
            rest = &rest[..end];
        }
        if let Some((_, after)) = rest.rsplit_once('@') {
            rest = after;
        }
        if let Some((before, port)) = rest.rsplit_once(':') {
            if port.chars().all(|c| c.is_ascii_digit()) {
                rest = before;
            }
        }
        let fqdn = rest.to_lowercase();
        if fqdn.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Host::new(fqdn, "");
        }
        match fqdn.split_once('.') {
            Some((name, domain)) => Host::new(name, domain),
            None => Host::new(fqdn, ""),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.name, self.domain)
        }
    }
}

/// Application category, declared by the search path that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "web")]
    Web,
    #[serde(rename = "service", alias = "svc")]
    Service,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Web => write!(f, "web"),
            Role::Service => write!(f, "service"),
        }
    }
}

/// Where to look for deployed applications of one role in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchPath {
    pub host: Host,
    pub role: Role,
    #[serde(default)]
    pub environment: String,
    /// Location the scanner reads, usually an administrative share.
    pub share: String,
    /// Host-local prefix of the share, used to match OS service binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SearchPath {
    /// The host-local form of this search path.
    pub fn local_path(&self) -> String {
        match &self.path {
            Some(p) if !p.trim().is_empty() => p.clone(),
            _ => crate::analyzer::normalize_share_path(&self.share),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub assembly_version: String,
    pub file_version: String,
    pub product_version: String,
    pub build_timestamp: DateTime<Utc>,
}

/// Identity of a deployable binary, derived from its headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BinaryIdentity {
    pub name: String,
    pub product: String,
    pub company: String,
    pub is_debug: bool,
    pub is_pre_release: bool,
    pub path: String,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebsiteApplication {
    pub path: String,
    pub physical_path: String,
    #[serde(default)]
    pub application_pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebsiteBinding {
    pub protocol: String,
    pub binding_information: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebsiteApplicationPool {
    pub name: String,
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default)]
    pub pipeline_mode: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// A hosted site read from a host's master site configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Website {
    pub host: Host,
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub applications: Vec<WebsiteApplication>,
    #[serde(default)]
    pub bindings: Vec<WebsiteBinding>,
    #[serde(default)]
    pub application_pools: Vec<WebsiteApplicationPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OsService {
    pub host: Host,
    pub name: String,
    pub display_name: String,
    pub path: String,
    pub start_mode: String,
    pub username: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseProvider {
    Relational,
    DocumentStore,
    DirectoryService,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseConnection {
    #[serde(default)]
    pub provider: Option<DatabaseProvider>,
    pub connection_string: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub host: Option<Host>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl DatabaseConnection {
    /// A record carrying only the raw string, used when parsing fails.
    pub fn degraded(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConnection {
    pub address: String,
    #[serde(default)]
    pub host: Option<Host>,
    #[serde(default)]
    pub username: Option<String>,
}

/// A discovered application. Identity is `(host, environment, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Application {
    pub name: String,
    pub role: Role,
    pub environment: String,
    pub host: Host,
    pub main_binary: BinaryIdentity,
    #[serde(default)]
    pub dependencies: Vec<BinaryIdentity>,
    #[serde(default)]
    pub website: Option<Website>,
    #[serde(default)]
    pub os_service: Option<OsService>,
    #[serde(default)]
    pub database_connections: Vec<DatabaseConnection>,
    #[serde(default)]
    pub endpoint_connections: Vec<EndpointConnection>,
    #[serde(default)]
    pub url: Option<String>,
}
