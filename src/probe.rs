//! Host-native transports for infrastructure discovery.
//!
//! Discovery never talks to a host directly. It asks a [`HostProbe`] for the
//! host's master site configuration and its OS services, so the transport
//! (administrative shares, a remote management shell, a test double) is a
//! deployment choice.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::models::{Host, OsService};

/// Placeholder substituted with the host's display name.
pub const HOST_PLACEHOLDER: &str = "{host}";

/// Read-only access to a host's hosting infrastructure.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Raw text of the host's master site configuration.
    async fn site_config(&self, host: &Host) -> Result<String>;

    /// Every OS service installed on the host.
    async fn services(&self, host: &Host) -> Result<Vec<OsService>>;
}

/// Default probe: reads the site configuration from a path template and
/// runs an external command to list services.
#[derive(Debug, Clone)]
pub struct ShareProbe {
    site_config_path: String,
    service_query: Vec<String>,
}

impl ShareProbe {
    pub fn new(site_config_path: impl Into<String>, service_query: Vec<String>) -> Self {
        Self {
            site_config_path: site_config_path.into(),
            service_query,
        }
    }

    fn expand(template: &str, host: &Host) -> String {
        template.replace(HOST_PLACEHOLDER, &host.to_string())
    }
}

#[async_trait]
impl HostProbe for ShareProbe {
    async fn site_config(&self, host: &Host) -> Result<String> {
        let path = PathBuf::from(Self::expand(&self.site_config_path, host));
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read site configuration {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn services(&self, host: &Host) -> Result<Vec<OsService>> {
        let Some((program, args)) = self.service_query.split_first() else {
            bail!("no service query command configured");
        };
        let output = Command::new(Self::expand(program, host))
            .args(args.iter().map(|a| Self::expand(a, host)))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute service query '{}'", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("service query for {} failed: {}", host, stderr.trim());
        }
        parse_service_listing(&String::from_utf8_lossy(&output.stdout), host)
    }
}

/// One row of a `Win32_Service` listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRow {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    path_name: Option<String>,
    #[serde(default)]
    start_mode: Option<String>,
    #[serde(default)]
    start_name: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Many(Vec<ServiceRow>),
    One(ServiceRow),
}

/// Parse the JSON printed by a service query: an array of rows, a single
/// row, or nothing at all.
pub fn parse_service_listing(json: &str, host: &Host) -> Result<Vec<OsService>> {
    let json = json.trim().trim_start_matches('\u{feff}');
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let rows = match serde_json::from_str(json).context("Malformed service listing")? {
        Listing::Many(rows) => rows,
        Listing::One(row) => vec![row],
    };
    Ok(rows
        .into_iter()
        .map(|r| OsService {
            host: host.clone(),
            display_name: r.display_name.unwrap_or_else(|| r.name.clone()),
            name: r.name,
            path: r.path_name.unwrap_or_default(),
            start_mode: r.start_mode.unwrap_or_default(),
            username: r.start_name.unwrap_or_default(),
            state: r.state.unwrap_or_default(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{write_file, APPLICATION_HOST};
    use tempfile::TempDir;

    #[test]
    fn parses_array_and_single_object() {
        let host = Host::new("host1", "corp.local");
        let many = parse_service_listing(
            r#"[{"Name":"MySvc","DisplayName":"My Service","PathName":"D:\\Apps\\env1\\svc\\MySvc\\MySvc.exe","StartMode":"Auto","StartName":"LocalSystem","State":"Running"},
                {"Name":"Spooler","PathName":null}]"#,
            &host,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].path, r"D:\Apps\env1\svc\MySvc\MySvc.exe");
        assert_eq!(many[1].display_name, "Spooler");
        assert_eq!(many[1].path, "");

        let one = parse_service_listing(r#"{"Name":"Only"}"#, &host).unwrap();
        assert_eq!(one[0].name, "Only");
        assert!(parse_service_listing("  ", &host).unwrap().is_empty());
        assert!(parse_service_listing("not json", &host).is_err());
    }

    #[tokio::test]
    async fn share_probe_expands_host_placeholder() {
        let tmp = TempDir::new().unwrap();
        write_file(
            &tmp.path().join("host1.corp.local").join("applicationHost.config"),
            APPLICATION_HOST,
        );
        let template = format!("{}/{{host}}/applicationHost.config", tmp.path().display());
        let probe = ShareProbe::new(template, Vec::new());
        let host = Host::new("host1", "corp.local");

        let text = probe.site_config(&host).await.unwrap();
        assert!(text.contains("OrdersPool"));
        assert!(probe.site_config(&Host::new("host2", "")).await.is_err());
        assert!(probe.services(&host).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn share_probe_runs_service_query() {
        let probe = ShareProbe::new(
            "",
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo '[{"Name":"{host}"}]'"#.to_string(),
            ],
        );
        let services = probe.services(&Host::new("host1", "")).await.unwrap();
        assert_eq!(services[0].name, "host1");

        let failing = ShareProbe::new("", vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()]);
        assert!(failing.services(&Host::new("host1", "")).await.is_err());
    }
}
