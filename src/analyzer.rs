//! Application analysis: main-binary heuristics, dependency resolution and
//! linkage to hosting infrastructure and outbound connections.
//!
//! Only the main binary's identity is fatal for an application. Every
//! linkage step degrades on its own: a missing website, service or
//! configuration file leaves the corresponding field empty.

use std::path::{Path, PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::connections::{database_connections, endpoint_connections};
use crate::identity::read_identity;
use crate::models::{Application, BinaryIdentity, OsService, Role, SearchPath, Website};

static INHERITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#" Inherits="([^"]*)" "#).expect("valid regex"));

const WEB_BINARY_SUFFIXES: &[&str] = &["api.dll", "web.dll", "ui.dll"];
const SERVICE_CONFIG_SUFFIXES: &[&str] = &[".exe.config", ".dll.config"];

/// Convert share notation into host-local notation:
/// `\\host1\d$\Apps\env1` becomes `d:\Apps\env1`.
pub fn normalize_share_path(share: &str) -> String {
    share
        .split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .skip(1)
        .collect::<Vec<_>>()
        .join("\\")
        .replace('$', ":")
}

/// Whether a file name starts with one of the allow-listed prefixes.
pub fn matches_prefix(file_name: &str, prefixes: &[String]) -> bool {
    let name = file_name.to_lowercase();
    prefixes
        .iter()
        .any(|p| !p.is_empty() && name.starts_with(&p.to_lowercase()))
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.flatten().map(|e| e.path()).collect(),
        Err(_) => return Vec::new(),
    };
    entries.sort();
    entries
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Expected main binary of a web application rooted at `app_dir`.
///
/// A `Global.asax` declaring ` Inherits="MyApp.Global" ` names
/// `bin/MyApp.dll`. Without a bootstrap file, the first `bin/<app>*.dll`
/// with a conventional web suffix is taken.
pub fn web_binary_path(app_dir: &Path) -> Option<PathBuf> {
    let bin = app_dir.join("bin");
    let bootstrap = sorted_entries(app_dir)
        .into_iter()
        .find(|p| p.is_file() && file_name_lower(p) == "global.asax");

    if let Some(bootstrap) = bootstrap {
        let text = std::fs::read(&bootstrap).ok()?;
        let text = String::from_utf8_lossy(&text);
        let inherits = INHERITS.captures(&text)?.get(1)?.as_str();
        let (assembly, _) = inherits.rsplit_once('.')?;
        return Some(bin.join(format!("{}.dll", assembly)));
    }

    let app_name = file_name_lower(app_dir);
    sorted_entries(&bin).into_iter().find(|p| {
        let name = file_name_lower(p);
        p.is_file()
            && name.starts_with(&app_name)
            && WEB_BINARY_SUFFIXES.iter().any(|s| name.ends_with(s))
    })
}

/// Expected main binary of a service rooted at `app_dir`: the first
/// `*.exe.config` / `*.dll.config` with its `.config` extension removed.
pub fn service_binary_path(app_dir: &Path) -> Option<PathBuf> {
    sorted_entries(app_dir)
        .into_iter()
        .find(|p| {
            let name = file_name_lower(p);
            p.is_file() && SERVICE_CONFIG_SUFFIXES.iter().any(|s| name.ends_with(s))
        })
        .map(|p| p.with_extension(""))
}

pub fn main_binary_path(role: Role, app_dir: &Path) -> Option<PathBuf> {
    match role {
        Role::Web => web_binary_path(app_dir),
        Role::Service => service_binary_path(app_dir),
    }
}

/// Directory an application is deployed into. For web applications the
/// binary folder (`bin`) is stripped.
pub fn app_root(role: Role, main_binary: &Path) -> PathBuf {
    let dir = main_binary.parent().unwrap_or(main_binary);
    if role == Role::Web && file_name_lower(dir) == "bin" {
        if let Some(up) = dir.parent() {
            return up.to_path_buf();
        }
    }
    dir.to_path_buf()
}

/// Host-local notation of an application directory found under a search
/// path's share.
pub fn local_app_dir(search_path: &SearchPath, app_root: &Path) -> String {
    match app_root.strip_prefix(&search_path.share) {
        Ok(relative) => {
            let mut out = search_path
                .local_path()
                .trim_end_matches(['\\', '/'])
                .to_string();
            for part in relative.components() {
                out.push('\\');
                out.push_str(&part.as_os_str().to_string_lossy());
            }
            out
        }
        Err(_) => normalize_share_path(&app_root.to_string_lossy()),
    }
}

fn resolve_dependencies(main_binary: &Path, prefixes: &[String]) -> Vec<BinaryIdentity> {
    let Some(dir) = main_binary.parent() else {
        return Vec::new();
    };
    let mut candidates: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = file_name_lower(p);
            name.ends_with(".dll") && matches_prefix(&name, prefixes) && p != main_binary
        })
        .collect();
    candidates.sort();

    candidates
        .iter()
        .filter_map(|path| match read_identity(path) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(dependency = %path.display(), error = %e, "Skipping unresolvable dependency");
                None
            }
        })
        .collect()
}

/// Resolve the main binary and its dependency set. The application is named
/// after its main binary; host, role and environment come from the search
/// path it was found under.
pub fn resolve(main_binary: &Path, search_path: &SearchPath, prefixes: &[String]) -> Result<Application> {
    let main = read_identity(main_binary)?;
    let dependencies = resolve_dependencies(main_binary, prefixes);

    Ok(Application {
        name: main.name.clone(),
        role: search_path.role,
        environment: search_path.environment.clone(),
        host: search_path.host.clone(),
        main_binary: main,
        dependencies,
        website: None,
        os_service: None,
        database_connections: Vec::new(),
        endpoint_connections: Vec::new(),
        url: None,
    })
}

fn trim_path(p: &str) -> String {
    p.trim().trim_end_matches(['\\', '/']).to_lowercase()
}

/// Link a web application to the same-host website whose application
/// physical path equals `local_dir`. Returns whether a website matched.
pub fn link_website(app: &mut Application, local_dir: &str, sites: &[Website]) -> bool {
    let wanted = trim_path(local_dir);
    for site in sites.iter().filter(|s| s.host == app.host) {
        let Some(web_app) = site
            .applications
            .iter()
            .find(|a| trim_path(&a.physical_path) == wanted)
        else {
            continue;
        };
        app.url = site_url(site, &web_app.path, &app.host.to_string());
        app.website = Some(site.clone());
        debug!(app = %app.name, site = %site.name, url = ?app.url, "website linked");
        return true;
    }
    false
}

/// `protocol://host:port/path` from the site's first http binding.
fn site_url(site: &Website, app_path: &str, scan_host: &str) -> Option<String> {
    let binding = site
        .bindings
        .iter()
        .find(|b| b.protocol.eq_ignore_ascii_case("http"))?;
    let mut parts = binding.binding_information.rsplitn(3, ':');
    let header = parts.next()?.trim();
    let port = parts.next()?.trim();
    let host = match header {
        "" | "*" => scan_host,
        h if h.eq_ignore_ascii_case("localhost") => scan_host,
        h => h,
    };
    Some(format!("{}://{}:{}{}", binding.protocol, host, port, app_path))
}

/// Link a service application to the same-host OS service whose binary path
/// contains `local_dir` (case-insensitive).
pub fn link_service(app: &mut Application, local_dir: &str, services: &[OsService]) -> bool {
    let wanted = trim_path(local_dir);
    if wanted.is_empty() {
        return false;
    }
    match services
        .iter()
        .find(|s| s.host == app.host && s.path.to_lowercase().contains(&wanted))
    {
        Some(service) => {
            debug!(app = %app.name, service = %service.name, "service linked");
            app.os_service = Some(service.clone());
            true
        }
        None => false,
    }
}

/// Run the connection parsers over every `*.config` below the
/// application's configuration root.
pub fn link_connections(app: &mut Application, main_binary: &Path) {
    let Some(bin_dir) = main_binary.parent() else {
        return;
    };
    let root = match app.role {
        Role::Web => bin_dir.parent().unwrap_or(bin_dir),
        Role::Service => bin_dir,
    };

    let mut configs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file() && file_name_lower(e.path()).ends_with(".config"))
        .map(|e| e.into_path())
        .collect();
    configs.sort();

    for path in configs {
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(config = %path.display(), error = %e, "Cannot read configuration file");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let origin = path.display().to_string();
        app.database_connections
            .extend(database_connections(&text, &origin));
        match endpoint_connections(&text, &origin) {
            Ok(endpoints) => app.endpoint_connections.extend(endpoints),
            Err(e) => warn!(config = %origin, error = %e, "Cannot parse endpoints"),
        }
    }
}

/// Full analysis of one application: resolve, then link by role, then
/// collect connections.
pub fn analyze(
    main_binary: &Path,
    search_path: &SearchPath,
    prefixes: &[String],
    sites: &[Website],
    services: &[OsService],
) -> Result<Application> {
    let mut app = resolve(main_binary, search_path, prefixes)?;
    let local_dir = local_app_dir(search_path, &app_root(app.role, main_binary));

    let linked = match app.role {
        Role::Web => link_website(&mut app, &local_dir, sites),
        Role::Service => link_service(&mut app, &local_dir, services),
    };
    if !linked {
        debug!(app = %app.name, local_dir = %local_dir, "no hosting record matched");
    }
    link_connections(&mut app, main_binary);

    info!(
        app = %app.name,
        host = %app.host,
        environment = %app.environment,
        dependencies = app.dependencies.len(),
        databases = app.database_connections.len(),
        endpoints = app.endpoint_connections.len(),
        "Application analyzed"
    );
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Host, WebsiteApplication, WebsiteBinding};
    use crate::test_utils::fixtures::{write_file, PeFixture};
    use tempfile::TempDir;

    fn search_path(share: &Path, role: Role, local: &str) -> SearchPath {
        SearchPath {
            host: Host::new("host1", "corp.local"),
            role,
            environment: "env1".to_string(),
            share: share.to_string_lossy().into_owned(),
            path: Some(local.to_string()),
        }
    }

    fn website(physical: &str, binding: &str) -> Website {
        Website {
            host: Host::new("host1", "corp.local"),
            id: 3,
            name: "Orders".to_string(),
            applications: vec![WebsiteApplication {
                path: "/orders".to_string(),
                physical_path: physical.to_string(),
                application_pool: None,
            }],
            bindings: vec![
                WebsiteBinding {
                    protocol: "https".to_string(),
                    binding_information: "*:443:secure.corp.local".to_string(),
                },
                WebsiteBinding {
                    protocol: "http".to_string(),
                    binding_information: binding.to_string(),
                },
            ],
            application_pools: Vec::new(),
        }
    }

    fn service(name: &str, path: &str) -> OsService {
        OsService {
            host: Host::new("host1", "corp.local"),
            name: name.to_string(),
            display_name: name.to_string(),
            path: path.to_string(),
            start_mode: "Auto".to_string(),
            username: "LocalSystem".to_string(),
            state: "Running".to_string(),
        }
    }

    #[test]
    fn normalizes_admin_share() {
        assert_eq!(normalize_share_path(r"\\host1\d$\Apps\env1\svc"), r"d:\Apps\env1\svc");
        assert_eq!(normalize_share_path("//host1/e$/web/"), r"e:\web");
    }

    #[test]
    fn web_binary_from_global_asax() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("MyApp");
        write_file(
            &app.join("Global.asax"),
            r#"<%@ Application Codebehind="Global.asax.cs" Inherits="MyApp.Global" Language="C#" %>"#,
        );
        assert_eq!(web_binary_path(&app), Some(app.join("bin").join("MyApp.dll")));
    }

    #[test]
    fn web_binary_unparsable_bootstrap_is_none() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("MyApp");
        write_file(&app.join("Global.asax"), "<%@ Application Language=\"C#\" %>");
        write_file(&app.join("bin").join("MyApp.Web.dll"), "");
        assert_eq!(web_binary_path(&app), None);
    }

    #[test]
    fn web_binary_falls_back_to_conventional_suffix() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("Orders");
        write_file(&app.join("bin").join("Orders.Core.dll"), "");
        write_file(&app.join("bin").join("Orders.Api.dll"), "");
        write_file(&app.join("bin").join("Other.Web.dll"), "");
        assert_eq!(
            web_binary_path(&app),
            Some(app.join("bin").join("Orders.Api.dll"))
        );
    }

    #[test]
    fn service_binary_strips_config_extension() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("MySvc");
        write_file(&app.join("MySvc.exe.config"), "<configuration/>");
        write_file(&app.join("readme.txt"), "");
        assert_eq!(service_binary_path(&app), Some(app.join("MySvc.exe")));
        assert_eq!(service_binary_path(&tmp.path().join("missing")), None);
    }

    #[test]
    fn resolves_dependencies_by_prefix() {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("web");
        let bin = share.join("Orders").join("bin");
        PeFixture::default().write_to(&bin.join("Contoso.Orders.Api.dll"));
        PeFixture::default().write_to(&bin.join("Contoso.Orders.Core.dll"));
        PeFixture::default().write_to(&bin.join("Newtonsoft.Json.dll"));
        write_file(&bin.join("Contoso.Broken.dll"), "not a binary");

        let sp = search_path(&share, Role::Web, r"d:\web");
        let prefixes = vec!["contoso.".to_string()];
        let app = resolve(&bin.join("Contoso.Orders.Api.dll"), &sp, &prefixes).unwrap();
        assert_eq!(app.name, "Contoso.Orders.Api");
        assert_eq!(app.environment, "env1");
        let deps: Vec<_> = app.dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(deps, vec!["Contoso.Orders.Core"]);
    }

    #[test]
    fn application_is_named_after_main_binary_not_folder() {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("web");
        let app_dir = share.join("MyApp-Site");
        write_file(
            &app_dir.join("Global.asax"),
            r#"<%@ Application Codebehind="Global.asax.cs" Inherits="MyApp.Global" Language="C#" %>"#,
        );
        PeFixture::default().write_to(&app_dir.join("bin").join("MyApp.dll"));

        let binary = main_binary_path(Role::Web, &app_dir).unwrap();
        let sp = search_path(&share, Role::Web, r"d:\web");
        let app = resolve(&binary, &sp, &[]).unwrap();
        assert_eq!(app.name, "MyApp");
        assert_eq!(app.main_binary.name, "MyApp");
    }

    #[test]
    fn resolve_fails_when_main_binary_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let sp = search_path(tmp.path(), Role::Service, r"d:\svc");
        assert!(resolve(&tmp.path().join("Svc").join("Svc.exe"), &sp, &[]).is_err());
    }

    #[test]
    fn links_website_and_builds_url_with_host_fallback() {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("web");
        let bin = share.join("Orders").join("bin");
        PeFixture::default().write_to(&bin.join("Orders.dll"));
        let sp = search_path(&share, Role::Web, r"D:\Apps\env1\web");

        let local = local_app_dir(&sp, &app_root(Role::Web, &bin.join("Orders.dll")));
        assert_eq!(local, r"D:\Apps\env1\web\Orders");

        let mut app = resolve(&bin.join("Orders.dll"), &sp, &[]).unwrap();
        let sites = vec![website(r"d:\apps\env1\web\orders\", "*:8080:")];
        assert!(link_website(&mut app, &local, &sites));
        assert_eq!(app.url.as_deref(), Some("http://host1.corp.local:8080/orders"));

        let mut app = resolve(&bin.join("Orders.dll"), &sp, &[]).unwrap();
        let sites = vec![website(r"d:\apps\env1\web\orders", "10.0.0.1:80:orders.corp.local")];
        assert!(link_website(&mut app, &local, &sites));
        assert_eq!(app.url.as_deref(), Some("http://orders.corp.local:80/orders"));

        let mut app = resolve(&bin.join("Orders.dll"), &sp, &[]).unwrap();
        let sites = vec![website(r"d:\apps\env1\web\other", "*:80:")];
        assert!(!link_website(&mut app, &local, &sites));
        assert!(app.website.is_none());
    }

    #[test]
    fn links_service_by_substring() {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("svc");
        let exe = share.join("MySvc").join("MySvc.exe");
        PeFixture::default().write_to(&exe);
        let sp = search_path(&share, Role::Service, r"D:\Apps\env1\svc");
        let local = local_app_dir(&sp, &app_root(Role::Service, &exe));

        let services = vec![
            service("Other", r"C:\Program Files\Other\other.exe"),
            service("MySvc", r#""D:\Apps\env1\svc\MySvc\MySvc.exe" -service"#),
        ];
        let mut app = resolve(&exe, &sp, &[]).unwrap();
        assert!(link_service(&mut app, &local, &services));
        assert_eq!(app.os_service.unwrap().name, "MySvc");
    }

    #[test]
    fn collects_connections_from_web_root() {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("web");
        let app_dir = share.join("Orders");
        PeFixture::default().write_to(&app_dir.join("bin").join("Orders.dll"));
        write_file(
            &app_dir.join("Web.config"),
            r#"<configuration>
  <connectionStrings>
    <add name="db" connectionString="Data Source=sql01.corp.local,1533;Initial Catalog=Orders" />
    <add name="bad" connectionString="this is not a connection string" />
  </connectionStrings>
  <system.serviceModel>
    <client>
      <endpoint address="http://api.corp.local/billing.svc" binding="basicHttpBinding" />
    </client>
  </system.serviceModel>
</configuration>"#,
        );
        write_file(&app_dir.join("broken.config"), "<configuration>");

        let sp = search_path(&share, Role::Web, r"d:\web");
        let app = analyze(&app_dir.join("bin").join("Orders.dll"), &sp, &[], &[], &[]).unwrap();
        assert_eq!(app.database_connections.len(), 2);
        assert_eq!(app.database_connections[0].port, Some(1533));
        assert_eq!(app.database_connections[1].connection_string, "this is not a connection string");
        assert!(app.database_connections[1].provider.is_none());
        assert_eq!(app.endpoint_connections.len(), 1);
        assert_eq!(app.url, None);
    }
}
