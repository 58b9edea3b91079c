//! Parsing of a host's master site configuration (`applicationHost.config`).

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::models::{Host, Website, WebsiteApplication, WebsiteApplicationPool, WebsiteBinding};
use crate::xml::{parse_document, Element};

/// Application pools and websites declared in one master configuration.
#[derive(Debug, Clone, Default)]
pub struct SiteConfig {
    pub pools: Vec<WebsiteApplicationPool>,
    pub sites: Vec<Website>,
}

pub fn parse_site_config(xml: &str, host: &Host) -> Result<SiteConfig> {
    let root = parse_document(xml)?;
    let pools_el = root
        .descendants("applicationPools")
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no applicationPools section"))?;

    let pools = pools_el
        .children_named("add")
        .filter_map(application_pool)
        .collect();

    let sites = root
        .descendants("site")
        .into_iter()
        .filter_map(|el| website(el, host))
        .collect();

    Ok(SiteConfig { pools, sites })
}

fn application_pool(el: &Element) -> Option<WebsiteApplicationPool> {
    let name = el.attr("name")?.to_string();
    Some(WebsiteApplicationPool {
        name,
        runtime_version: el.attr("managedRuntimeVersion").map(str::to_string),
        pipeline_mode: el.attr("managedPipelineMode").map(str::to_string),
        username: el
            .child("processModel")
            .and_then(|pm| pm.attr("userName"))
            .map(str::to_string),
    })
}

fn website(el: &Element, host: &Host) -> Option<Website> {
    let name = el.attr("name")?.to_string();
    let id = match el.attr("id").and_then(|id| id.trim().parse::<u32>().ok()) {
        Some(id) => id,
        None => {
            warn!(site = %name, host = %host, "Skipping website with missing or invalid id");
            return None;
        }
    };

    let applications = el
        .children_named("application")
        .filter_map(|a| {
            Some(WebsiteApplication {
                path: a.attr("path")?.to_string(),
                physical_path: a
                    .child("virtualDirectory")
                    .and_then(|vd| vd.attr("physicalPath"))?
                    .to_string(),
                application_pool: a.attr("applicationPool").map(str::to_string),
            })
        })
        .collect();

    let bindings = el
        .descendants("binding")
        .into_iter()
        .filter_map(|b| {
            Some(WebsiteBinding {
                protocol: b.attr("protocol")?.to_string(),
                binding_information: b.attr("bindingInformation")?.to_string(),
            })
        })
        .collect();

    Some(Website {
        host: host.clone(),
        id,
        name,
        applications,
        bindings,
        application_pools: Vec::new(),
    })
}

/// Second pass: attach the pools referenced by each site's applications.
pub fn attach_pools(sites: &mut [Website], pools: &[WebsiteApplicationPool]) {
    for site in sites.iter_mut() {
        site.application_pools = pools
            .iter()
            .filter(|p| {
                site.applications
                    .iter()
                    .any(|a| a.application_pool.as_deref() == Some(p.name.as_str()))
            })
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPLICATION_HOST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<configuration>
  <system.applicationHost>
    <applicationPools>
      <add name="OrdersPool" managedRuntimeVersion="v4.0" managedPipelineMode="Integrated">
        <processModel identityType="SpecificUser" userName="CORP\svc-orders" />
      </add>
      <add name="Unused" managedRuntimeVersion="" />
      <applicationPoolDefaults><processModel identityType="ApplicationPoolIdentity" /></applicationPoolDefaults>
    </applicationPools>
    <sites>
      <site name="Orders" id="3">
        <application path="/" applicationPool="OrdersPool">
          <virtualDirectory path="/" physicalPath="d:\sites\Orders" />
        </application>
        <bindings>
          <binding protocol="https" bindingInformation="*:443:orders.corp.local" />
          <binding protocol="http" bindingInformation="*:8080:" />
        </bindings>
      </site>
      <site name="Broken" id="x" />
    </sites>
  </system.applicationHost>
</configuration>"#;

    #[test]
    fn parses_pools_sites_and_bindings() {
        let host = Host::new("host1", "corp.local");
        let mut parsed = parse_site_config(APPLICATION_HOST, &host).unwrap();
        assert_eq!(parsed.pools.len(), 2);
        assert_eq!(parsed.pools[0].username.as_deref(), Some(r"CORP\svc-orders"));
        assert_eq!(parsed.pools[1].pipeline_mode, None);

        assert_eq!(parsed.sites.len(), 1);
        let site = &parsed.sites[0];
        assert_eq!(site.id, 3);
        assert_eq!(site.applications[0].physical_path, r"d:\sites\Orders");
        assert_eq!(site.bindings.len(), 2);

        attach_pools(&mut parsed.sites, &parsed.pools);
        assert_eq!(parsed.sites[0].application_pools.len(), 1);
        assert_eq!(parsed.sites[0].application_pools[0].name, "OrdersPool");
    }

    #[test]
    fn missing_pool_section_is_an_error() {
        let host = Host::new("host1", "");
        assert!(parse_site_config("<configuration><sites/></configuration>", &host).is_err());
    }
}
