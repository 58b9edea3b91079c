//! Shared helpers for unit tests.

#[cfg(test)]
pub mod fixtures {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::catalog::{PREFIXES_FILE, SEARCH_PATH_DIR};
    use crate::models::{Host, OsService, Role, SearchPath};
    use crate::probe::HostProbe;

    /// Write `contents` to `path`, creating parent directories.
    pub fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    /// Git-backed tests are skipped on machines without a `git` binary.
    pub fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run git in `dir`, panicking on failure.
    pub fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    pub const APPLICATION_HOST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<configuration>
  <system.applicationHost>
    <applicationPools>
      <add name="OrdersPool" managedRuntimeVersion="v4.0" managedPipelineMode="Integrated">
        <processModel identityType="SpecificUser" userName="CORP\svc-orders" />
      </add>
    </applicationPools>
    <sites>
      <site name="Orders" id="3">
        <application path="/" applicationPool="OrdersPool">
          <virtualDirectory path="/" physicalPath="d:\Apps\env1\web\Orders" />
        </application>
        <bindings>
          <binding protocol="http" bindingInformation="*:8080:" />
        </bindings>
      </site>
    </sites>
  </system.applicationHost>
</configuration>"#;

    /// In-memory [`HostProbe`]; hosts without an entry are unreachable.
    #[derive(Debug, Default)]
    pub struct FakeProbe {
        pub site_configs: HashMap<String, String>,
        pub services: HashMap<String, Vec<OsService>>,
    }

    impl FakeProbe {
        pub fn service(host: &Host, name: &str, path: &str) -> OsService {
            OsService {
                host: host.clone(),
                name: name.to_string(),
                display_name: name.to_string(),
                path: path.to_string(),
                start_mode: "Auto".to_string(),
                username: "LocalSystem".to_string(),
                state: "Running".to_string(),
            }
        }
    }

    #[async_trait]
    impl HostProbe for FakeProbe {
        async fn site_config(&self, host: &Host) -> Result<String> {
            match self.site_configs.get(&host.to_string()) {
                Some(xml) => Ok(xml.clone()),
                None => bail!("host {} unreachable", host),
            }
        }

        async fn services(&self, host: &Host) -> Result<Vec<OsService>> {
            match self.services.get(&host.to_string()) {
                Some(services) => Ok(services.clone()),
                None => bail!("host {} unreachable", host),
            }
        }
    }

    /// A data directory plus the shares of one host (`host1.corp.local`):
    ///
    /// - `web/Orders` (linked to site 3 of [`APPLICATION_HOST`]) and
    ///   `web/Legacy` (not allow-listed), `web/Empty`
    /// - `svc/MySvc` with a connection string in `MySvc.exe.config`
    pub struct Fleet {
        pub tmp: TempDir,
        pub data: PathBuf,
        pub shares: PathBuf,
    }

    impl Fleet {
        pub fn host() -> Host {
            Host::new("host1", "corp.local")
        }

        pub fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let data = tmp.path().join("data");
            let shares = tmp.path().join("shares");
            let fleet = Fleet { tmp, data, shares };

            write_file(&fleet.data.join(PREFIXES_FILE), r#"["Orders.", "MySvc"]"#);
            fleet.write_search_path("host1.env1.web.json", &fleet.search_path(Role::Web));
            fleet.write_search_path("host1.env1.svc.json", &fleet.search_path(Role::Service));

            let web = fleet.shares.join("web");
            PeFixture::default().write_to(&web.join("Orders").join("bin").join("Orders.Api.dll"));
            PeFixture::default().write_to(&web.join("Orders").join("bin").join("Orders.Domain.dll"));
            PeFixture::default().write_to(&web.join("Legacy").join("bin").join("Legacy.Web.dll"));
            std::fs::create_dir_all(web.join("Empty")).unwrap();

            let svc = fleet.shares.join("svc").join("MySvc");
            PeFixture::default().write_to(&svc.join("MySvc.exe"));
            write_file(
                &svc.join("MySvc.exe.config"),
                r#"<configuration><connectionStrings><add name="x" connectionString="Server=sql01;Database=Jobs" /></connectionStrings></configuration>"#,
            );
            fleet
        }

        pub fn search_path(&self, role: Role) -> SearchPath {
            let (dir, local) = match role {
                Role::Web => ("web", r"d:\Apps\env1\web"),
                Role::Service => ("svc", r"D:\Apps\env1\svc"),
            };
            SearchPath {
                host: Self::host(),
                role,
                environment: "env1".to_string(),
                share: self.shares.join(dir).to_string_lossy().into_owned(),
                path: Some(local.to_string()),
            }
        }

        pub fn write_search_path(&self, file: &str, sp: &SearchPath) {
            write_file(
                &self.data.join(SEARCH_PATH_DIR).join(file),
                &serde_json::to_string_pretty(sp).unwrap(),
            );
        }

        /// Probe answering for `host1` only.
        pub fn probe() -> Arc<FakeProbe> {
            let host = Self::host();
            let mut probe = FakeProbe::default();
            probe
                .site_configs
                .insert(host.to_string(), APPLICATION_HOST.to_string());
            probe.services.insert(
                host.to_string(),
                vec![
                    FakeProbe::service(&host, "Zeta", r#""D:\Apps\env1\svc\Zeta\Zeta.exe""#),
                    FakeProbe::service(&host, "MySvc", r"D:\Apps\env1\svc\MySvc\MySvc.exe"),
                    FakeProbe::service(&host, "Spooler", r"C:\Windows\System32\spoolsv.exe"),
                ],
            );
            Arc::new(probe)
        }
    }

    /// Builder for a minimal PE32 image with optional CLR metadata and
    /// version resource.
    #[derive(Debug, Clone)]
    pub struct PeFixture {
        pub timestamp: u32,
        pub assembly_version: (u16, u16, u16, u16),
        pub company: String,
        pub product: String,
        pub file_version: String,
        pub product_version: String,
        pub is_debug: bool,
        pub is_pre_release: bool,
        pub version_resource: bool,
        pub managed: bool,
    }

    impl Default for PeFixture {
        fn default() -> Self {
            Self {
                timestamp: 1_500_000_000,
                assembly_version: (1, 0, 0, 0),
                company: "Fixture Co".into(),
                product: "Fixture".into(),
                file_version: "1.0.0.0".into(),
                product_version: "1.0.0".into(),
                is_debug: false,
                is_pre_release: false,
                version_resource: true,
                managed: true,
            }
        }
    }

    const FILE_ALIGN: usize = 0x200;
    const SECTION_RVA: u32 = 0x2000;
    const PE_AT: usize = 0x80;
    const OPTIONAL_AT: usize = PE_AT + 24;
    const DIRECTORIES_AT: usize = OPTIONAL_AT + 96;
    const SECTIONS_AT: usize = OPTIONAL_AT + 0xe0;
    /// `PointerToRawData` of the single section in a built image.
    pub const SECTION_RAW_POINTER_AT: usize = SECTIONS_AT + 20;

    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn pad_to(buf: &mut Vec<u8>, align: usize) {
        while buf.len() % align != 0 {
            buf.push(0);
        }
    }

    fn utf16z(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    fn version_block(key: &str, value: &[u8], value_length: u16, kind: u16, children: &[Vec<u8>]) -> Vec<u8> {
        let mut b = vec![0u8; 6];
        put_u16(&mut b, 2, value_length);
        put_u16(&mut b, 4, kind);
        b.extend_from_slice(&utf16z(key));
        pad_to(&mut b, 4);
        b.extend_from_slice(value);
        for child in children {
            pad_to(&mut b, 4);
            b.extend_from_slice(child);
        }
        let len = b.len() as u16;
        put_u16(&mut b, 0, len);
        b
    }

    fn resource_dir(id: u32, offset: u32) -> Vec<u8> {
        let mut d = vec![0u8; 24];
        put_u16(&mut d, 14, 1);
        put_u32(&mut d, 16, id);
        put_u32(&mut d, 20, offset);
        d
    }

    impl PeFixture {
        fn version_info(&self) -> Vec<u8> {
            let (a, b, c, d) = self.assembly_version;
            let ms = (u32::from(a) << 16) | u32::from(b);
            let ls = (u32::from(c) << 16) | u32::from(d);
            let mut flags = 0u32;
            if self.is_debug {
                flags |= 0x1;
            }
            if self.is_pre_release {
                flags |= 0x2;
            }
            let mut fixed = vec![0u8; 52];
            put_u32(&mut fixed, 0, 0xfeef_04bd);
            put_u32(&mut fixed, 4, 0x0001_0000);
            put_u32(&mut fixed, 8, ms);
            put_u32(&mut fixed, 12, ls);
            put_u32(&mut fixed, 16, ms);
            put_u32(&mut fixed, 20, ls);
            put_u32(&mut fixed, 24, 0x3f);
            put_u32(&mut fixed, 28, flags);
            put_u32(&mut fixed, 32, 0x4);
            put_u32(&mut fixed, 36, 0x2);

            let strings: Vec<Vec<u8>> = [
                ("CompanyName", &self.company),
                ("ProductName", &self.product),
                ("FileVersion", &self.file_version),
                ("ProductVersion", &self.product_version),
            ]
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| {
                let value = utf16z(v);
                version_block(k, &value, (value.len() / 2) as u16, 1, &[])
            })
            .collect();
            let table = version_block("040904b0", &[], 0, 1, &strings);
            let string_info = version_block("StringFileInfo", &[], 0, 1, &[table]);
            version_block("VS_VERSION_INFO", &fixed, 52, 0, &[string_info])
        }

        fn metadata(&self) -> Vec<u8> {
            let (a, b, c, d) = self.assembly_version;
            let mut tables = Vec::new();
            tables.extend_from_slice(&0u32.to_le_bytes());
            tables.extend_from_slice(&[2, 0, 0, 1]);
            tables.extend_from_slice(&(1u64 | (1u64 << 0x20)).to_le_bytes());
            tables.extend_from_slice(&0u64.to_le_bytes());
            tables.extend_from_slice(&1u32.to_le_bytes());
            tables.extend_from_slice(&1u32.to_le_bytes());
            // Module row: generation, name, mvid, encid, encbaseid.
            tables.extend_from_slice(&[0u8; 10]);
            // Assembly row.
            tables.extend_from_slice(&0x8004u32.to_le_bytes());
            for part in [a, b, c, d] {
                tables.extend_from_slice(&part.to_le_bytes());
            }
            tables.extend_from_slice(&[0u8; 10]);

            let mut root = Vec::new();
            root.extend_from_slice(&0x424a_5342u32.to_le_bytes());
            root.extend_from_slice(&1u16.to_le_bytes());
            root.extend_from_slice(&1u16.to_le_bytes());
            root.extend_from_slice(&0u32.to_le_bytes());
            root.extend_from_slice(&12u32.to_le_bytes());
            root.extend_from_slice(b"v4.0.30319\0\0");
            root.extend_from_slice(&0u16.to_le_bytes());
            root.extend_from_slice(&1u16.to_le_bytes());
            let stream_offset = root.len() as u32 + 12;
            root.extend_from_slice(&stream_offset.to_le_bytes());
            root.extend_from_slice(&(tables.len() as u32).to_le_bytes());
            root.extend_from_slice(b"#~\0\0");
            root.extend_from_slice(&tables);
            root
        }

        pub fn build(&self) -> Vec<u8> {
            let mut section = Vec::new();
            let mut clr = (0u32, 0u32);
            let mut rsrc = (0u32, 0u32);

            if self.managed {
                let metadata = self.metadata();
                let mut header = vec![0u8; 72];
                put_u32(&mut header, 0, 72);
                put_u16(&mut header, 4, 2);
                put_u16(&mut header, 6, 5);
                put_u32(&mut header, 8, SECTION_RVA + 72);
                put_u32(&mut header, 12, metadata.len() as u32);
                put_u32(&mut header, 16, 1);
                section.extend_from_slice(&header);
                section.extend_from_slice(&metadata);
                clr = (SECTION_RVA, 72);
                pad_to(&mut section, 16);
            }

            if self.version_resource {
                let start = section.len() as u32;
                let rva = SECTION_RVA + start;
                let info = self.version_info();
                section.extend_from_slice(&resource_dir(16, 0x8000_0000 | 0x18));
                section.extend_from_slice(&resource_dir(1, 0x8000_0000 | 0x30));
                section.extend_from_slice(&resource_dir(0x409, 0x48));
                let mut entry = vec![0u8; 16];
                put_u32(&mut entry, 0, rva + 0x58);
                put_u32(&mut entry, 4, info.len() as u32);
                section.extend_from_slice(&entry);
                section.extend_from_slice(&info);
                rsrc = (rva, section.len() as u32 - start);
            }

            let virtual_size = section.len().max(1) as u32;
            if section.is_empty() {
                section.push(0);
            }
            pad_to(&mut section, FILE_ALIGN);

            let mut image = vec![0u8; FILE_ALIGN];
            image[0..2].copy_from_slice(b"MZ");
            put_u32(&mut image, 0x3c, PE_AT as u32);
            image[PE_AT..PE_AT + 4].copy_from_slice(b"PE\0\0");
            put_u16(&mut image, PE_AT + 4, 0x14c);
            put_u16(&mut image, PE_AT + 6, 1);
            put_u32(&mut image, PE_AT + 8, self.timestamp);
            put_u16(&mut image, PE_AT + 20, 0xe0);
            put_u16(&mut image, PE_AT + 22, 0x2102);

            put_u16(&mut image, OPTIONAL_AT, 0x10b);
            put_u32(&mut image, DIRECTORIES_AT - 4, 16);
            put_u32(&mut image, DIRECTORIES_AT + 2 * 8, rsrc.0);
            put_u32(&mut image, DIRECTORIES_AT + 2 * 8 + 4, rsrc.1);
            put_u32(&mut image, DIRECTORIES_AT + 14 * 8, clr.0);
            put_u32(&mut image, DIRECTORIES_AT + 14 * 8 + 4, clr.1);

            image[SECTIONS_AT..SECTIONS_AT + 5].copy_from_slice(b".text");
            put_u32(&mut image, SECTIONS_AT + 8, virtual_size);
            put_u32(&mut image, SECTIONS_AT + 12, SECTION_RVA);
            put_u32(&mut image, SECTIONS_AT + 16, section.len() as u32);
            put_u32(&mut image, SECTIONS_AT + 20, FILE_ALIGN as u32);
            put_u32(&mut image, SECTIONS_AT + 36, 0x6000_0020);

            image.extend_from_slice(&section);
            image
        }

        pub fn write_to(&self, path: &Path) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, self.build()).unwrap();
        }
    }
}
