//! Binary identity reader.
//!
//! Reads the version resource, the managed assembly version and the link
//! timestamp of a deployable Windows binary (`.dll` / `.exe`) without
//! loading it. Parsing is pure byte inspection, so it works the same on any
//! platform the engine runs on.
//!
//! # Failure modes
//!
//! | Error | When |
//! |-------|------|
//! | [`IdentityError::Unreadable`] | the file cannot be opened or read |
//! | [`IdentityError::MalformedHeader`] | the bytes are not a managed PE image |
//!
//! A missing version resource is not an error: the version strings are left
//! empty and the flags false.

mod clr;
mod pe;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::models::{BinaryIdentity, VersionInfo};

/// Bytes read from the start of a binary to find its link timestamp.
pub const HEADER_REGION: usize = 2048;

#[derive(Debug)]
pub enum IdentityError {
    Unreadable { path: PathBuf, source: std::io::Error },
    MalformedHeader { path: PathBuf, reason: String },
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Unreadable { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            IdentityError::MalformedHeader { path, reason } => {
                write!(f, "malformed binary {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for IdentityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IdentityError::Unreadable { source, .. } => Some(source),
            IdentityError::MalformedHeader { .. } => None,
        }
    }
}

fn malformed(path: &Path) -> impl Fn(String) -> IdentityError + '_ {
    move |reason| IdentityError::MalformedHeader {
        path: path.to_path_buf(),
        reason,
    }
}

/// Read the identity of the binary at `path`.
pub fn read_identity(path: &Path) -> Result<BinaryIdentity, IdentityError> {
    let data = std::fs::read(path).map_err(|source| IdentityError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let image = pe::PeImage::parse(&data).map_err(malformed(path))?;
    let resource = image
        .version_resource()
        .map_err(malformed(path))?
        .unwrap_or_default();
    let assembly_version = clr::assembly_version(&image).map_err(malformed(path))?;
    let head = &data[..data.len().min(HEADER_REGION)];
    let build_timestamp = timestamp_from_header(head).map_err(malformed(path))?;

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(BinaryIdentity {
        name,
        product: resource.product,
        company: resource.company,
        is_debug: resource.is_debug,
        is_pre_release: resource.is_pre_release,
        path: path.to_string_lossy().into_owned(),
        version: VersionInfo {
            assembly_version,
            file_version: resource.file_version,
            product_version: resource.product_version,
            build_timestamp,
        },
    })
}

/// Read only the link timestamp, from the first [`HEADER_REGION`] bytes.
pub fn read_build_timestamp(path: &Path) -> Result<DateTime<Utc>, IdentityError> {
    let unreadable = |source| IdentityError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut head = Vec::with_capacity(HEADER_REGION);
    File::open(path)
        .and_then(|f| f.take(HEADER_REGION as u64).read_to_end(&mut head))
        .map_err(unreadable)?;
    timestamp_from_header(&head).map_err(malformed(path))
}

fn timestamp_from_header(head: &[u8]) -> Result<DateTime<Utc>, String> {
    let seconds = pe::header_timestamp(head)?;
    DateTime::<Utc>::from_timestamp(i64::from(seconds), 0)
        .ok_or_else(|| format!("link timestamp {} is out of range", seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{PeFixture, SECTION_RAW_POINTER_AT};
    use tempfile::TempDir;

    #[test]
    fn reads_full_identity() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Orders.Api.dll");
        PeFixture {
            timestamp: 1_600_000_000,
            assembly_version: (2, 1, 0, 7),
            company: "Contoso".into(),
            product: "Orders".into(),
            file_version: "2.1.0.7".into(),
            product_version: "2.1.0-rc1".into(),
            is_debug: true,
            is_pre_release: true,
            ..PeFixture::default()
        }
        .write_to(&path);

        let id = read_identity(&path).unwrap();
        assert_eq!(id.name, "Orders.Api");
        assert_eq!(id.company, "Contoso");
        assert_eq!(id.product, "Orders");
        assert!(id.is_debug);
        assert!(id.is_pre_release);
        assert_eq!(id.version.assembly_version, "2.1.0.7");
        assert_eq!(id.version.file_version, "2.1.0.7");
        assert_eq!(id.version.product_version, "2.1.0-rc1");
        assert_eq!(id.version.build_timestamp.timestamp(), 1_600_000_000);
    }

    #[test]
    fn missing_version_resource_leaves_strings_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Bare.dll");
        PeFixture {
            version_resource: false,
            ..PeFixture::default()
        }
        .write_to(&path);

        let id = read_identity(&path).unwrap();
        assert_eq!(id.company, "");
        assert_eq!(id.version.file_version, "");
        assert!(!id.is_debug);
        assert_eq!(id.version.assembly_version, "1.0.0.0");
    }

    #[test]
    fn native_image_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("native.dll");
        PeFixture {
            managed: false,
            ..PeFixture::default()
        }
        .write_to(&path);
        assert!(matches!(
            read_identity(&path),
            Err(IdentityError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn text_file_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("readme.dll");
        std::fs::write(&path, "hello").unwrap();
        assert!(matches!(
            read_identity(&path),
            Err(IdentityError::MalformedHeader { .. })
        ));
        assert!(matches!(
            read_build_timestamp(&path),
            Err(IdentityError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn overflowing_section_pointer_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Crafted.dll");
        let mut image = PeFixture::default().build();
        image[SECTION_RAW_POINTER_AT..SECTION_RAW_POINTER_AT + 4]
            .copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        std::fs::write(&path, image).unwrap();

        assert!(matches!(
            read_identity(&path),
            Err(IdentityError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn same_binary_reads_identically() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Orders.Api.dll");
        PeFixture {
            product_version: "3.0.0-beta".into(),
            is_pre_release: true,
            ..PeFixture::default()
        }
        .write_to(&path);

        let first = read_identity(&path).unwrap();
        let second = read_identity(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn missing_file_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let err = read_identity(&tmp.path().join("gone.dll")).unwrap_err();
        assert!(matches!(err, IdentityError::Unreadable { .. }));
        assert!(err.to_string().contains("gone.dll"));
    }

    #[test]
    fn timestamp_only_reads_header_region() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Svc.exe");
        PeFixture {
            timestamp: 1_234_567_890,
            ..PeFixture::default()
        }
        .write_to(&path);
        let ts = read_build_timestamp(&path).unwrap();
        assert_eq!(ts.timestamp(), 1_234_567_890);
    }
}
