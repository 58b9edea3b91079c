//! Portable Executable headers, sections and the version resource.
//!
//! Everything here works on raw bytes at fixed offsets and returns `Err`
//! with a short reason on any out-of-range read.

use byteorder::{ByteOrder, LittleEndian};

/// Offset of the pointer to the PE signature inside the DOS header.
pub(crate) const PE_POINTER_OFFSET: usize = 0x3c;
/// Offset of the link timestamp relative to the PE signature.
pub(crate) const TIMESTAMP_OFFSET: usize = 8;

const DIR_RESOURCE: usize = 2;
pub(crate) const DIR_CLR: usize = 14;
const RT_VERSION: u32 = 16;
const FIXED_FILE_INFO_SIGNATURE: u32 = 0xfeef_04bd;
const VS_FF_DEBUG: u32 = 0x1;
const VS_FF_PRERELEASE: u32 = 0x2;

pub(crate) type ParseResult<T> = Result<T, String>;

fn range(data: &[u8], off: usize, len: usize) -> ParseResult<&[u8]> {
    off.checked_add(len)
        .and_then(|end| data.get(off..end))
        .ok_or_else(|| format!("truncated: need {} byte(s) at {:#x}", len, off))
}

pub(crate) fn u8_at(data: &[u8], off: usize) -> ParseResult<u8> {
    range(data, off, 1).map(|b| b[0])
}

pub(crate) fn u16_at(data: &[u8], off: usize) -> ParseResult<u16> {
    range(data, off, 2).map(LittleEndian::read_u16)
}

pub(crate) fn u32_at(data: &[u8], off: usize) -> ParseResult<u32> {
    range(data, off, 4).map(LittleEndian::read_u32)
}

pub(crate) fn u64_at(data: &[u8], off: usize) -> ParseResult<u64> {
    range(data, off, 8).map(LittleEndian::read_u64)
}

pub(crate) fn i32_at(data: &[u8], off: usize) -> ParseResult<i32> {
    range(data, off, 4).map(LittleEndian::read_i32)
}

pub(crate) fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Link timestamp straight from the header region: the PE pointer at
/// offset 60, plus 8, read as little-endian seconds since the epoch.
pub(crate) fn header_timestamp(head: &[u8]) -> ParseResult<i32> {
    let pe = u32_at(head, PE_POINTER_OFFSET)? as usize;
    let at = pe
        .checked_add(TIMESTAMP_OFFSET)
        .ok_or_else(|| "PE header pointer overflows".to_string())?;
    i32_at(head, at)
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_pointer: u32,
    raw_size: u32,
}

pub(crate) struct PeImage<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
    directories: Vec<(u32, u32)>,
}

impl<'a> PeImage<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> ParseResult<Self> {
        if range(data, 0, 2)? != b"MZ" {
            return Err("missing MZ signature".to_string());
        }
        let pe = u32_at(data, PE_POINTER_OFFSET)? as usize;
        if range(data, pe, 4)? != b"PE\0\0" {
            return Err(format!("missing PE signature at {:#x}", pe));
        }

        let coff = pe + 4;
        let section_count = u16_at(data, coff + 2)? as usize;
        let optional_size = u16_at(data, coff + 16)? as usize;
        let optional = coff + 20;

        let directories_at = match u16_at(data, optional)? {
            0x10b => optional + 96,
            0x20b => optional + 112,
            other => return Err(format!("unknown optional header magic {:#x}", other)),
        };
        let directory_count = (u32_at(data, directories_at - 4)? as usize).min(16);
        let mut directories = Vec::with_capacity(directory_count);
        for i in 0..directory_count {
            let at = directories_at + i * 8;
            directories.push((u32_at(data, at)?, u32_at(data, at + 4)?));
        }

        let table = optional + optional_size;
        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let at = table + i * 40;
            sections.push(Section {
                virtual_size: u32_at(data, at + 8)?,
                virtual_address: u32_at(data, at + 12)?,
                raw_size: u32_at(data, at + 16)?,
                raw_pointer: u32_at(data, at + 20)?,
            });
        }

        Ok(Self {
            data,
            sections,
            directories,
        })
    }

    pub(crate) fn directory(&self, index: usize) -> Option<(u32, u32)> {
        self.directories
            .get(index)
            .copied()
            .filter(|(rva, size)| *rva != 0 && *size != 0)
    }

    pub(crate) fn rva_to_offset(&self, rva: u32) -> ParseResult<usize> {
        let section = self
            .sections
            .iter()
            .find(|s| {
                let span = s.virtual_size.max(s.raw_size);
                rva >= s.virtual_address && rva - s.virtual_address < span
            })
            .ok_or_else(|| format!("RVA {:#x} is outside every section", rva))?;
        section
            .raw_pointer
            .checked_add(rva - section.virtual_address)
            .map(|off| off as usize)
            .ok_or_else(|| "section raw pointer overflows".to_string())
    }

    pub(crate) fn slice_at_rva(&self, rva: u32, size: u32) -> ParseResult<&'a [u8]> {
        let off = self.rva_to_offset(rva)?;
        range(self.data, off, size as usize)
    }

    /// The image's version resource, or `None` when it carries none.
    pub(crate) fn version_resource(&self) -> ParseResult<Option<VersionResource>> {
        let Some((rva, _)) = self.directory(DIR_RESOURCE) else {
            return Ok(None);
        };
        let base = self.rva_to_offset(rva)?;

        let Some(by_type) = self.resource_entry(base, 0, Some(RT_VERSION))? else {
            return Ok(None);
        };
        let by_name = self.subdirectory(by_type)?;
        let Some(by_lang) = self.resource_entry(base, by_name, None)? else {
            return Ok(None);
        };
        let by_lang = self.subdirectory(by_lang)?;
        let Some(leaf) = self.resource_entry(base, by_lang, None)? else {
            return Ok(None);
        };
        if leaf & 0x8000_0000 != 0 {
            return Err("version resource leaf is a directory".to_string());
        }

        let entry = base + leaf as usize;
        let data_rva = u32_at(self.data, entry)?;
        let data_size = u32_at(self.data, entry + 4)?;
        let block = self.slice_at_rva(data_rva, data_size)?;
        parse_version_info(block).map(Some)
    }

    fn subdirectory(&self, entry: u32) -> ParseResult<usize> {
        if entry & 0x8000_0000 == 0 {
            return Err("expected a resource subdirectory".to_string());
        }
        Ok((entry & 0x7fff_ffff) as usize)
    }

    /// Look up an entry in the resource directory at `base + dir`. With
    /// `want` set, only an id entry with that id matches; otherwise the first
    /// entry wins. Returns the raw offset-to-data field.
    fn resource_entry(&self, base: usize, dir: usize, want: Option<u32>) -> ParseResult<Option<u32>> {
        let at = base + dir;
        let named = u16_at(self.data, at + 12)? as usize;
        let ids = u16_at(self.data, at + 14)? as usize;
        for i in 0..named + ids {
            let entry = at + 16 + i * 8;
            let name = u32_at(self.data, entry)?;
            let offset = u32_at(self.data, entry + 4)?;
            match want {
                None => return Ok(Some(offset)),
                Some(id) if name & 0x8000_0000 == 0 && name == id => return Ok(Some(offset)),
                Some(_) => {}
            }
        }
        Ok(None)
    }
}

/// Strings and flags from a `VS_VERSIONINFO` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct VersionResource {
    pub company: String,
    pub product: String,
    pub file_version: String,
    pub product_version: String,
    pub is_debug: bool,
    pub is_pre_release: bool,
}

struct Block {
    key: String,
    value_start: usize,
    value_bytes: usize,
    children_start: usize,
    end: usize,
}

fn read_utf16z(data: &[u8], mut at: usize, end: usize) -> ParseResult<(String, usize)> {
    let mut units = Vec::new();
    while at + 2 <= end {
        let unit = u16_at(data, at)?;
        at += 2;
        if unit == 0 {
            return Ok((String::from_utf16_lossy(&units), at));
        }
        units.push(unit);
    }
    Err("unterminated UTF-16 key".to_string())
}

fn read_block(data: &[u8], at: usize) -> ParseResult<Block> {
    let length = u16_at(data, at)? as usize;
    let value_length = u16_at(data, at + 2)? as usize;
    let kind = u16_at(data, at + 4)?;
    if length < 6 {
        return Err(format!("version block at {:#x} is too short", at));
    }
    let end = at + length;
    if end > data.len() {
        return Err(format!("version block at {:#x} overruns the resource", at));
    }
    let (key, after_key) = read_utf16z(data, at + 6, end)?;
    let value_start = align4(after_key);
    let value_bytes = if kind == 1 { value_length * 2 } else { value_length };
    let children_start = align4(value_start + value_bytes).min(end);
    Ok(Block {
        key,
        value_start,
        value_bytes,
        children_start,
        end,
    })
}

fn children(data: &[u8], parent: &Block) -> ParseResult<Vec<Block>> {
    let mut out = Vec::new();
    let mut at = parent.children_start;
    while at + 6 <= parent.end {
        let child = read_block(data, at)?;
        if child.end > parent.end {
            return Err(format!("version block '{}' overruns its parent", child.key));
        }
        at = align4(child.end);
        out.push(child);
    }
    Ok(out)
}

fn text_value(data: &[u8], block: &Block) -> String {
    let end = (block.value_start + block.value_bytes).min(block.end);
    let units: Vec<u16> = data
        .get(block.value_start..end)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn packed_version(ms: u32, ls: u32) -> String {
    format!("{}.{}.{}.{}", ms >> 16, ms & 0xffff, ls >> 16, ls & 0xffff)
}

pub(crate) fn parse_version_info(data: &[u8]) -> ParseResult<VersionResource> {
    let root = read_block(data, 0)?;
    if root.key != "VS_VERSION_INFO" {
        return Err(format!("unexpected version resource key '{}'", root.key));
    }

    let mut out = VersionResource::default();
    let mut fixed_versions = None;
    if root.value_bytes >= 52 {
        let fixed = root.value_start;
        if u32_at(data, fixed)? != FIXED_FILE_INFO_SIGNATURE {
            return Err("bad VS_FIXEDFILEINFO signature".to_string());
        }
        let flags = u32_at(data, fixed + 28)? & u32_at(data, fixed + 24)?;
        out.is_debug = flags & VS_FF_DEBUG != 0;
        out.is_pre_release = flags & VS_FF_PRERELEASE != 0;
        fixed_versions = Some((
            packed_version(u32_at(data, fixed + 8)?, u32_at(data, fixed + 12)?),
            packed_version(u32_at(data, fixed + 16)?, u32_at(data, fixed + 20)?),
        ));
    }

    for info in children(data, &root)? {
        if info.key != "StringFileInfo" {
            continue;
        }
        if let Some(table) = children(data, &info)?.into_iter().next() {
            for entry in children(data, &table)? {
                let value = text_value(data, &entry);
                match entry.key.as_str() {
                    "CompanyName" => out.company = value,
                    "ProductName" => out.product = value,
                    "FileVersion" => out.file_version = value,
                    "ProductVersion" => out.product_version = value,
                    _ => {}
                }
            }
        }
    }

    if let Some((file, product)) = fixed_versions {
        if out.file_version.is_empty() {
            out.file_version = file;
        }
        if out.product_version.is_empty() {
            out.product_version = product;
        }
    }
    Ok(out)
}
