//! Managed assembly version from the CLR metadata tables.
//!
//! Locating the `Assembly` row means sizing every table before it, which
//! in turn needs the ECMA-335 column layouts and coded-index widths.

use super::pe::{align4, u16_at, u32_at, u64_at, u8_at, ParseResult, PeImage, DIR_CLR};

const METADATA_SIGNATURE: u32 = 0x424a_5342;
const ASSEMBLY_TABLE: usize = 0x20;

#[derive(Clone, Copy)]
enum Col {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Table(usize),
    Coded(&'static [usize], u32),
}

use Col::*;

const TYPE_DEF_OR_REF: Col = Coded(&[0x02, 0x01, 0x1b], 2);
const HAS_CONSTANT: Col = Coded(&[0x04, 0x08, 0x17], 2);
const HAS_CUSTOM_ATTRIBUTE: Col = Coded(
    &[
        0x06, 0x04, 0x01, 0x02, 0x08, 0x09, 0x0a, 0x00, 0x0e, 0x17, 0x14, 0x11, 0x1a, 0x1b, 0x20,
        0x23, 0x26, 0x27, 0x28, 0x2a, 0x2c, 0x2b,
    ],
    5,
);
const HAS_FIELD_MARSHAL: Col = Coded(&[0x04, 0x08], 1);
const HAS_DECL_SECURITY: Col = Coded(&[0x02, 0x06, 0x20], 2);
const MEMBER_REF_PARENT: Col = Coded(&[0x02, 0x01, 0x1a, 0x06, 0x1b], 3);
const HAS_SEMANTICS: Col = Coded(&[0x14, 0x17], 1);
const METHOD_DEF_OR_REF: Col = Coded(&[0x06, 0x0a], 1);
const MEMBER_FORWARDED: Col = Coded(&[0x04, 0x06], 1);
const CUSTOM_ATTRIBUTE_TYPE: Col = Coded(&[0x06, 0x0a], 3);
const RESOLUTION_SCOPE: Col = Coded(&[0x00, 0x1a, 0x23, 0x01], 2);

/// Column layouts of tables 0x00 through 0x1F.
const SCHEMA: [&[Col]; ASSEMBLY_TABLE] = [
    /* 0x00 Module */ &[U16, Str, Guid, Guid, Guid],
    /* 0x01 TypeRef */ &[RESOLUTION_SCOPE, Str, Str],
    /* 0x02 TypeDef */ &[U32, Str, Str, TYPE_DEF_OR_REF, Table(0x04), Table(0x06)],
    /* 0x03 FieldPtr */ &[Table(0x04)],
    /* 0x04 Field */ &[U16, Str, Blob],
    /* 0x05 MethodPtr */ &[Table(0x06)],
    /* 0x06 MethodDef */ &[U32, U16, U16, Str, Blob, Table(0x08)],
    /* 0x07 ParamPtr */ &[Table(0x08)],
    /* 0x08 Param */ &[U16, U16, Str],
    /* 0x09 InterfaceImpl */ &[Table(0x02), TYPE_DEF_OR_REF],
    /* 0x0A MemberRef */ &[MEMBER_REF_PARENT, Str, Blob],
    /* 0x0B Constant */ &[U16, HAS_CONSTANT, Blob],
    /* 0x0C CustomAttribute */ &[HAS_CUSTOM_ATTRIBUTE, CUSTOM_ATTRIBUTE_TYPE, Blob],
    /* 0x0D FieldMarshal */ &[HAS_FIELD_MARSHAL, Blob],
    /* 0x0E DeclSecurity */ &[U16, HAS_DECL_SECURITY, Blob],
    /* 0x0F ClassLayout */ &[U16, U32, Table(0x02)],
    /* 0x10 FieldLayout */ &[U32, Table(0x04)],
    /* 0x11 StandAloneSig */ &[Blob],
    /* 0x12 EventMap */ &[Table(0x02), Table(0x14)],
    /* 0x13 EventPtr */ &[Table(0x14)],
    /* 0x14 Event */ &[U16, Str, TYPE_DEF_OR_REF],
    /* 0x15 PropertyMap */ &[Table(0x02), Table(0x17)],
    /* 0x16 PropertyPtr */ &[Table(0x17)],
    /* 0x17 Property */ &[U16, Str, Blob],
    /* 0x18 MethodSemantics */ &[U16, Table(0x06), HAS_SEMANTICS],
    /* 0x19 MethodImpl */ &[Table(0x02), METHOD_DEF_OR_REF, METHOD_DEF_OR_REF],
    /* 0x1A ModuleRef */ &[Str],
    /* 0x1B TypeSpec */ &[Blob],
    /* 0x1C ImplMap */ &[U16, MEMBER_FORWARDED, Str, Table(0x1a)],
    /* 0x1D FieldRVA */ &[U32, Table(0x04)],
    /* 0x1E EncLog */ &[U32, U32],
    /* 0x1F EncMap */ &[U32],
];

struct Sizes {
    rows: [u32; 64],
    wide_strings: bool,
    wide_guids: bool,
    wide_blobs: bool,
}

impl Sizes {
    fn column(&self, col: Col) -> usize {
        match col {
            U16 => 2,
            U32 => 4,
            Str => self.heap(self.wide_strings),
            Guid => self.heap(self.wide_guids),
            Blob => self.heap(self.wide_blobs),
            Table(t) => {
                if self.rows[t] > 0xffff {
                    4
                } else {
                    2
                }
            }
            Coded(tables, bits) => {
                let max = tables.iter().map(|t| self.rows[*t]).max().unwrap_or(0);
                if max >= 1 << (16 - bits) {
                    4
                } else {
                    2
                }
            }
        }
    }

    fn heap(&self, wide: bool) -> usize {
        if wide {
            4
        } else {
            2
        }
    }

    fn row(&self, table: usize) -> usize {
        SCHEMA[table].iter().map(|c| self.column(*c)).sum()
    }
}

/// Locate the metadata tables stream (`#~` or `#-`) and return it.
fn tables_stream<'a>(image: &PeImage<'a>) -> ParseResult<&'a [u8]> {
    let (clr_rva, clr_size) = image
        .directory(DIR_CLR)
        .ok_or_else(|| "no CLR header; not a managed assembly".to_string())?;
    let header = image.slice_at_rva(clr_rva, clr_size.max(16))?;
    let metadata_rva = u32_at(header, 8)?;
    let metadata_size = u32_at(header, 12)?;
    let metadata = image.slice_at_rva(metadata_rva, metadata_size)?;

    if u32_at(metadata, 0)? != METADATA_SIGNATURE {
        return Err("bad metadata signature".to_string());
    }
    let version_length = u32_at(metadata, 12)? as usize;
    let after_version = 16 + version_length;
    let stream_count = u16_at(metadata, after_version + 2)? as usize;

    let mut at = after_version + 4;
    for _ in 0..stream_count {
        let offset = u32_at(metadata, at)? as usize;
        let size = u32_at(metadata, at + 4)? as usize;
        let name_start = at + 8;
        let name_len = metadata
            .get(name_start..)
            .and_then(|rest| rest.iter().position(|b| *b == 0))
            .ok_or_else(|| "unterminated stream name".to_string())?;
        let name = &metadata[name_start..name_start + name_len];
        if name == b"#~" || name == b"#-" {
            return metadata
                .get(offset..offset + size)
                .ok_or_else(|| "tables stream overruns metadata".to_string());
        }
        at = align4(name_start + name_len + 1);
    }
    Err("no metadata tables stream".to_string())
}

/// `major.minor.build.revision` of the assembly manifest.
pub(crate) fn assembly_version(image: &PeImage) -> ParseResult<String> {
    let stream = tables_stream(image)?;
    let heap_sizes = u8_at(stream, 6)?;
    let valid = u64_at(stream, 8)?;

    let mut sizes = Sizes {
        rows: [0; 64],
        wide_strings: heap_sizes & 0x01 != 0,
        wide_guids: heap_sizes & 0x02 != 0,
        wide_blobs: heap_sizes & 0x04 != 0,
    };
    let mut at = 24;
    for table in 0..64 {
        if valid & (1u64 << table) != 0 {
            sizes.rows[table] = u32_at(stream, at)?;
            at += 4;
        }
    }
    if heap_sizes & 0x40 != 0 {
        at += 4;
    }

    if sizes.rows[ASSEMBLY_TABLE] == 0 {
        return Err("no assembly manifest row".to_string());
    }
    for table in 0..ASSEMBLY_TABLE {
        at += sizes.rows[table] as usize * sizes.row(table);
    }

    // Assembly row: HashAlgId (u32) then four u16 version parts.
    let major = u16_at(stream, at + 4)?;
    let minor = u16_at(stream, at + 6)?;
    let build = u16_at(stream, at + 8)?;
    let revision = u16_at(stream, at + 10)?;
    Ok(format!("{}.{}.{}.{}", major, minor, build, revision))
}
