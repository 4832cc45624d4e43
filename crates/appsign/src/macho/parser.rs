//! Mach-O and universal binary parsing
//!
//! Only the load commands the signer needs are decoded in detail:
//! segments (with their sections), `LC_CODE_SIGNATURE`, the dylib commands
//! and `LC_RPATH`. Every other command is kept as [`LoadCommandKind::Raw`],
//! so a parsed slice can always be written back byte for byte.

use crate::{Error, Result};
use goblin::mach::cputype::{
    get_arch_name_from_types, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86,
    CPU_TYPE_X86_64,
};
use goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::header::{
    MH_CIGAM, MH_CIGAM_64, MH_DYLIB, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64, SIZEOF_HEADER_32,
    SIZEOF_HEADER_64,
};
use goblin::mach::load_command::{
    LC_CODE_SIGNATURE, LC_ID_DYLIB, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB,
    LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB, LC_RPATH, LC_SEGMENT, LC_SEGMENT_64,
};
use goblin::mach::MultiArch;
use std::path::Path;

/// 64-bit fat header magic, which this crate does not write.
const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// Fat magics as read from a little-endian header.
const FAT_CIGAM: u32 = 0xbeba_feca;
const FAT_CIGAM_64: u32 = 0xbfba_feca;

/// Byte order of a Mach-O image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32> {
        let bytes: [u8; 4] = data
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated(offset))?;
        Ok(match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(self, data: &[u8], offset: usize) -> Result<u64> {
        let bytes: [u8; 8] = data
            .get(offset..offset + 8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated(offset))?;
        Ok(match self {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    pub fn write_u32(self, data: &mut [u8], offset: usize, value: u32) {
        let bytes = match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        data[offset..offset + 4].copy_from_slice(&bytes);
    }

    pub fn write_u64(self, data: &mut [u8], offset: usize, value: u64) {
        let bytes = match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        data[offset..offset + 8].copy_from_slice(&bytes);
    }

    /// Pointer-width field: u64 in 64-bit images, u32 otherwise.
    fn read_word(self, data: &[u8], offset: usize, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read_u64(data, offset)
        } else {
            self.read_u32(data, offset).map(u64::from)
        }
    }
}

fn truncated(offset: usize) -> Error {
    Error::MalformedContainer(format!("truncated read at offset 0x{offset:x}"))
}

/// NUL-terminated string from a fixed-size or bounded field.
fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// A section inside a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub offset: u32,
    pub size: u64,
}

/// `LC_SEGMENT` / `LC_SEGMENT_64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
}

impl Segment {
    /// End of the segment's file range; `None` when it overflows.
    pub fn checked_file_end(&self) -> Option<u64> {
        self.fileoff.checked_add(self.filesize)
    }

    /// End of the segment's file range.
    ///
    /// Parsed slices have already had this checked against the image size.
    pub fn file_end(&self) -> u64 {
        self.fileoff.saturating_add(self.filesize)
    }
}

/// Which dylib command a [`DylibCommand`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibKind {
    Id,
    Load,
    Weak,
    Reexport,
    Lazy,
    Upward,
}

impl DylibKind {
    fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_ID_DYLIB => Some(DylibKind::Id),
            LC_LOAD_DYLIB => Some(DylibKind::Load),
            LC_LOAD_WEAK_DYLIB => Some(DylibKind::Weak),
            LC_REEXPORT_DYLIB => Some(DylibKind::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(DylibKind::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(DylibKind::Upward),
            _ => None,
        }
    }

    /// True for every kind that makes dyld load another image.
    pub fn is_dependency(self) -> bool {
        self != DylibKind::Id
    }
}

/// A decoded dylib load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibCommand {
    pub kind: DylibKind,
    pub name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Decoded form of a load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCommandKind {
    Segment(Segment),
    CodeSignature { data_offset: u32, data_size: u32 },
    Dylib(DylibCommand),
    Rpath(String),
    /// Any command not needed for signing; kept as raw bytes only.
    Raw,
}

/// One load command with its position in the slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCommand {
    pub cmd: u32,
    /// Offset from the start of the slice.
    pub offset: usize,
    pub size: usize,
    pub kind: LoadCommandKind,
}

/// One architecture image.
#[derive(Debug, Clone)]
pub struct ArchitectureSlice {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    /// Offset in the containing file (0 for a thin binary).
    pub offset: u64,
    /// Alignment exponent from the fat table.
    pub align: u32,
    pub endian: Endian,
    pub is_64: bool,
    pub file_type: u32,
    pub(crate) data: Vec<u8>,
    pub(crate) commands: Vec<LoadCommand>,
    pub(crate) sizeof_cmds: u32,
}

impl ArchitectureSlice {
    /// Parse a single-architecture image.
    pub fn parse_image(data: Vec<u8>, offset: u64, align: u32) -> Result<Self> {
        let magic = data
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| Error::MalformedContainer("file shorter than a magic number".into()))?;

        let (endian, is_64) = match magic {
            MH_MAGIC_64 => (Endian::Little, true),
            MH_CIGAM_64 => (Endian::Big, true),
            MH_MAGIC => (Endian::Little, false),
            MH_CIGAM => (Endian::Big, false),
            other => {
                return Err(Error::MalformedContainer(format!(
                    "unrecognized Mach-O magic 0x{other:08x}"
                )))
            }
        };
        let header_size = if is_64 { SIZEOF_HEADER_64 } else { SIZEOF_HEADER_32 };
        if data.len() < header_size {
            return Err(Error::MalformedContainer("truncated Mach-O header".into()));
        }

        let cpu_type = endian.read_u32(&data, 4)?;
        let cpu_subtype = endian.read_u32(&data, 8)?;
        let file_type = endian.read_u32(&data, 12)?;
        let ncmds = endian.read_u32(&data, 16)?;
        let sizeof_cmds = endian.read_u32(&data, 20)?;

        let commands_end = header_size + sizeof_cmds as usize;
        if commands_end > data.len() {
            return Err(Error::MalformedContainer(format!(
                "load command region of {sizeof_cmds} bytes exceeds the file"
            )));
        }

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut cursor = header_size;
        for index in 0..ncmds {
            let cmd = endian.read_u32(&data, cursor)?;
            let size = endian.read_u32(&data, cursor + 4)? as usize;
            if size < 8 || cursor + size > commands_end {
                return Err(Error::MalformedContainer(format!(
                    "load command {index} (0x{cmd:x}) of {size} bytes overruns the command region"
                )));
            }
            let raw = &data[cursor..cursor + size];
            let kind = decode_command(cmd, raw, endian, is_64)?;
            commands.push(LoadCommand {
                cmd,
                offset: cursor,
                size,
                kind,
            });
            cursor += size;
        }
        if cursor != commands_end {
            return Err(Error::MalformedContainer(format!(
                "load commands total {} bytes but the header declares {sizeof_cmds}",
                cursor - header_size
            )));
        }

        let slice = Self {
            cpu_type,
            cpu_subtype,
            offset,
            align,
            endian,
            is_64,
            file_type,
            data,
            commands,
            sizeof_cmds,
        };
        slice.check_bounds()?;
        Ok(slice)
    }

    fn check_bounds(&self) -> Result<()> {
        let len = self.data.len() as u64;
        for segment in self.segments() {
            let end = segment.checked_file_end().ok_or_else(|| {
                Error::MalformedContainer(format!(
                    "segment {} file range 0x{:x}+0x{:x} overflows",
                    segment.name, segment.fileoff, segment.filesize
                ))
            })?;
            if end > len {
                return Err(Error::MalformedContainer(format!(
                    "segment {} ends at 0x{end:x}, past the end of the image (0x{len:x})",
                    segment.name
                )));
            }
        }

        let signatures = self
            .commands
            .iter()
            .filter_map(|lc| match lc.kind {
                LoadCommandKind::CodeSignature {
                    data_offset,
                    data_size,
                } => Some((data_offset, data_size)),
                _ => None,
            })
            .collect::<Vec<_>>();
        match signatures.as_slice() {
            [] => Ok(()),
            [(offset, size)] if u64::from(*offset) + u64::from(*size) <= len => Ok(()),
            [_] => Err(Error::MalformedContainer(
                "code signature region lies outside the image".into(),
            )),
            _ => Err(Error::MalformedContainer(
                "more than one LC_CODE_SIGNATURE".into(),
            )),
        }
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn commands(&self) -> &[LoadCommand] {
        &self.commands
    }

    /// Raw bytes of one load command.
    pub fn command_bytes(&self, command: &LoadCommand) -> &[u8] {
        &self.data[command.offset..command.offset + command.size]
    }

    pub fn header_size(&self) -> usize {
        if self.is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        }
    }

    /// Offset just past the last load command.
    pub fn load_commands_end(&self) -> usize {
        self.header_size() + self.sizeof_cmds as usize
    }

    /// First byte of file content after the header; load commands may grow
    /// up to here.
    pub fn header_space_limit(&self) -> usize {
        let sections = self
            .segments()
            .flat_map(|s| s.sections.iter())
            .filter(|s| s.offset > 0)
            .map(|s| s.offset as usize);
        let segments = self
            .segments()
            .filter(|s| s.fileoff > 0 && s.filesize > 0)
            .map(|s| s.fileoff as usize);
        sections
            .chain(segments)
            .min()
            .unwrap_or(self.data.len())
            .min(self.data.len())
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.commands.iter().filter_map(|lc| match &lc.kind {
            LoadCommandKind::Segment(segment) => Some(segment),
            _ => None,
        })
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments().find(|s| s.name == name)
    }

    /// `__TEXT`, whose range becomes the exec segment.
    pub fn text_segment(&self) -> Option<&Segment> {
        self.segment("__TEXT")
    }

    /// The segment holding the highest file data, normally `__LINKEDIT`.
    pub fn tail_segment(&self) -> Option<(&LoadCommand, &Segment)> {
        self.commands
            .iter()
            .filter_map(|lc| match &lc.kind {
                LoadCommandKind::Segment(s) if s.filesize > 0 => Some((lc, s)),
                _ => None,
            })
            .max_by_key(|(_, s)| s.fileoff)
    }

    /// The `LC_CODE_SIGNATURE` command, if any.
    pub fn code_signature(&self) -> Option<(&LoadCommand, u32, u32)> {
        self.commands.iter().find_map(|lc| match lc.kind {
            LoadCommandKind::CodeSignature {
                data_offset,
                data_size,
            } => Some((lc, data_offset, data_size)),
            _ => None,
        })
    }

    pub fn code_signature_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|lc| matches!(lc.kind, LoadCommandKind::CodeSignature { .. }))
            .count()
    }

    /// Embedded signature bytes, if the slice is signed.
    pub fn signature_data(&self) -> Option<&[u8]> {
        self.code_signature().map(|(_, offset, size)| {
            &self.data[offset as usize..offset as usize + size as usize]
        })
    }

    /// End of the content covered by code hashes.
    ///
    /// The existing signature's offset when signed, otherwise the end of the
    /// highest segment.
    pub fn signed_region_end(&self) -> usize {
        if let Some((_, offset, _)) = self.code_signature() {
            return offset as usize;
        }
        self.segments()
            .map(|s| s.file_end() as usize)
            .max()
            .filter(|&end| end > 0)
            .unwrap_or(self.data.len())
    }

    pub fn dylibs(&self) -> impl Iterator<Item = &DylibCommand> {
        self.commands.iter().filter_map(|lc| match &lc.kind {
            LoadCommandKind::Dylib(dylib) => Some(dylib),
            _ => None,
        })
    }

    /// Install names this image loads, excluding its own id.
    pub fn dependencies(&self) -> impl Iterator<Item = &DylibCommand> {
        self.dylibs().filter(|d| d.kind.is_dependency())
    }

    /// `LC_ID_DYLIB` name.
    pub fn install_name(&self) -> Option<&str> {
        self.dylibs()
            .find(|d| d.kind == DylibKind::Id)
            .map(|d| d.name.as_str())
    }

    pub fn rpaths(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|lc| match &lc.kind {
            LoadCommandKind::Rpath(path) => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn is_executable(&self) -> bool {
        self.file_type == MH_EXECUTE
    }

    pub fn is_dylib(&self) -> bool {
        self.file_type == MH_DYLIB
    }

    /// CPU types this crate signs.
    pub fn is_supported(&self) -> bool {
        matches!(
            self.cpu_type,
            CPU_TYPE_ARM64 | CPU_TYPE_ARM64_32 | CPU_TYPE_X86_64 | CPU_TYPE_ARM | CPU_TYPE_X86
        )
    }

    /// Architecture name such as `arm64`, or the raw cpu type.
    pub fn arch_name(&self) -> String {
        get_arch_name_from_types(self.cpu_type, self.cpu_subtype)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("cputype 0x{:x}", self.cpu_type))
    }
}

fn decode_command(cmd: u32, raw: &[u8], endian: Endian, is_64: bool) -> Result<LoadCommandKind> {
    if let Some(kind) = DylibKind::from_cmd(cmd) {
        let name_offset = endian.read_u32(raw, 8)? as usize;
        let name = raw
            .get(name_offset..)
            .filter(|_| name_offset >= 24)
            .map(c_string)
            .ok_or_else(|| Error::MalformedContainer("dylib name outside its command".into()))?;
        return Ok(LoadCommandKind::Dylib(DylibCommand {
            kind,
            name,
            timestamp: endian.read_u32(raw, 12)?,
            current_version: endian.read_u32(raw, 16)?,
            compatibility_version: endian.read_u32(raw, 20)?,
        }));
    }

    Ok(match cmd {
        LC_SEGMENT_64 | LC_SEGMENT => LoadCommandKind::Segment(decode_segment(raw, endian, is_64)?),
        LC_CODE_SIGNATURE => LoadCommandKind::CodeSignature {
            data_offset: endian.read_u32(raw, 8)?,
            data_size: endian.read_u32(raw, 12)?,
        },
        LC_RPATH => {
            let path_offset = endian.read_u32(raw, 8)? as usize;
            let path = raw
                .get(path_offset..)
                .filter(|_| path_offset >= 12)
                .map(c_string)
                .ok_or_else(|| Error::MalformedContainer("rpath outside its command".into()))?;
            LoadCommandKind::Rpath(path)
        }
        _ => LoadCommandKind::Raw,
    })
}

fn decode_segment(raw: &[u8], endian: Endian, is_64: bool) -> Result<Segment> {
    let name = c_string(raw.get(8..24).ok_or_else(|| truncated(8))?);
    // Field offsets after segname differ only by word width.
    let w = if is_64 { 8 } else { 4 };
    let vmaddr = endian.read_word(raw, 24, is_64)?;
    let vmsize = endian.read_word(raw, 24 + w, is_64)?;
    let fileoff = endian.read_word(raw, 24 + 2 * w, is_64)?;
    let filesize = endian.read_word(raw, 24 + 3 * w, is_64)?;
    let nsects = endian.read_u32(raw, 24 + 4 * w + 8)? as usize;

    let (header, section_size, offset_field) = if is_64 { (72, 80, 48) } else { (56, 68, 40) };
    if header + nsects * section_size > raw.len() {
        return Err(Error::MalformedContainer(format!(
            "segment {name} declares {nsects} sections that do not fit its command"
        )));
    }

    let mut sections = Vec::with_capacity(nsects);
    for i in 0..nsects {
        let base = header + i * section_size;
        sections.push(Section {
            name: c_string(&raw[base..base + 16]),
            size: endian.read_word(raw, base + 32 + w, is_64)?,
            offset: endian.read_u32(raw, base + offset_field)?,
        });
    }

    Ok(Segment {
        name,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        sections,
    })
}

/// Thin or universal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Single,
    Fat,
}

/// A parsed binary: one slice, or a fat container of several.
#[derive(Debug, Clone)]
pub struct BinaryContainer {
    kind: ContainerKind,
    slices: Vec<ArchitectureSlice>,
}

impl BinaryContainer {
    /// Read and parse a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&std::fs::read(path)?)
    }

    /// Parse raw file bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = data
            .get(0..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| Error::MalformedContainer("file shorter than a magic number".into()))?;

        match magic {
            FAT_MAGIC => Self::parse_fat(data),
            FAT_MAGIC_64 => Err(Error::MalformedContainer(
                "64-bit fat containers are not supported".into(),
            )),
            FAT_CIGAM | FAT_CIGAM_64 => Err(Error::MalformedContainer(
                "byte-swapped fat header; fat headers are always big-endian".into(),
            )),
            _ => Ok(Self {
                kind: ContainerKind::Single,
                slices: vec![ArchitectureSlice::parse_image(data.to_vec(), 0, 0)?],
            }),
        }
    }

    fn parse_fat(data: &[u8]) -> Result<Self> {
        let fat = MultiArch::new(data)
            .map_err(|e| Error::MalformedContainer(format!("invalid fat header: {e}")))?;

        let header_end = SIZEOF_FAT_HEADER + fat.narches * SIZEOF_FAT_ARCH;
        if fat.narches == 0 || header_end > data.len() {
            return Err(Error::MalformedContainer(format!(
                "fat header declares {} architectures",
                fat.narches
            )));
        }

        let mut arches = fat
            .iter_arches()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::MalformedContainer(format!("invalid fat arch table: {e}")))?;

        for arch in &arches {
            let start = arch.offset as usize;
            let end = start + arch.size as usize;
            if start < header_end || end > data.len() {
                return Err(Error::MalformedContainer(format!(
                    "slice at 0x{start:x}..0x{end:x} lies outside the container"
                )));
            }
            if arch.align > 31 || arch.offset % (1u32 << arch.align) != 0 {
                return Err(Error::MalformedContainer(format!(
                    "slice at 0x{start:x} is not aligned to 2^{}",
                    arch.align
                )));
            }
        }

        let mut by_offset = arches.iter().collect::<Vec<_>>();
        by_offset.sort_by_key(|a| a.offset);
        for pair in by_offset.windows(2) {
            if u64::from(pair[0].offset) + u64::from(pair[0].size) > u64::from(pair[1].offset) {
                return Err(Error::MalformedContainer(format!(
                    "slices at 0x{:x} and 0x{:x} overlap",
                    pair[0].offset, pair[1].offset
                )));
            }
        }

        let slices = arches
            .drain(..)
            .map(|arch| {
                let start = arch.offset as usize;
                let image = data[start..start + arch.size as usize].to_vec();
                ArchitectureSlice::parse_image(image, u64::from(arch.offset), arch.align)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind: ContainerKind::Fat,
            slices,
        })
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn is_fat(&self) -> bool {
        self.kind == ContainerKind::Fat
    }

    pub fn slices(&self) -> &[ArchitectureSlice] {
        &self.slices
    }

    /// Swap in a rewritten slice, keeping its recorded placement.
    pub fn replace_slice(&mut self, index: usize, mut slice: ArchitectureSlice) {
        slice.offset = self.slices[index].offset;
        slice.align = self.slices[index].align;
        self.slices[index] = slice;
    }

    /// Serialize the container.
    ///
    /// Untouched slices keep their offsets, so an unmodified container comes
    /// back byte-identical.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.kind {
            ContainerKind::Single => Ok(self.slices[0].data.clone()),
            ContainerKind::Fat => super::writer::write_fat(&self.slices),
        }
    }
}
