//! Mach-O rewriting: signature placement, dylib commands, fat layout.
//!
//! Signing is two-phase so the page hashes can cover the final header:
//!
//! 1. [`prepare_signature_region`] truncates any old signature, reserves a
//!    16-byte aligned region at the end of the slice and writes the final
//!    `LC_CODE_SIGNATURE` and tail-segment sizes.
//! 2. [`PreparedSlice::finish`] splices the SuperBlob in, zero-padded to the
//!    reserved size.
//!
//! Every operation works on a copy of the slice. On error the input is
//! untouched and no partially edited bytes escape.

use super::parser::{ArchitectureSlice, Endian};
use crate::{Error, Result};
use goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::load_command::{LC_CODE_SIGNATURE, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB};
use log::debug;

/// Size of `linkedit_data_command`.
const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

/// Fixed part of `dylib_command`; the name follows.
const DYLIB_COMMAND_SIZE: usize = 24;

/// Signature data starts on this boundary.
const SIGNATURE_ALIGNMENT: usize = 16;

/// Segment vmsize granularity (arm64 page size).
const SEGMENT_VM_ALIGNMENT: usize = 0x4000;

/// Aligns a value up to the specified power-of-two alignment.
pub fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Place fat slices after the header.
///
/// Each entry is `(original offset, size, alignment exponent)`. A slice
/// keeps its original offset unless the previous slice grew into it, in
/// which case it moves to the next aligned offset past that slice.
pub fn layout_fat_slices(header_len: u64, slices: &[(u64, u64, u32)]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(slices.len());
    let mut end = header_len;
    for &(original, size, align) in slices {
        let alignment = 1u64 << align;
        let earliest = end.div_ceil(alignment) * alignment;
        let offset = original.max(earliest);
        offsets.push(offset);
        end = offset + size;
    }
    offsets
}

/// Serialize slices into a fat container.
pub(crate) fn write_fat(slices: &[ArchitectureSlice]) -> Result<Vec<u8>> {
    let header_len = SIZEOF_FAT_HEADER + slices.len() * SIZEOF_FAT_ARCH;
    let placement = slices
        .iter()
        .map(|s| (s.offset, s.len() as u64, s.align))
        .collect::<Vec<_>>();
    let offsets = layout_fat_slices(header_len as u64, &placement);

    let mut header = Vec::with_capacity(header_len);
    header.extend(FAT_MAGIC.to_be_bytes());
    header.extend((slices.len() as u32).to_be_bytes());
    for (slice, &offset) in slices.iter().zip(&offsets) {
        let end = offset + slice.len() as u64;
        let offset32 = u32::try_from(offset)
            .ok()
            .filter(|_| end <= u64::from(u32::MAX))
            .ok_or_else(|| {
                Error::SignatureRegionOverflow(format!(
                    "{} slice ends at 0x{end:x}, beyond 32-bit fat offsets",
                    slice.arch_name()
                ))
            })?;
        for value in [
            slice.cpu_type,
            slice.cpu_subtype,
            offset32,
            slice.len() as u32,
            slice.align,
        ] {
            header.extend(value.to_be_bytes());
        }
    }

    let mut output = header;
    for (slice, &offset) in slices.iter().zip(&offsets) {
        output.resize(offset as usize, 0);
        output.extend_from_slice(slice.data());
    }
    Ok(output)
}

/// A slice with its signature region reserved but not yet filled.
#[derive(Debug, Clone)]
pub struct PreparedSlice {
    data: Vec<u8>,
    signature_offset: usize,
    reserved: usize,
    offset: u64,
    align: u32,
}

impl PreparedSlice {
    /// Bytes covered by the code hashes: everything before the signature.
    pub fn signed_region(&self) -> &[u8] {
        &self.data[..self.signature_offset]
    }

    pub fn signature_offset(&self) -> usize {
        self.signature_offset
    }

    /// Bytes available for the SuperBlob.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Write `superblob` into the reserved region and re-parse the result.
    pub fn finish(self, superblob: &[u8]) -> Result<ArchitectureSlice> {
        if superblob.len() > self.reserved {
            return Err(Error::SignatureRegionOverflow(format!(
                "signature of {} bytes exceeds the {} bytes reserved",
                superblob.len(),
                self.reserved
            )));
        }
        let mut data = self.data;
        data.extend_from_slice(superblob);
        data.resize(self.signature_offset + self.reserved, 0);
        ArchitectureSlice::parse_image(data, self.offset, self.align)
    }
}

/// Reserve `reserved` bytes for a signature at the end of `slice`.
///
/// Reuses an existing `LC_CODE_SIGNATURE` or appends one, and grows the
/// tail segment over the new region.
pub fn prepare_signature_region(
    slice: &ArchitectureSlice,
    reserved: usize,
) -> Result<PreparedSlice> {
    let endian = slice.endian;
    let code_end = slice.signed_region_end();
    let content_end = slice
        .code_signature()
        .map_or(code_end, |(_, offset, size)| offset as usize + size as usize);
    if slice.len() > content_end {
        return Err(Error::MalformedContainer(format!(
            "{}: 0x{:x} bytes past the end of the last segment",
            slice.arch_name(),
            slice.len() - content_end
        )));
    }
    let signature_offset = align_to(code_end, SIGNATURE_ALIGNMENT);
    let reserved = align_to(reserved, SIGNATURE_ALIGNMENT);
    let region_end = signature_offset + reserved;

    let region_end32 = u32::try_from(region_end).map_err(|_| {
        Error::SignatureRegionOverflow(format!(
            "signature region would end at 0x{region_end:x}, beyond 32-bit offsets"
        ))
    })?;
    let (signature_offset32, reserved32) = (region_end32 - reserved as u32, reserved as u32);

    let mut data = slice.data()[..code_end].to_vec();
    data.resize(signature_offset, 0);

    match slice.code_signature() {
        Some((command, _, _)) => {
            endian.write_u32(&mut data, command.offset + 8, signature_offset32);
            endian.write_u32(&mut data, command.offset + 12, reserved32);
        }
        None => {
            let at = reserve_command_space(slice, LINKEDIT_DATA_COMMAND_SIZE)?;
            endian.write_u32(&mut data, at, LC_CODE_SIGNATURE);
            endian.write_u32(&mut data, at + 4, LINKEDIT_DATA_COMMAND_SIZE as u32);
            endian.write_u32(&mut data, at + 8, signature_offset32);
            endian.write_u32(&mut data, at + 12, reserved32);
            bump_command_counts(&mut data, endian, 1, LINKEDIT_DATA_COMMAND_SIZE as i64)?;
        }
    }

    grow_tail_segment(slice, &mut data, code_end, region_end)?;

    debug!(
        "{}: signature region 0x{signature_offset:x}+0x{reserved:x}",
        slice.arch_name()
    );

    Ok(PreparedSlice {
        data,
        signature_offset,
        reserved,
        offset: slice.offset,
        align: slice.align,
    })
}

/// Extend the tail segment so it ends exactly at `region_end`.
fn grow_tail_segment(
    slice: &ArchitectureSlice,
    data: &mut [u8],
    code_end: usize,
    region_end: usize,
) -> Result<()> {
    let (command, segment) = slice.tail_segment().ok_or_else(|| {
        Error::SignatureRegionOverflow("no segment can hold the signature".into())
    })?;
    if (code_end as u64) < segment.fileoff || (code_end as u64) > segment.file_end() {
        return Err(Error::SignatureRegionOverflow(format!(
            "signed content ends at 0x{code_end:x}, outside tail segment {}",
            segment.name
        )));
    }

    let filesize = region_end as u64 - segment.fileoff;
    let vmsize = segment
        .vmsize
        .max(align_to(filesize as usize, SEGMENT_VM_ALIGNMENT) as u64);
    let endian = slice.endian;

    if slice.is_64 {
        endian.write_u64(data, command.offset + 32, vmsize);
        endian.write_u64(data, command.offset + 48, filesize);
    } else {
        let overflow = || {
            Error::SignatureRegionOverflow(format!(
                "segment {} would exceed 32-bit sizes",
                segment.name
            ))
        };
        let vmsize = u32::try_from(vmsize).map_err(|_| overflow())?;
        let filesize = u32::try_from(filesize).map_err(|_| overflow())?;
        endian.write_u32(data, command.offset + 28, vmsize);
        endian.write_u32(data, command.offset + 36, filesize);
    }
    Ok(())
}

/// Offset for a new load command of `size` bytes, or `HeaderSpaceExhausted`.
fn reserve_command_space(slice: &ArchitectureSlice, size: usize) -> Result<usize> {
    let end = slice.load_commands_end();
    let limit = slice.header_space_limit();
    if end + size > limit {
        return Err(Error::HeaderSpaceExhausted {
            needed: size,
            available: limit.saturating_sub(end),
        });
    }
    Ok(end)
}

/// Adjust `ncmds` and `sizeofcmds` in the Mach-O header.
fn bump_command_counts(data: &mut [u8], endian: Endian, ncmds: i32, bytes: i64) -> Result<()> {
    let count = endian.read_u32(data, 16)? as i64 + i64::from(ncmds);
    let size = endian.read_u32(data, 20)? as i64 + bytes;
    endian.write_u32(data, 16, count as u32);
    endian.write_u32(data, 20, size as u32);
    Ok(())
}

/// Add a dylib load command for `install_name`.
///
/// Weak linking uses `LC_LOAD_WEAK_DYLIB`. A name the slice already loads
/// is left alone, so injecting twice has no further effect.
pub fn inject_dylib(
    slice: &ArchitectureSlice,
    install_name: &str,
    weak: bool,
) -> Result<ArchitectureSlice> {
    if slice.dependencies().any(|d| d.name == install_name) {
        debug!("{} already loads {install_name}", slice.arch_name());
        return Ok(slice.clone());
    }

    let pointer_align = if slice.is_64 { 8 } else { 4 };
    let size = align_to(DYLIB_COMMAND_SIZE + install_name.len() + 1, pointer_align);
    let at = reserve_command_space(slice, size)?;
    let endian = slice.endian;
    let cmd = if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB };

    let mut data = slice.data().to_vec();
    endian.write_u32(&mut data, at, cmd);
    endian.write_u32(&mut data, at + 4, size as u32);
    endian.write_u32(&mut data, at + 8, DYLIB_COMMAND_SIZE as u32);
    endian.write_u32(&mut data, at + 12, 2); // timestamp
    endian.write_u32(&mut data, at + 16, 0x1_0000); // current version 1.0.0
    endian.write_u32(&mut data, at + 20, 0x1_0000); // compatibility version 1.0.0
    let name_start = at + DYLIB_COMMAND_SIZE;
    data[name_start..at + size].fill(0);
    data[name_start..name_start + install_name.len()].copy_from_slice(install_name.as_bytes());
    bump_command_counts(&mut data, endian, 1, size as i64)?;

    debug!(
        "{}: added {} {install_name}",
        slice.arch_name(),
        if weak { "LC_LOAD_WEAK_DYLIB" } else { "LC_LOAD_DYLIB" }
    );
    ArchitectureSlice::parse_image(data, slice.offset, slice.align)
}

/// Remove every load command that loads `install_name`.
///
/// Later commands move down and the freed bytes are zeroed.
pub fn remove_dylib(slice: &ArchitectureSlice, install_name: &str) -> Result<ArchitectureSlice> {
    let mut data = slice.data().to_vec();
    let endian = slice.endian;
    let mut end = slice.load_commands_end();
    let mut removed = 0;

    // Walk backwards so earlier offsets stay valid while compacting.
    for command in slice.commands().iter().rev() {
        let matches = match &command.kind {
            super::parser::LoadCommandKind::Dylib(d) => {
                d.kind.is_dependency() && d.name == install_name
            }
            _ => false,
        };
        if !matches {
            continue;
        }
        let next = command.offset + command.size;
        data.copy_within(next..end, command.offset);
        end -= command.size;
        data[end..end + command.size].fill(0);
        bump_command_counts(&mut data, endian, -1, -(command.size as i64))?;
        removed += 1;
    }

    if removed == 0 {
        debug!("{} does not load {install_name}", slice.arch_name());
        return Ok(slice.clone());
    }
    ArchitectureSlice::parse_image(data, slice.offset, slice.align)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::parser::{BinaryContainer, DylibKind};
    use crate::testutil::{self, MachOSpec};

    fn slice(data: &[u8]) -> ArchitectureSlice {
        BinaryContainer::parse(data).unwrap().slices()[0].clone()
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(1, 16), 16);
        assert_eq!(align_to(15, 16), 16);
        assert_eq!(align_to(16, 16), 16);
        assert_eq!(align_to(17, 16), 32);
        assert_eq!(align_to(100, 0x4000), 0x4000);
    }

    #[test]
    fn test_layout_keeps_offsets_when_nothing_grew() {
        let offsets = layout_fat_slices(48, &[(0x4000, 0x3000, 14), (0x8000, 0x3000, 14)]);
        assert_eq!(offsets, vec![0x4000, 0x8000]);
    }

    #[test]
    fn test_layout_shifts_after_growth() {
        let offsets = layout_fat_slices(48, &[(0x4000, 0x4100, 14), (0x8000, 0x10, 12)]);
        assert_eq!(offsets, vec![0x4000, 0x9000]);
        let offsets = layout_fat_slices(48, &[(0, 0x10, 14)]);
        assert_eq!(offsets, vec![0x4000]);
    }

    #[test]
    fn test_prepare_and_finish_unsigned() {
        let original = slice(&MachOSpec::executable().build());
        let code_end = original.signed_region_end();
        let prepared = prepare_signature_region(&original, 1000).unwrap();
        assert_eq!(prepared.signature_offset(), align_to(code_end, 16));
        assert_eq!(prepared.reserved(), 1008);

        let signed = prepared.finish(&[0xfa; 100]).unwrap();
        assert_eq!(signed.code_signature_count(), 1);
        let (_, offset, size) = signed.code_signature().unwrap();
        assert_eq!(offset as usize, align_to(code_end, 16));
        assert_eq!(size, 1008);
        assert_eq!(signed.len(), offset as usize + 1008);
        let linkedit = signed.segment("__LINKEDIT").unwrap();
        assert_eq!(linkedit.file_end() as usize, signed.len());
        assert_eq!(&signed.data()[0x800..code_end], &original.data()[0x800..code_end]);
    }

    #[test]
    fn test_prepare_rejects_trailing_bytes() {
        let mut data = MachOSpec::executable().build();
        data.extend([0x5a; 24]);
        let err = prepare_signature_region(&slice(&data), 1000).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer(msg) if msg.contains("0x18 bytes")));
    }

    #[test]
    fn test_prepare_reuses_existing_command() {
        let first = prepare_signature_region(&slice(&MachOSpec::executable().build()), 64)
            .unwrap()
            .finish(&[1; 64])
            .unwrap();
        let second = prepare_signature_region(&first, 4096)
            .unwrap()
            .finish(&[2; 10])
            .unwrap();
        assert_eq!(second.code_signature_count(), 1);
        assert_eq!(second.commands().len(), first.commands().len());
        assert_eq!(
            second.code_signature().unwrap().1,
            first.code_signature().unwrap().1
        );
        assert_eq!(second.code_signature().unwrap().2, 4096);
    }

    #[test]
    fn test_finish_rejects_oversized_signature() {
        let prepared =
            prepare_signature_region(&slice(&MachOSpec::executable().build()), 32).unwrap();
        assert!(matches!(
            prepared.finish(&[0; 33]),
            Err(Error::SignatureRegionOverflow(_))
        ));
    }

    #[test]
    fn test_prepare_32_bit_big_endian() {
        let data = MachOSpec::executable().arm32().big_endian().build();
        let signed = prepare_signature_region(&slice(&data), 256)
            .unwrap()
            .finish(&[7; 256])
            .unwrap();
        assert_eq!(signed.code_signature_count(), 1);
        assert_eq!(
            signed.segment("__LINKEDIT").unwrap().file_end() as usize,
            signed.len()
        );
    }

    #[test]
    fn test_inject_weak_dylib_is_idempotent() {
        let original = slice(&MachOSpec::executable().build());
        let injected = inject_dylib(&original, "@executable_path/libhook.dylib", true).unwrap();
        let weak = injected
            .dylibs()
            .filter(|d| d.kind == DylibKind::Weak)
            .collect::<Vec<_>>();
        assert_eq!(weak.len(), 1);
        assert_eq!(weak[0].name, "@executable_path/libhook.dylib");
        assert_eq!(injected.commands().len(), original.commands().len() + 1);

        let again = inject_dylib(&injected, "@executable_path/libhook.dylib", true).unwrap();
        assert_eq!(again.data(), injected.data());
    }

    #[test]
    fn test_remove_restores_original() {
        let original = slice(&MachOSpec::executable().build());
        let injected = inject_dylib(&original, "@rpath/Hook.dylib", false).unwrap();
        let removed = remove_dylib(&injected, "@rpath/Hook.dylib").unwrap();
        assert_eq!(removed.data(), original.data());
    }

    #[test]
    fn test_header_space_exhausted() {
        let original = slice(&MachOSpec::executable().build());
        let long_name = format!("@executable_path/{}", "x".repeat(0x800));
        assert!(matches!(
            inject_dylib(&original, &long_name, false),
            Err(Error::HeaderSpaceExhausted { .. })
        ));
    }

    #[test]
    fn test_write_fat_round_trip_after_growth() {
        let arm = MachOSpec::executable().build();
        let data = testutil::fat(&[
            (testutil::CPU_TYPE_ARM64, 0, arm.clone()),
            (testutil::CPU_TYPE_X86_64, 3, arm),
        ]);
        let mut container = BinaryContainer::parse(&data).unwrap();
        let grown = prepare_signature_region(&container.slices()[0], 0x8000)
            .unwrap()
            .finish(&[])
            .unwrap();
        container.replace_slice(0, grown);

        let out = container.to_bytes().unwrap();
        let reparsed = BinaryContainer::parse(&out).unwrap();
        assert_eq!(reparsed.slices()[0].code_signature_count(), 1);
        assert_eq!(reparsed.slices()[1].data(), container.slices()[1].data());
        assert!(reparsed.slices()[1].offset > container.slices()[1].offset);
        assert_eq!(reparsed.slices()[1].offset % 0x4000, 0);
    }
}
