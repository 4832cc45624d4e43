//! SuperBlob assembly and decoding
//!
//! The SuperBlob is the top-level container of an embedded signature.
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ magic 0xfade0cc0 | length | count  │  12 bytes
//! ├────────────────────────────────────┤
//! │ (slot id, offset) × count          │  8 bytes each
//! ├────────────────────────────────────┤
//! │ blob bodies, in index order        │
//! └────────────────────────────────────┘
//! ```
//!
//! Offsets are relative to the start of the SuperBlob. Consumers find blobs
//! by slot id, so the slot assignment here is fixed: primary CodeDirectory
//! in slot 0, requirements in 2, entitlements in 5 and 7, alternate
//! CodeDirectories from 0x1000, and the CMS wrapper in 0x10000.

use super::constants::*;
use crate::{Error, Result};

const SUPERBLOB_HEADER_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;

/// Prefix `payload` with a `magic + length` blob header.
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = (BLOB_HEADER_SIZE + payload.len()) as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&magic.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(payload);
    buf
}

/// Magic and payload of a generic blob, checking the declared length.
pub fn unwrap_blob(blob: &[u8]) -> Result<(u32, &[u8])> {
    if blob.len() < BLOB_HEADER_SIZE {
        return Err(Error::VerificationFailed("blob shorter than its header".into()));
    }
    let magic = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let length = u32::from_be_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    if length < BLOB_HEADER_SIZE || length > blob.len() {
        return Err(Error::VerificationFailed(format!(
            "blob 0x{magic:08x} declares {length} bytes, {} available",
            blob.len()
        )));
    }
    Ok((magic, &blob[BLOB_HEADER_SIZE..length]))
}

/// One entry of a SuperBlob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Slot id (see the `CSSLOT_*` constants)
    pub slot_type: u32,
    /// Blob bytes, including their own magic and length
    pub data: Vec<u8>,
}

impl BlobEntry {
    /// Create a new blob entry.
    pub fn new(slot_type: u32, data: Vec<u8>) -> Self {
        Self { slot_type, data }
    }
}

/// Pack `entries` contiguously behind the header and index.
///
/// Fails when two entries share a slot id.
pub fn build_superblob(entries: Vec<BlobEntry>) -> Result<Vec<u8>> {
    for (i, entry) in entries.iter().enumerate() {
        if entries[..i].iter().any(|e| e.slot_type == entry.slot_type) {
            return Err(Error::Signing(format!(
                "duplicate SuperBlob slot 0x{:x}",
                entry.slot_type
            )));
        }
    }

    let header_size = SUPERBLOB_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
    let total_length = header_size + entries.iter().map(|e| e.data.len()).sum::<usize>();
    let total_u32 = u32::try_from(total_length).map_err(|_| {
        Error::SignatureRegionOverflow(format!("SuperBlob of {total_length} bytes"))
    })?;

    let mut buf = Vec::with_capacity(total_length);
    buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(&total_u32.to_be_bytes());
    buf.extend(&(entries.len() as u32).to_be_bytes());

    let mut offset = header_size;
    for entry in &entries {
        buf.extend(&entry.slot_type.to_be_bytes());
        buf.extend(&(offset as u32).to_be_bytes());
        offset += entry.data.len();
    }
    for entry in entries {
        buf.extend(entry.data);
    }

    Ok(buf)
}

/// Builder placing signature components in their fixed slots.
///
/// # Example
///
/// ```ignore
/// let superblob = SuperBlobBuilder::new()
///     .code_directories(vec![cd_sha1, cd_sha256])
///     .requirements(requirements)
///     .entitlements(entitlements_blob)
///     .cms_signature(cms_blob)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directories: Vec<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    cms_signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    /// Create a new SuperBlobBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// CodeDirectory blobs; the first is primary (slot 0), the rest are alternates.
    pub fn code_directories(mut self, cds: Vec<Vec<u8>>) -> Self {
        self.code_directories = cds;
        self
    }

    /// Requirements blob. Defaults to an empty requirement set.
    pub fn requirements(mut self, req: Vec<u8>) -> Self {
        self.requirements = Some(req);
        self
    }

    /// XML entitlements blob.
    pub fn entitlements(mut self, ent: Vec<u8>) -> Self {
        self.entitlements = Some(ent);
        self
    }

    /// DER entitlements blob.
    pub fn der_entitlements(mut self, der_ent: Vec<u8>) -> Self {
        self.der_entitlements = Some(der_ent);
        self
    }

    /// CMS signature wrapper blob.
    pub fn cms_signature(mut self, sig: Vec<u8>) -> Self {
        self.cms_signature = Some(sig);
        self
    }

    /// Assemble the SuperBlob in slot order.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut cds = self.code_directories.into_iter();
        let primary = cds
            .next()
            .ok_or_else(|| Error::Signing("SuperBlob needs a CodeDirectory".into()))?;
        let alternates: Vec<Vec<u8>> = cds.collect();
        if alternates.len() > CSSLOT_ALTERNATE_CODEDIRECTORY_MAX as usize {
            return Err(Error::Signing(format!(
                "{} alternate CodeDirectories exceed the slot range",
                alternates.len()
            )));
        }

        let mut entries = vec![BlobEntry::new(CSSLOT_CODEDIRECTORY, primary)];
        entries.push(BlobEntry::new(
            CSSLOT_REQUIREMENTS,
            self.requirements
                .unwrap_or_else(super::requirements::empty_requirements),
        ));
        if let Some(ent) = self.entitlements {
            entries.push(BlobEntry::new(CSSLOT_ENTITLEMENTS, ent));
        }
        if let Some(der) = self.der_entitlements {
            entries.push(BlobEntry::new(CSSLOT_DER_ENTITLEMENTS, der));
        }
        for (i, cd) in alternates.into_iter().enumerate() {
            entries.push(BlobEntry::new(
                CSSLOT_ALTERNATE_CODEDIRECTORIES + i as u32,
                cd,
            ));
        }
        if let Some(sig) = self.cms_signature {
            entries.push(BlobEntry::new(CSSLOT_SIGNATURESLOT, sig));
        }

        build_superblob(entries)
    }
}

/// A decoded SuperBlob.
#[derive(Debug, Clone)]
pub struct SuperBlob {
    entries: Vec<BlobEntry>,
}

impl SuperBlob {
    /// Decode an embedded signature. Trailing padding after the declared
    /// length is ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let read = |offset: usize| -> Result<u32> {
            data.get(offset..offset + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| Error::VerificationFailed("truncated SuperBlob".into()))
        };

        if read(0)? != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::VerificationFailed("bad SuperBlob magic".into()));
        }
        let length = read(4)? as usize;
        let count = read(8)? as usize;
        if length > data.len() || SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE > length {
            return Err(Error::VerificationFailed("SuperBlob length out of range".into()));
        }
        let data = &data[..length];

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let index = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot_type = read(index)?;
            let offset = read(index + 4)? as usize;
            let blob = data.get(offset..).ok_or_else(|| {
                Error::VerificationFailed(format!("slot 0x{slot_type:x} offset out of range"))
            })?;
            let (_, payload) = unwrap_blob(blob)?;
            let blob_len = BLOB_HEADER_SIZE + payload.len();
            entries.push(BlobEntry::new(slot_type, blob[..blob_len].to_vec()));
        }

        Ok(Self { entries })
    }

    /// All entries in index order.
    pub fn entries(&self) -> &[BlobEntry] {
        &self.entries
    }

    /// Blob stored in `slot_type`, header included.
    pub fn blob(&self, slot_type: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.slot_type == slot_type)
            .map(|e| e.data.as_slice())
    }

    /// Primary and alternate CodeDirectory blobs, primary first.
    pub fn code_directories(&self) -> Vec<&[u8]> {
        let alternates = CSSLOT_ALTERNATE_CODEDIRECTORIES
            ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX;
        self.entries
            .iter()
            .filter(|e| e.slot_type == CSSLOT_CODEDIRECTORY || alternates.contains(&e.slot_type))
            .map(|e| e.data.as_slice())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(magic: u32, len: usize) -> Vec<u8> {
        wrap_blob(magic, &vec![0xab; len])
    }

    #[test]
    fn test_superblob_structure() {
        let entries = vec![
            BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![0xab; 100]),
            BlobEntry::new(CSSLOT_REQUIREMENTS, vec![0xcd; 12]),
        ];
        let blob = build_superblob(entries).unwrap();

        assert_eq!(&blob[0..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        assert_eq!(&blob[8..12], &2u32.to_be_bytes());
        let actual_len = u32::from_be_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(actual_len as usize, 12 + 16 + 100 + 12);
        assert_eq!(&blob[16..20], &28u32.to_be_bytes());
        assert_eq!(&blob[24..28], &128u32.to_be_bytes());
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let entries = vec![
            BlobEntry::new(CSSLOT_REQUIREMENTS, vec![0; 12]),
            BlobEntry::new(CSSLOT_REQUIREMENTS, vec![0; 12]),
        ];
        assert!(build_superblob(entries).is_err());
    }

    #[test]
    fn test_builder_slot_order() {
        let sb = SuperBlobBuilder::new()
            .code_directories(vec![
                blob(CSMAGIC_CODEDIRECTORY, 10),
                blob(CSMAGIC_CODEDIRECTORY, 20),
            ])
            .entitlements(blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, 4))
            .der_entitlements(blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, 2))
            .cms_signature(blob(CSMAGIC_BLOBWRAPPER, 40))
            .build()
            .unwrap();

        let parsed = SuperBlob::parse(&sb).unwrap();
        let slots: Vec<u32> = parsed.entries().iter().map(|e| e.slot_type).collect();
        assert_eq!(
            slots,
            vec![
                CSSLOT_CODEDIRECTORY,
                CSSLOT_REQUIREMENTS,
                CSSLOT_ENTITLEMENTS,
                CSSLOT_DER_ENTITLEMENTS,
                CSSLOT_ALTERNATE_CODEDIRECTORIES,
                CSSLOT_SIGNATURESLOT,
            ]
        );
        assert_eq!(parsed.code_directories().len(), 2);
        assert_eq!(parsed.blob(CSSLOT_SIGNATURESLOT).unwrap().len(), 48);
    }

    #[test]
    fn test_builder_requires_code_directory() {
        assert!(SuperBlobBuilder::new().build().is_err());
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let mut sb = SuperBlobBuilder::new()
            .code_directories(vec![blob(CSMAGIC_CODEDIRECTORY, 10)])
            .build()
            .unwrap();
        sb.extend(vec![0; 64]);
        let parsed = SuperBlob::parse(&sb).unwrap();
        assert_eq!(parsed.entries().len(), 2);
    }

    #[test]
    fn test_unwrap_blob_rejects_overlong_length() {
        let mut b = wrap_blob(CSMAGIC_BLOBWRAPPER, b"abc");
        b[7] = 0xff;
        assert!(unwrap_blob(&b).is_err());
    }
}
