//! CodeDirectory construction and decoding
//!
//! The CodeDirectory is the core data structure of an Apple code signature.
//! It records one hash per code page of the signed region, a fixed block of
//! special-slot hashes (Info.plist, requirements, resources, entitlements),
//! and the identifier/team strings. The CMS signature covers the serialized
//! CodeDirectory, never the binary itself.
//!
//! The hash algorithm is a builder input, so one signed region can carry
//! several CodeDirectories (SHA-1 in the primary slot, SHA-256 in the first
//! alternate slot is what Xcode emits for iOS).

use super::constants::*;
use crate::{Error, Result};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash algorithm of a CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestType {
    /// SHA-1, kept for older iOS releases
    Sha1,
    /// SHA-256, required since iOS 12
    Sha256,
}

impl DigestType {
    /// `hashType` value stored in the CodeDirectory header.
    pub fn hash_type(self) -> u8 {
        match self {
            DigestType::Sha1 => CS_HASHTYPE_SHA1,
            DigestType::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    /// Digest length in bytes.
    pub fn hash_size(self) -> usize {
        match self {
            DigestType::Sha1 => CS_SHA1_LEN,
            DigestType::Sha256 => CS_SHA256_LEN,
        }
    }

    /// Decode a `hashType` header value.
    pub fn from_hash_type(value: u8) -> Option<Self> {
        match value {
            CS_HASHTYPE_SHA1 => Some(DigestType::Sha1),
            CS_HASHTYPE_SHA256 => Some(DigestType::Sha256),
            _ => None,
        }
    }

    /// Hash `data` with this algorithm.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestType::Sha1 => Sha1::digest(data).to_vec(),
            DigestType::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Special slots, by their positive index (stored negated in the blob).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialSlot {
    /// Info.plist (-1)
    Info = 1,
    /// Requirements blob (-2)
    Requirements = 2,
    /// `_CodeSignature/CodeResources` (-3)
    ResourceDir = 3,
    /// Application specific (-4), unused on iOS
    Application = 4,
    /// XML entitlements blob (-5)
    Entitlements = 5,
    /// Representation specific (-6), unused on iOS
    RepSpecific = 6,
    /// DER entitlements blob (-7)
    DerEntitlements = 7,
}

/// A decoded or freshly built CodeDirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDirectory {
    /// Format version
    pub version: u32,
    /// Signature flags (`CS_ADHOC`, ...)
    pub flags: u32,
    /// Hash algorithm of every slot
    pub digest_type: DigestType,
    /// Code page size in bytes; 0 means a single unbounded page
    pub page_size: usize,
    /// Length of the signed region
    pub code_limit: u64,
    /// Exec segment base offset
    pub exec_seg_base: u64,
    /// Exec segment limit (`__TEXT` file size)
    pub exec_seg_limit: u64,
    /// Exec segment flags
    pub exec_seg_flags: u64,
    /// Signing identifier
    pub identifier: String,
    /// Team identifier, absent for ad-hoc signatures
    pub team_id: Option<String>,
    /// Special-slot hashes; index 0 is slot -1
    pub special_slots: Vec<Vec<u8>>,
    /// Per-page hashes in page order
    pub code_hashes: Vec<Vec<u8>>,
}

impl CodeDirectory {
    /// Hash stored for a special slot. Absent slots read as all zeros.
    pub fn special_slot(&self, slot: SpecialSlot) -> Option<&[u8]> {
        self.special_slots
            .get(slot as usize - 1)
            .map(|hash| hash.as_slice())
    }

    /// True when the special slot carries a non-zero hash.
    pub fn has_special_slot(&self, slot: SpecialSlot) -> bool {
        self.special_slot(slot)
            .map(|hash| hash.iter().any(|&b| b != 0))
            .unwrap_or(false)
    }

    /// Serialize to the big-endian blob form.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let hash_size = self.digest_type.hash_size();
        let n_special = self.special_slots.len();
        let n_code = self.code_hashes.len();

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let ident_len = self.identifier.len() + 1;
        let team_len = self.team_id.as_ref().map(|t| t.len() + 1).unwrap_or(0);
        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };
        let hash_offset = ident_offset + ident_len + team_len + n_special * hash_size;
        let total_len = hash_offset + n_code * hash_size;

        let code_limit = u32::try_from(self.code_limit).map_err(|_| {
            Error::SignatureRegionOverflow(format!(
                "signed region of {} bytes does not fit a 32-bit code limit",
                self.code_limit
            ))
        })?;
        let page_log2 = if self.page_size == 0 {
            0
        } else {
            self.page_size.trailing_zeros() as u8
        };

        let mut buf = Vec::with_capacity(total_len);
        buf.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(&(total_len as u32).to_be_bytes());
        buf.extend(&self.version.to_be_bytes());
        buf.extend(&self.flags.to_be_bytes());
        buf.extend(&(hash_offset as u32).to_be_bytes());
        buf.extend(&(ident_offset as u32).to_be_bytes());
        buf.extend(&(n_special as u32).to_be_bytes());
        buf.extend(&(n_code as u32).to_be_bytes());
        buf.extend(&code_limit.to_be_bytes());
        buf.push(hash_size as u8);
        buf.push(self.digest_type.hash_type());
        buf.push(0); // platform
        buf.push(page_log2);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatterOffset
        buf.extend(&(team_offset as u32).to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64, unused while codeLimit fits
        buf.extend(&self.exec_seg_base.to_be_bytes());
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = &self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        // Special slots are stored from the highest index down to -1.
        for hash in self.special_slots.iter().rev() {
            buf.extend(hash);
        }
        for hash in &self.code_hashes {
            buf.extend(hash);
        }

        debug_assert_eq!(buf.len(), total_len);
        Ok(buf)
    }

    /// CDHash: the digest of the serialized blob with this directory's algorithm.
    pub fn cdhash(&self) -> Result<Vec<u8>> {
        Ok(self.digest_type.digest(&self.to_blob()?))
    }

    /// Decode a CodeDirectory blob.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let field = |offset: usize| -> Result<u32> {
            data.get(offset..offset + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| Error::VerificationFailed("truncated CodeDirectory".into()))
        };
        let field64 = |offset: usize| -> Result<u64> {
            Ok(((field(offset)? as u64) << 32) | field(offset + 4)? as u64)
        };

        if field(0)? != CSMAGIC_CODEDIRECTORY {
            return Err(Error::VerificationFailed("bad CodeDirectory magic".into()));
        }
        let length = field(4)? as usize;
        if length > data.len() {
            return Err(Error::VerificationFailed(
                "CodeDirectory length exceeds blob".into(),
            ));
        }
        let data = &data[..length];

        let version = field(8)?;
        let flags = field(12)?;
        let hash_offset = field(16)? as usize;
        let ident_offset = field(20)? as usize;
        let n_special = field(24)? as usize;
        let n_code = field(28)? as usize;
        let mut code_limit = field(32)? as u64;
        let header = data
            .get(36..40)
            .ok_or_else(|| Error::VerificationFailed("truncated CodeDirectory".into()))?;
        let (hash_size, hash_type, page_log2) = (header[0] as usize, header[1], header[3]);

        let digest_type = DigestType::from_hash_type(hash_type).ok_or_else(|| {
            Error::VerificationFailed(format!("unsupported hash type {hash_type}"))
        })?;
        if digest_type.hash_size() != hash_size {
            return Err(Error::VerificationFailed(format!(
                "hash size {hash_size} does not match hash type {hash_type}"
            )));
        }

        let team_id = if version >= CODEDIRECTORY_VERSION_TEAMID {
            match field(48)? as usize {
                0 => None,
                offset => Some(read_cstr(data, offset)?),
            }
        } else {
            None
        };
        if version >= CODEDIRECTORY_VERSION_CODELIMIT64 {
            let limit64 = field64(56)?;
            if limit64 != 0 {
                code_limit = limit64;
            }
        }
        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CODEDIRECTORY_VERSION_EXECSEG {
                (field64(64)?, field64(72)?, field64(80)?)
            } else {
                (0, 0, 0)
            };

        let special_start = hash_offset
            .checked_sub(n_special * hash_size)
            .ok_or_else(|| Error::VerificationFailed("special slots overlap header".into()))?;
        let code_end = hash_offset + n_code * hash_size;
        if code_end > data.len() {
            return Err(Error::VerificationFailed(
                "hash slots extend past CodeDirectory".into(),
            ));
        }

        let mut special_slots: Vec<Vec<u8>> = data[special_start..hash_offset]
            .chunks(hash_size)
            .map(|c| c.to_vec())
            .collect();
        special_slots.reverse();
        let code_hashes = data[hash_offset..code_end]
            .chunks(hash_size)
            .map(|c| c.to_vec())
            .collect();

        Ok(Self {
            version,
            flags,
            digest_type,
            page_size: if page_log2 == 0 { 0 } else { 1usize << page_log2 },
            code_limit,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            identifier: read_cstr(data, ident_offset)?,
            team_id,
            special_slots,
            code_hashes,
        })
    }
}

fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| Error::VerificationFailed("string offset out of range".into()))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::VerificationFailed("unterminated string".into()))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Builder for [`CodeDirectory`] values.
///
/// Special-slot inputs are the raw bytes of the referenced item (the
/// Info.plist file, the requirements blob, ...). They are hashed with the
/// directory's algorithm at build time, so the same builder inputs can
/// produce both the SHA-1 and the SHA-256 directory.
///
/// # Example
///
/// ```
/// use appsign::codesign::{CodeDirectoryBuilder, DigestType, SpecialSlot};
///
/// let code = vec![0u8; 8192];
/// let cd = CodeDirectoryBuilder::new("com.example.app", DigestType::Sha256)
///     .team_id("TEAMID1234")
///     .special_blob(SpecialSlot::Info, b"<plist/>")
///     .build(&code);
/// assert_eq!(cd.code_hashes.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct CodeDirectoryBuilder<'a> {
    identifier: String,
    digest_type: DigestType,
    team_id: Option<String>,
    page_size: usize,
    flags: u32,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    special: [Option<&'a [u8]>; CS_SPECIAL_SLOT_COUNT],
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// Create a builder for `identifier` using `digest_type`.
    pub fn new(identifier: impl Into<String>, digest_type: DigestType) -> Self {
        Self {
            identifier: identifier.into(),
            digest_type,
            team_id: None,
            page_size: PAGE_SIZE,
            flags: 0,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            special: [None; CS_SPECIAL_SLOT_COUNT],
        }
    }

    /// Set the team identifier.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Set the code page size. Must be a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the signature flags.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the exec segment range and flags.
    pub fn exec_segment(mut self, base: u64, limit: u64, flags: u64) -> Self {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self.exec_seg_flags = flags;
        self
    }

    /// Record the item whose hash goes into `slot`.
    pub fn special_blob(mut self, slot: SpecialSlot, data: &'a [u8]) -> Self {
        self.special[slot as usize - 1] = Some(data);
        self
    }

    /// Hash `code` and produce the directory. Never touches `code`.
    pub fn build(&self, code: &[u8]) -> CodeDirectory {
        let zero = vec![0u8; self.digest_type.hash_size()];
        let special_slots = self
            .special
            .iter()
            .map(|item| match item {
                Some(data) => self.digest_type.digest(data),
                None => zero.clone(),
            })
            .collect();

        CodeDirectory {
            version: CODEDIRECTORY_VERSION_EXECSEG,
            flags: self.flags,
            digest_type: self.digest_type,
            page_size: self.page_size,
            code_limit: code.len() as u64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            identifier: self.identifier.clone(),
            team_id: self.team_id.clone(),
            special_slots,
            code_hashes: hash_code_pages(code, self.page_size, self.digest_type),
        }
    }
}

/// Hash `code` page by page. The final short page is hashed as-is.
///
/// Pages are hashed in parallel; `collect` keeps them in page order.
pub fn hash_code_pages(code: &[u8], page_size: usize, digest_type: DigestType) -> Vec<Vec<u8>> {
    if code.is_empty() {
        return Vec::new();
    }
    if page_size == 0 {
        return vec![digest_type.digest(code)];
    }
    code.par_chunks(page_size)
        .map(|page| digest_type.digest(page))
        .collect()
}
