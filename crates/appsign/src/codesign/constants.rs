//! Apple code signing magic numbers, slot ids and opcodes
//!
//! Values follow `cs_blobs.h` and `requirement.h` from Apple's Security
//! framework. Everything in a code signature is big-endian regardless of
//! the host binary's byte order.

// =============================================================================
// Blob magic numbers
// =============================================================================

/// SuperBlob holding an embedded signature
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirement set blob
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Single requirement blob
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;

/// Entitlements, XML plist form
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Entitlements, DER form
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// Wrapper around the CMS signature
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Size of the generic `magic + length` blob header.
pub const BLOB_HEADER_SIZE: usize = 8;

// =============================================================================
// SuperBlob slot ids
// =============================================================================

/// Primary code directory
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;

/// Requirements blob
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;

/// XML entitlements blob
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// DER entitlements blob
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// First alternate code directory
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// Number of alternate code directory slots
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;

/// CMS signature
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// =============================================================================
// Hash types
// =============================================================================

/// SHA-1 (20 bytes)
pub const CS_HASHTYPE_SHA1: u8 = 1;

/// SHA-256 (32 bytes)
pub const CS_HASHTYPE_SHA256: u8 = 2;

/// SHA-1 digest length
pub const CS_SHA1_LEN: usize = 20;

/// SHA-256 digest length
pub const CS_SHA256_LEN: usize = 32;

/// CDHashes are truncated to this length wherever Apple lists them.
pub const CS_CDHASH_LEN: usize = 20;

// =============================================================================
// Flags
// =============================================================================

/// Ad-hoc signature (no identity)
pub const CS_ADHOC: u32 = 0x0000_0002;

/// Exec segment belongs to the main binary
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// Allow unsigned pages (debuggable builds)
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;

// =============================================================================
// CodeDirectory layout
// =============================================================================

/// Version with team id support
pub const CODEDIRECTORY_VERSION_TEAMID: u32 = 0x20200;

/// Version with 64-bit code limit
pub const CODEDIRECTORY_VERSION_CODELIMIT64: u32 = 0x20300;

/// Version with exec segment fields; the version this crate emits
pub const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x20400;

/// Header size of a version 0x20400 CodeDirectory
pub const CODEDIRECTORY_HEADER_SIZE: usize = 88;

/// Special slots emitted in every CodeDirectory (info through DER entitlements)
pub const CS_SPECIAL_SLOT_COUNT: usize = 7;

/// Default code page size
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Requirement language
// =============================================================================

/// `identifier "..."`
pub const OP_IDENT: u32 = 2;

/// Logical AND
pub const OP_AND: u32 = 6;

/// `certificate N[field.X]`
pub const OP_CERT_FIELD: u32 = 11;

/// `certificate N[field.OID]`
pub const OP_CERT_GENERIC: u32 = 14;

/// `anchor apple generic`
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;

/// Designated requirement type
pub const CSREQ_DESIGNATED: u32 = 0x0003;

/// Requirement expression form
pub const REQUIREMENT_KIND_EXPR: u32 = 1;

/// Match: exists
pub const MATCH_EXISTS: u32 = 0;

/// Match: equal
pub const MATCH_EQUAL: u32 = 1;

/// Apple iPhone developer marker extension, 1.2.840.113635.100.6.2.1
pub const OID_APPLE_WWDR_INTERMEDIATE: &[u8] =
    &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];
