//! Fixtures shared by unit and integration tests
//!
//! Builds small but well-formed Mach-O images, fat containers, signing
//! identities and profile plists in code so no binary blobs are checked in.
//! Only external crates are used here; integration tests pull this file in
//! with `#[path]`.

#![allow(dead_code)]

use plist::{Dictionary, Value};
use std::time::{Duration, SystemTime};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, X509CertificateBuilder};

pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_POWERPC: u32 = 18;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;

pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
pub const LC_RPATH: u32 = 0x8000_001c;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

/// File offset of the `__text` section in generated images.
pub const TEXT_SECTION_OFFSET: usize = 0x800;

/// Description of a synthetic single-architecture image.
#[derive(Debug, Clone)]
pub struct MachOSpec {
    pub big_endian: bool,
    pub is_64: bool,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    pub install_name: Option<String>,
    pub dylibs: Vec<(u32, String)>,
    pub rpaths: Vec<String>,
    pub text_size: usize,
    pub linkedit_size: usize,
    pub seed: u8,
}

impl MachOSpec {
    /// arm64 little-endian executable.
    pub fn executable() -> Self {
        Self {
            big_endian: false,
            is_64: true,
            cpu_type: CPU_TYPE_ARM64,
            cpu_subtype: CPU_SUBTYPE_ARM64_ALL,
            file_type: MH_EXECUTE,
            install_name: None,
            dylibs: vec![(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib".into())],
            rpaths: Vec::new(),
            text_size: 0x4000,
            linkedit_size: 0x530,
            seed: 1,
        }
    }

    /// arm64 little-endian dylib with the given install name.
    pub fn dylib(install_name: &str) -> Self {
        Self {
            file_type: MH_DYLIB,
            install_name: Some(install_name.into()),
            text_size: 0x2000,
            linkedit_size: 0x1a0,
            seed: 7,
            ..Self::executable()
        }
    }

    pub fn with_dylib(mut self, name: &str) -> Self {
        self.dylibs.push((LC_LOAD_DYLIB, name.into()));
        self
    }

    pub fn with_rpath(mut self, path: &str) -> Self {
        self.rpaths.push(path.into());
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// 32-bit ARMv7 layout.
    pub fn arm32(mut self) -> Self {
        self.is_64 = false;
        self.cpu_type = CPU_TYPE_ARM;
        self.cpu_subtype = CPU_SUBTYPE_ARM_V7;
        self
    }

    pub fn cpu(mut self, cpu_type: u32, cpu_subtype: u32) -> Self {
        self.cpu_type = cpu_type;
        self.cpu_subtype = cpu_subtype;
        self
    }

    /// File sizes of `__TEXT` and `__LINKEDIT`.
    pub fn sizes(mut self, text_size: usize, linkedit_size: usize) -> Self {
        self.text_size = text_size;
        self.linkedit_size = linkedit_size;
        self
    }

    pub fn seed(mut self, seed: u8) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        build_macho(self)
    }
}

struct Writer {
    buf: Vec<u8>,
    big_endian: bool,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        if self.big_endian {
            self.buf.extend(v.to_be_bytes());
        } else {
            self.buf.extend(v.to_le_bytes());
        }
    }

    fn u64(&mut self, v: u64) {
        if self.big_endian {
            self.buf.extend(v.to_be_bytes());
        } else {
            self.buf.extend(v.to_le_bytes());
        }
    }

    fn word(&mut self, is_64: bool, v: u64) {
        if is_64 {
            self.u64(v)
        } else {
            self.u32(v as u32)
        }
    }

    fn name16(&mut self, name: &str) {
        let mut raw = [0u8; 16];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        self.buf.extend(raw);
    }

    fn string_command(&mut self, cmd: u32, fixed: usize, body: &[u32], s: &str, align: usize) {
        let size = (fixed + s.len() + 1).div_ceil(align) * align;
        self.u32(cmd);
        self.u32(size as u32);
        self.u32(fixed as u32);
        for v in body {
            self.u32(*v);
        }
        self.buf.extend(s.as_bytes());
        self.buf.resize(self.buf.len() + size - fixed - s.len(), 0);
    }
}

fn build_macho(spec: &MachOSpec) -> Vec<u8> {
    let is_64 = spec.is_64;
    let ptr_align = if is_64 { 8 } else { 4 };
    let vm_base: u64 = if spec.file_type == MH_EXECUTE && is_64 {
        0x1_0000_0000
    } else {
        0
    };

    let mut cmds = Writer {
        buf: Vec::new(),
        big_endian: spec.big_endian,
    };
    let mut ncmds = 0u32;

    let (seg_cmd, seg_size, sect_size) = if is_64 {
        (LC_SEGMENT_64, 72u32, 80u32)
    } else {
        (LC_SEGMENT, 56u32, 68u32)
    };

    // __TEXT with one __text section
    cmds.u32(seg_cmd);
    cmds.u32(seg_size + sect_size);
    cmds.name16("__TEXT");
    cmds.word(is_64, vm_base);
    cmds.word(is_64, spec.text_size as u64);
    cmds.word(is_64, 0);
    cmds.word(is_64, spec.text_size as u64);
    cmds.u32(5);
    cmds.u32(5);
    cmds.u32(1);
    cmds.u32(0);
    cmds.name16("__text");
    cmds.name16("__TEXT");
    cmds.word(is_64, vm_base + TEXT_SECTION_OFFSET as u64);
    cmds.word(is_64, (spec.text_size - TEXT_SECTION_OFFSET) as u64);
    cmds.u32(TEXT_SECTION_OFFSET as u32);
    cmds.u32(2);
    cmds.u32(0);
    cmds.u32(0);
    cmds.u32(0x8000_0400);
    cmds.u32(0);
    cmds.u32(0);
    if is_64 {
        cmds.u32(0);
    }
    ncmds += 1;

    // __LINKEDIT
    let linkedit_vm = vm_base + spec.text_size as u64;
    cmds.u32(seg_cmd);
    cmds.u32(seg_size);
    cmds.name16("__LINKEDIT");
    cmds.word(is_64, linkedit_vm);
    cmds.word(is_64, (spec.linkedit_size as u64).div_ceil(0x4000) * 0x4000);
    cmds.word(is_64, spec.text_size as u64);
    cmds.word(is_64, spec.linkedit_size as u64);
    cmds.u32(1);
    cmds.u32(1);
    cmds.u32(0);
    cmds.u32(0);
    ncmds += 1;

    if let Some(name) = &spec.install_name {
        cmds.string_command(LC_ID_DYLIB, 24, &[2, 0x1_0000, 0x1_0000], name, ptr_align);
        ncmds += 1;
    }
    for (cmd, name) in &spec.dylibs {
        cmds.string_command(*cmd, 24, &[2, 0x1_0000, 0x1_0000], name, ptr_align);
        ncmds += 1;
    }
    for path in &spec.rpaths {
        cmds.string_command(LC_RPATH, 12, &[], path, ptr_align);
        ncmds += 1;
    }

    let mut out = Writer {
        buf: Vec::new(),
        big_endian: spec.big_endian,
    };
    let magic: u32 = if is_64 { 0xfeed_facf } else { 0xfeed_face };
    out.u32(magic);
    out.u32(spec.cpu_type);
    out.u32(spec.cpu_subtype);
    out.u32(spec.file_type);
    out.u32(ncmds);
    out.u32(cmds.buf.len() as u32);
    out.u32(0x0020_0085);
    if is_64 {
        out.u32(0);
    }
    out.buf.extend(&cmds.buf);
    assert!(out.buf.len() <= TEXT_SECTION_OFFSET, "load commands overflow");

    out.buf.resize(TEXT_SECTION_OFFSET, 0);
    let mut state = u32::from(spec.seed).wrapping_mul(2_654_435_761).wrapping_add(12345);
    while out.buf.len() < spec.text_size + spec.linkedit_size {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
        out.buf.push((state >> 16) as u8);
    }
    out.buf
}

/// Wrap slices into a fat container with 2^14 alignment.
pub fn fat(slices: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    const ALIGN: u32 = 14;
    let header_len = 8 + 20 * slices.len();
    let mut offsets = Vec::new();
    let mut cursor = header_len.div_ceil(1 << ALIGN) * (1 << ALIGN);
    for (_, _, data) in slices {
        offsets.push(cursor);
        cursor = (cursor + data.len()).div_ceil(1 << ALIGN) * (1 << ALIGN);
    }

    let mut out = Vec::new();
    out.extend(0xcafe_babeu32.to_be_bytes());
    out.extend((slices.len() as u32).to_be_bytes());
    for ((cpu, sub, data), offset) in slices.iter().zip(&offsets) {
        for v in [*cpu, *sub, *offset as u32, data.len() as u32, ALIGN] {
            out.extend(v.to_be_bytes());
        }
    }
    for ((_, _, data), offset) in slices.iter().zip(&offsets) {
        out.resize(*offset, 0);
        out.extend(data);
    }
    out
}

fn self_signed(key: &InMemorySigningKeyPair, cn: &str, ou: &str) -> CapturedX509Certificate {
    let mut builder = X509CertificateBuilder::default();
    builder
        .subject()
        .append_common_name_utf8_string(cn)
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(ou)
        .unwrap();
    builder.create_with_key_pair(key).unwrap()
}

/// Self-signed ECDSA P-256 certificate plus its PKCS#8 key.
pub fn ecdsa_identity(cn: &str, ou: &str) -> (CapturedX509Certificate, Vec<u8>) {
    use p256::pkcs8::EncodePrivateKey;

    let secret = p256::SecretKey::random(&mut rand::thread_rng());
    let pkcs8 = secret.to_pkcs8_der().unwrap().as_bytes().to_vec();
    let key = InMemorySigningKeyPair::from_pkcs8_der(&pkcs8).unwrap();
    (self_signed(&key, cn, ou), pkcs8)
}

/// Self-signed RSA-2048 certificate plus its PKCS#8 key.
pub fn rsa_identity(cn: &str, ou: &str) -> (CapturedX509Certificate, Vec<u8>) {
    use rsa::pkcs8::EncodePrivateKey;

    let secret = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pkcs8 = secret.to_pkcs8_der().unwrap().as_bytes().to_vec();
    let key = InMemorySigningKeyPair::from_pkcs8_der(&pkcs8).unwrap();
    (self_signed(&key, cn, ou), pkcs8)
}

/// Unsigned profile payload as an XML plist.
///
/// Grants `get-task-allow` plus the application identifier. Expires a year
/// from now unless `expiration` is given.
pub fn profile_plist(
    app_id: &str,
    team: &str,
    devices: &[&str],
    expiration: Option<SystemTime>,
) -> Vec<u8> {
    let mut entitlements = Dictionary::new();
    entitlements.insert("application-identifier".into(), app_id.into());
    entitlements.insert("com.apple.developer.team-identifier".into(), team.into());
    entitlements.insert("get-task-allow".into(), true.into());
    entitlements.insert(
        "keychain-access-groups".into(),
        Value::Array(vec![format!("{team}.*").into()]),
    );

    let expiration =
        expiration.unwrap_or_else(|| SystemTime::now() + Duration::from_secs(365 * 86_400));

    let mut dict = Dictionary::new();
    dict.insert("AppIDName".into(), "Test App".into());
    dict.insert("Name".into(), "Test Profile".into());
    dict.insert("TeamIdentifier".into(), Value::Array(vec![team.into()]));
    if !devices.is_empty() {
        dict.insert(
            "ProvisionedDevices".into(),
            Value::Array(devices.iter().map(|d| (*d).into()).collect()),
        );
    }
    dict.insert("Entitlements".into(), Value::Dictionary(entitlements));
    dict.insert("ExpirationDate".into(), Value::Date(expiration.into()));

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &dict).unwrap();
    buf
}

/// Minimal `Info.plist`.
pub fn info_plist(bundle_id: &str, executable: &str) -> Vec<u8> {
    let mut dict = Dictionary::new();
    dict.insert("CFBundleIdentifier".into(), bundle_id.into());
    dict.insert("CFBundleExecutable".into(), executable.into());
    dict.insert("CFBundleShortVersionString".into(), "1.0".into());
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &dict).unwrap();
    buf
}
