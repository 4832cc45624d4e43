//! Mach-O signing implementation
//!
//! Signs every architecture slice of a binary independently:
//!
//! 1. Build the requirements and entitlements blobs.
//! 2. Reserve the signature region, which fixes the final header bytes.
//! 3. Hash the signed region into one CodeDirectory per configured digest.
//! 4. Sign the primary CodeDirectory into a CMS envelope.
//! 5. Assemble the SuperBlob and splice it into the reserved region.
//!
//! Slices share nothing, so changing the identity used for one slice never
//! changes another slice's CodeDirectory.

use super::parser::{ArchitectureSlice, BinaryContainer};
use super::writer::{prepare_signature_region, PreparedSlice};
use crate::codesign::code_directory::SpecialSlot;
use crate::codesign::constants::{
    CODEDIRECTORY_HEADER_SIZE, CS_EXECSEG_ALLOW_UNSIGNED, CS_EXECSEG_MAIN_BINARY,
    CS_SPECIAL_SLOT_COUNT,
};
use crate::codesign::requirements::{designated_requirement, empty_requirements};
use crate::codesign::{CodeDirectoryBuilder, Entitlements, SuperBlobBuilder};
use crate::crypto::{CdHash, SignatureEnvelopeBuilder, SigningCredentials};
use crate::settings::SigningSettings;
use crate::{Error, Result};
use log::{debug, warn};

/// SuperBlob header plus one index entry per blob (at most 7 here).
const SUPERBLOB_OVERHEAD: usize = 12 + 8 * 8;

/// Per-binary inputs that vary across a bundle.
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    /// Signing identifier, normally the bundle identifier.
    pub identifier: &'a str,
    /// Team identifier recorded in each CodeDirectory.
    pub team_id: Option<&'a str>,
    /// `Info.plist` bytes hashed into slot -1.
    pub info_plist: Option<&'a [u8]>,
    /// `_CodeSignature/CodeResources` bytes hashed into slot -3.
    pub code_resources: Option<&'a [u8]>,
    /// Entitlements embedded in slots 5 and 7.
    pub entitlements: &'a Entitlements,
}

/// Signs slices with one identity and one set of settings.
pub struct MachOSigner<'a> {
    credentials: &'a SigningCredentials,
    settings: &'a SigningSettings,
}

impl<'a> MachOSigner<'a> {
    pub fn new(credentials: &'a SigningCredentials, settings: &'a SigningSettings) -> Self {
        Self {
            credentials,
            settings,
        }
    }

    /// Sign raw file bytes, thin or fat.
    pub fn sign_bytes(&self, data: &[u8], params: &SigningParams<'_>) -> Result<Vec<u8>> {
        let container = BinaryContainer::parse(data)?;
        self.sign_container(&container, params)?.to_bytes()
    }

    /// Sign every supported slice of `container`.
    ///
    /// Unsupported fat slices are carried over unsigned with a warning unless
    /// all architectures are required. Cancellation is checked before each
    /// slice; a slice already being rewritten always completes.
    pub fn sign_container(
        &self,
        container: &BinaryContainer,
        params: &SigningParams<'_>,
    ) -> Result<BinaryContainer> {
        let mut signed = container.clone();
        for (index, slice) in container.slices().iter().enumerate() {
            self.settings.cancellation().check()?;

            if !slice.is_supported() {
                let arch = slice.arch_name();
                if container.is_fat() && !self.settings.get_require_all_architectures() {
                    warn!("skipping unsupported {arch} slice of {}", params.identifier);
                    continue;
                }
                return Err(Error::UnsupportedArchitecture(arch));
            }

            signed.replace_slice(index, self.sign_slice(slice, params)?);
        }
        Ok(signed)
    }

    /// Sign one slice and return the rewritten slice.
    pub fn sign_slice(
        &self,
        slice: &ArchitectureSlice,
        params: &SigningParams<'_>,
    ) -> Result<ArchitectureSlice> {
        let requirements = match self.credentials.common_name() {
            Some(cn) => designated_requirement(params.identifier, &cn),
            None => empty_requirements(),
        };
        let entitlements = params.entitlements.to_blob()?;
        let der_entitlements = params.entitlements.to_der_blob()?;

        let envelope = SignatureEnvelopeBuilder::new(self.credentials);
        let reserved = self.estimate_code_directories(slice, params)
            + envelope.estimated_size(self.settings.get_digests().len())
            + requirements.len()
            + entitlements.len()
            + der_entitlements.len()
            + SUPERBLOB_OVERHEAD;

        let prepared = prepare_signature_region(slice, reserved)?;
        let (code_directories, cdhashes) = self.build_code_directories(
            slice,
            &prepared,
            params,
            &requirements,
            &entitlements,
            &der_entitlements,
        )?;

        let cms = envelope.sign_blob(&code_directories[0], &cdhashes)?;
        let superblob = SuperBlobBuilder::new()
            .code_directories(code_directories)
            .requirements(requirements)
            .entitlements(entitlements)
            .der_entitlements(der_entitlements)
            .cms_signature(cms)
            .build()?;

        debug!(
            "signed {} slice of {}: {} code bytes, {} byte signature",
            slice.arch_name(),
            params.identifier,
            prepared.signature_offset(),
            superblob.len()
        );
        prepared.finish(&superblob)
    }

    fn build_code_directories(
        &self,
        slice: &ArchitectureSlice,
        prepared: &PreparedSlice,
        params: &SigningParams<'_>,
        requirements: &[u8],
        entitlements: &[u8],
        der_entitlements: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<CdHash>)> {
        let (exec_base, exec_limit) = slice
            .text_segment()
            .map(|s| (s.fileoff, s.filesize))
            .unwrap_or((0, 0));
        let mut exec_flags = 0;
        if slice.is_executable() {
            exec_flags |= CS_EXECSEG_MAIN_BINARY;
            if params.entitlements.get_task_allow() {
                exec_flags |= CS_EXECSEG_ALLOW_UNSIGNED;
            }
        }

        let mut blobs = Vec::new();
        let mut cdhashes = Vec::new();
        for &digest_type in self.settings.get_digests() {
            let mut builder = CodeDirectoryBuilder::new(params.identifier, digest_type)
                .page_size(self.settings.get_page_size())
                .exec_segment(exec_base, exec_limit, exec_flags)
                .special_blob(SpecialSlot::Requirements, requirements)
                .special_blob(SpecialSlot::Entitlements, entitlements)
                .special_blob(SpecialSlot::DerEntitlements, der_entitlements);
            if let Some(team_id) = params.team_id {
                builder = builder.team_id(team_id);
            }
            if let Some(info) = params.info_plist {
                builder = builder.special_blob(SpecialSlot::Info, info);
            }
            if let Some(resources) = params.code_resources {
                builder = builder.special_blob(SpecialSlot::ResourceDir, resources);
            }

            let blob = builder.build(prepared.signed_region()).to_blob()?;
            cdhashes.push(CdHash {
                digest_type,
                hash: digest_type.digest(&blob),
            });
            blobs.push(blob);
        }
        Ok((blobs, cdhashes))
    }

    /// Upper bound for the CodeDirectories of `slice`.
    fn estimate_code_directories(
        &self,
        slice: &ArchitectureSlice,
        params: &SigningParams<'_>,
    ) -> usize {
        // The signature offset is aligned, so one extra page hash covers
        // the padding.
        let pages = slice.signed_region_end() / self.settings.get_page_size() + 2;
        let strings = params.identifier.len() + params.team_id.map_or(0, str::len) + 2;
        self.settings
            .get_digests()
            .iter()
            .map(|d| {
                CODEDIRECTORY_HEADER_SIZE + strings + (CS_SPECIAL_SLOT_COUNT + pages) * d.hash_size()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::{CodeDirectory, DigestType, SuperBlob};
    use crate::settings::CancellationToken;
    use crate::testutil::{self, MachOSpec};

    fn credentials() -> SigningCredentials {
        let (cert, key) = testutil::ecdsa_identity("Apple Development: Test", "TEAM000001");
        SigningCredentials::from_parts(cert, &key).unwrap()
    }

    fn params(entitlements: &Entitlements) -> SigningParams<'_> {
        SigningParams {
            identifier: "com.example.app",
            team_id: Some("TEAM000001"),
            info_plist: None,
            code_resources: None,
            entitlements,
        }
    }

    #[test]
    fn test_sign_executable() {
        let creds = credentials();
        let settings = SigningSettings::default();
        let mut entitlements = Entitlements::new();
        entitlements.insert("get-task-allow", true);

        let data = MachOSpec::executable().build();
        let signed = MachOSigner::new(&creds, &settings)
            .sign_bytes(&data, &params(&entitlements))
            .unwrap();

        let container = BinaryContainer::parse(&signed).unwrap();
        let slice = &container.slices()[0];
        assert_eq!(slice.code_signature_count(), 1);

        let superblob = SuperBlob::parse(slice.signature_data().unwrap()).unwrap();
        let cds = superblob.code_directories();
        assert_eq!(cds.len(), 2);

        let sha1 = CodeDirectory::parse(cds[0]).unwrap();
        let sha256 = CodeDirectory::parse(cds[1]).unwrap();
        assert_eq!(sha1.digest_type, DigestType::Sha1);
        assert_eq!(sha256.digest_type, DigestType::Sha256);
        assert_eq!(sha256.team_id.as_deref(), Some("TEAM000001"));
        assert_eq!(
            sha256.exec_seg_flags,
            CS_EXECSEG_MAIN_BINARY | CS_EXECSEG_ALLOW_UNSIGNED
        );
        assert_eq!(sha256.exec_seg_limit, 0x4000);

        let code_len = slice.signed_region_end();
        assert_eq!(sha256.code_limit as usize, code_len);
        assert_eq!(sha256.code_hashes.len(), code_len.div_ceil(4096));
        assert!(sha256.has_special_slot(SpecialSlot::Entitlements));
        assert!(!sha256.has_special_slot(SpecialSlot::Info));
    }

    #[test]
    fn test_unsupported_thin_binary_is_an_error() {
        let creds = credentials();
        let settings = SigningSettings::default();
        let entitlements = Entitlements::new();
        let data = MachOSpec::executable()
            .cpu(testutil::CPU_TYPE_POWERPC, 0)
            .build();
        let err = MachOSigner::new(&creds, &settings)
            .sign_bytes(&data, &params(&entitlements))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(_)));
    }

    #[test]
    fn test_unsupported_fat_slice_is_skipped() {
        let creds = credentials();
        let entitlements = Entitlements::new();
        let ppc = MachOSpec::executable()
            .cpu(testutil::CPU_TYPE_POWERPC, 0)
            .build();
        let data = testutil::fat(&[
            (testutil::CPU_TYPE_ARM64, 0, MachOSpec::executable().build()),
            (testutil::CPU_TYPE_POWERPC, 0, ppc.clone()),
        ]);

        let settings = SigningSettings::default();
        let signed = MachOSigner::new(&creds, &settings)
            .sign_bytes(&data, &params(&entitlements))
            .unwrap();
        let container = BinaryContainer::parse(&signed).unwrap();
        assert_eq!(container.slices()[0].code_signature_count(), 1);
        assert_eq!(container.slices()[1].data(), &ppc[..]);

        let strict = SigningSettings::default().require_all_architectures(true);
        assert!(matches!(
            MachOSigner::new(&creds, &strict).sign_bytes(&data, &params(&entitlements)),
            Err(Error::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn test_cancelled_before_first_slice() {
        let creds = credentials();
        let token = CancellationToken::new();
        token.cancel();
        let settings = SigningSettings::default().cancellation_token(token);
        let entitlements = Entitlements::new();
        let err = MachOSigner::new(&creds, &settings)
            .sign_bytes(&MachOSpec::executable().build(), &params(&entitlements))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
