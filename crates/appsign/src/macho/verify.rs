//! Structural verification of signed binaries
//!
//! Recomputes what the signer computed and compares: page hashes over the
//! signed region, special-slot hashes of the embedded blobs, and the CMS
//! signature over the primary CodeDirectory. Certificate trust is not
//! evaluated.

use super::parser::{ArchitectureSlice, BinaryContainer};
use crate::codesign::code_directory::{hash_code_pages, SpecialSlot};
use crate::codesign::constants::{
    CSSLOT_DER_ENTITLEMENTS, CSSLOT_ENTITLEMENTS, CSSLOT_REQUIREMENTS, CSSLOT_SIGNATURESLOT,
};
use crate::codesign::superblob::unwrap_blob;
use crate::codesign::{CodeDirectory, SuperBlob};
use crate::{Error, Result};
use cryptographic_message_syntax::SignedData;

/// Outcome for one verified slice.
#[derive(Debug, Clone)]
pub struct SliceVerification {
    pub arch: String,
    pub identifier: String,
    pub team_id: Option<String>,
    /// Primary first.
    pub code_directories: Vec<CodeDirectory>,
    /// Certificate subject common names found in the CMS envelope.
    pub signers: Vec<String>,
}

/// Outcome for a whole binary.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub slices: Vec<SliceVerification>,
    /// Architectures carried over without a signature.
    pub unsigned: Vec<String>,
}

/// Verify every slice of a signed binary.
///
/// Unsupported slices without a signature are listed as unsigned; a
/// supported slice without one is an error.
pub fn verify_signed_binary(data: &[u8]) -> Result<VerificationReport> {
    let container = BinaryContainer::parse(data)?;
    let mut report = VerificationReport::default();
    for slice in container.slices() {
        if slice.code_signature_count() == 0 && !slice.is_supported() {
            report.unsigned.push(slice.arch_name());
            continue;
        }
        report.slices.push(verify_slice(slice)?);
    }
    Ok(report)
}

/// Verify one slice.
pub fn verify_slice(slice: &ArchitectureSlice) -> Result<SliceVerification> {
    let arch = slice.arch_name();
    let fail = |msg: String| Error::VerificationFailed(format!("{arch}: {msg}"));

    if slice.code_signature_count() != 1 {
        return Err(fail(format!(
            "expected one LC_CODE_SIGNATURE, found {}",
            slice.code_signature_count()
        )));
    }
    let signature = slice
        .signature_data()
        .ok_or_else(|| fail("signature region missing".into()))?;
    let superblob = SuperBlob::parse(signature)?;

    let cd_blobs = superblob.code_directories();
    if cd_blobs.is_empty() {
        return Err(fail("no CodeDirectory".into()));
    }

    let signed_len = slice.signed_region_end();
    let code_directories = cd_blobs
        .iter()
        .map(|blob| CodeDirectory::parse(blob))
        .collect::<Result<Vec<_>>>()?;

    for cd in &code_directories {
        if cd.code_limit as usize != signed_len {
            return Err(fail(format!(
                "code limit {} differs from signature offset {signed_len}",
                cd.code_limit
            )));
        }
        let expected = hash_code_pages(&slice.data()[..signed_len], cd.page_size, cd.digest_type);
        if let Some(page) = (0..expected.len().max(cd.code_hashes.len()))
            .find(|&i| expected.get(i) != cd.code_hashes.get(i))
        {
            return Err(fail(format!(
                "{:?} hash of page {page} does not match",
                cd.digest_type
            )));
        }

        for (slot_type, slot) in [
            (CSSLOT_REQUIREMENTS, SpecialSlot::Requirements),
            (CSSLOT_ENTITLEMENTS, SpecialSlot::Entitlements),
            (CSSLOT_DER_ENTITLEMENTS, SpecialSlot::DerEntitlements),
        ] {
            let Some(blob) = superblob.blob(slot_type) else {
                continue;
            };
            if cd.special_slot(slot) != Some(cd.digest_type.digest(blob).as_slice()) {
                return Err(fail(format!("special slot -{} does not match", slot as u32)));
            }
        }
    }

    let signers = verify_cms(&superblob, cd_blobs[0]).map_err(|e| fail(e.to_string()))?;

    let primary = &code_directories[0];
    Ok(SliceVerification {
        arch: arch.clone(),
        identifier: primary.identifier.clone(),
        team_id: primary.team_id.clone(),
        signers,
        code_directories,
    })
}

fn verify_cms(superblob: &SuperBlob, primary_cd: &[u8]) -> Result<Vec<String>> {
    let wrapper = superblob
        .blob(CSSLOT_SIGNATURESLOT)
        .ok_or_else(|| Error::VerificationFailed("no CMS signature blob".into()))?;
    let (_, der) = unwrap_blob(wrapper)?;
    let signed = SignedData::parse_ber(der)
        .map_err(|e| Error::VerificationFailed(format!("invalid CMS: {e}")))?;

    let mut count = 0;
    for signer in signed.signers() {
        signer
            .verify_signature_with_signed_data(&signed)
            .map_err(|e| Error::VerificationFailed(format!("CMS signature: {e}")))?;
        signer
            .verify_message_digest_with_content(primary_cd)
            .map_err(|e| Error::VerificationFailed(format!("CMS digest: {e}")))?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::VerificationFailed("CMS has no signers".into()));
    }

    Ok(signed
        .certificates()
        .filter_map(|c| c.subject_common_name())
        .collect())
}

/// Primary CodeDirectory of a signed slice.
pub fn primary_code_directory(slice: &ArchitectureSlice) -> Result<CodeDirectory> {
    let signature = slice
        .signature_data()
        .ok_or_else(|| Error::VerificationFailed(format!("{} is not signed", slice.arch_name())))?;
    let superblob = SuperBlob::parse(signature)?;
    let primary = superblob
        .code_directories()
        .first()
        .copied()
        .ok_or_else(|| Error::VerificationFailed("no CodeDirectory".into()))?;
    CodeDirectory::parse(primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::Entitlements;
    use crate::crypto::SigningCredentials;
    use crate::macho::signer::{MachOSigner, SigningParams};
    use crate::settings::SigningSettings;
    use crate::testutil::{self, MachOSpec};

    fn signed_executable() -> Vec<u8> {
        let (cert, key) = testutil::ecdsa_identity("Apple Development: Test", "TEAM000001");
        let creds = SigningCredentials::from_parts(cert, &key).unwrap();
        let settings = SigningSettings::default();
        let entitlements = Entitlements::new();
        MachOSigner::new(&creds, &settings)
            .sign_bytes(
                &MachOSpec::executable().build(),
                &SigningParams {
                    identifier: "com.example.app",
                    team_id: Some("TEAM000001"),
                    info_plist: None,
                    code_resources: None,
                    entitlements: &entitlements,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_verify_signed() {
        let report = verify_signed_binary(&signed_executable()).unwrap();
        assert_eq!(report.slices.len(), 1);
        let slice = &report.slices[0];
        assert_eq!(slice.identifier, "com.example.app");
        assert_eq!(slice.team_id.as_deref(), Some("TEAM000001"));
        assert_eq!(slice.signers, vec!["Apple Development: Test".to_string()]);
    }

    #[test]
    fn test_unsigned_is_rejected() {
        let err = verify_signed_binary(&MachOSpec::executable().build()).unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
    }

    #[test]
    fn test_tampered_page_is_detected() {
        let mut data = signed_executable();
        data[0x900] ^= 0xff;
        let err = verify_signed_binary(&data).unwrap_err();
        assert!(err.to_string().contains("page 0"));
    }
}
