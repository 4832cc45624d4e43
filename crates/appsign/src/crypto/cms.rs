//! CMS signature envelopes with Apple CDHash attributes
//!
//! The envelope is detached: its content is the primary CodeDirectory blob,
//! which is not embedded. Two signed attributes let the kernel pick an
//! agile hash without parsing every CodeDirectory:
//!
//! - `1.2.840.113635.100.9.1`: an XML plist whose `cdhashes` array lists
//!   every CodeDirectory's hash truncated to 20 bytes, in slot order.
//! - `1.2.840.113635.100.9.2`: one `SEQUENCE { digest OID, OCTET STRING }`
//!   per CodeDirectory carrying the full hash.
//!
//! The signing-time attribute is added by the CMS builder. The leaf
//! certificate and any intermediates go into the certificate set.

use super::cert::SigningCredentials;
use crate::codesign::constants::{CSMAGIC_BLOBWRAPPER, CS_CDHASH_LEN};
use crate::codesign::superblob::wrap_blob;
use crate::codesign::DigestType;
use crate::{Error, Result};
use bcder::encode::Values;
use bcder::{Captured, Mode, OctetString, Oid};
use cryptographic_message_syntax::{Bytes, SignedDataBuilder, SignerBuilder};
use x509_certificate::rfc5652::AttributeValue;

/// Apple CDHash plist attribute: 1.2.840.113635.100.9.1
pub const APPLE_CDHASH_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// Apple CDHash v2 attribute: 1.2.840.113635.100.9.2
pub const APPLE_CDHASH_V2_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

/// SHA-1: 1.3.14.3.2.26
const SHA1_OID: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];

/// SHA-256: 2.16.840.1.101.3.4.2.1
const SHA256_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// Hash of one CodeDirectory, tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdHash {
    pub digest_type: DigestType,
    pub hash: Vec<u8>,
}

/// Produces the CMS blob for a signature.
///
/// Operates on serialized CodeDirectory bytes only; it never sees the
/// binary being signed.
pub struct SignatureEnvelopeBuilder<'a> {
    credentials: &'a SigningCredentials,
}

impl<'a> SignatureEnvelopeBuilder<'a> {
    pub fn new(credentials: &'a SigningCredentials) -> Self {
        Self { credentials }
    }

    /// Sign `code_directory` and return the DER CMS structure.
    ///
    /// `cdhashes` lists every CodeDirectory of the signature in slot order.
    pub fn sign(&self, code_directory: &[u8], cdhashes: &[CdHash]) -> Result<Vec<u8>> {
        let plist = build_cdhash_plist(cdhashes)?;
        let v1_value = AttributeValue::new(Captured::from_values(
            Mode::Der,
            OctetString::encode_slice(&plist),
        ));

        let v2_values = cdhashes
            .iter()
            .map(|cdhash| {
                let encoded = build_cdhash_v2_value(cdhash);
                AttributeValue::new(Captured::from_values(Mode::Der, RawDer(&encoded)))
            })
            .collect::<Vec<_>>();

        let signer = SignerBuilder::new(
            self.credentials.signing_key(),
            self.credentials.certificate().clone(),
        )
        .signed_attribute(Oid(Bytes::copy_from_slice(APPLE_CDHASH_OID)), vec![v1_value])
        .signed_attribute(Oid(Bytes::copy_from_slice(APPLE_CDHASH_V2_OID)), v2_values);

        let mut builder = SignedDataBuilder::default()
            .content_external(code_directory.to_vec())
            .signer(signer)
            .certificate(self.credentials.certificate().clone());
        for cert in self.credentials.cert_chain() {
            builder = builder.certificate(cert.clone());
        }

        builder
            .build_der()
            .map_err(|e| Error::Signing(format!("Failed to build CMS signature: {e}")))
    }

    /// Sign and wrap in a 0xfade0b01 blob.
    pub fn sign_blob(&self, code_directory: &[u8], cdhashes: &[CdHash]) -> Result<Vec<u8>> {
        Ok(wrap_blob(CSMAGIC_BLOBWRAPPER, &self.sign(code_directory, cdhashes)?))
    }

    /// Upper bound for the wrapped blob size, used to reserve space.
    pub fn estimated_size(&self, cdhash_count: usize) -> usize {
        let certs: usize = std::iter::once(self.credentials.certificate())
            .chain(self.credentials.cert_chain())
            .map(|c| c.constructed_data().len())
            .sum();
        // Signer info, attributes and signature stay well below 4 KiB even
        // for RSA-4096; each cdhash adds a plist entry and a v2 value.
        certs + 4096 + cdhash_count * 128
    }
}

/// XML plist `{ cdhashes: [<data>...] }` with 20-byte hashes.
pub fn build_cdhash_plist(cdhashes: &[CdHash]) -> Result<Vec<u8>> {
    use plist::{Dictionary, Value};

    let hashes = cdhashes
        .iter()
        .map(|c| Value::Data(c.hash[..CS_CDHASH_LEN.min(c.hash.len())].to_vec()))
        .collect();
    let mut dict = Dictionary::new();
    dict.insert("cdhashes".to_string(), Value::Array(hashes));

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

/// DER `SEQUENCE { OBJECT IDENTIFIER, OCTET STRING }` for one cdhash.
fn build_cdhash_v2_value(cdhash: &CdHash) -> Vec<u8> {
    let oid = match cdhash.digest_type {
        DigestType::Sha1 => SHA1_OID,
        DigestType::Sha256 => SHA256_OID,
    };

    let mut inner = Vec::with_capacity(4 + oid.len() + cdhash.hash.len());
    inner.push(0x06);
    inner.push(oid.len() as u8);
    inner.extend_from_slice(oid);
    inner.push(0x04);
    inner.push(cdhash.hash.len() as u8);
    inner.extend_from_slice(&cdhash.hash);

    let mut result = Vec::with_capacity(2 + inner.len());
    result.push(0x30);
    result.push(inner.len() as u8);
    result.extend(inner);
    result
}

/// Pre-encoded DER passed through bcder untouched.
struct RawDer<'a>(&'a [u8]);

impl Values for RawDer<'_> {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: std::io::Write>(
        &self,
        _mode: Mode,
        target: &mut W,
    ) -> std::result::Result<(), std::io::Error> {
        target.write_all(self.0)
    }
}
