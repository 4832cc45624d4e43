//! Certificate and private key handling for code signing.
//!
//! This module loads signing credentials from PEM/DER files or PKCS#12 (.p12)
//! containers. It supports RSA and ECDSA (P-256) private keys, the two key
//! types Apple issues development and distribution certificates for.
//!
//! Keys are normalized to PKCS#8 and held as an
//! [`InMemorySigningKeyPair`], which the CMS builder signs with directly.
//!
//! # Examples
//!
//! ```no_run
//! use appsign::crypto::SigningCredentials;
//!
//! // Load from PKCS#12 file (recommended)
//! let p12_data = std::fs::read("certificate.p12")?;
//! let credentials = SigningCredentials::from_p12(&p12_data, "password")?;
//!
//! // Load from PEM files
//! let cert_pem = std::fs::read("certificate.pem")?;
//! let key_pem = std::fs::read("private_key.pem")?;
//! let credentials = SigningCredentials::from_pem(&cert_pem, &key_pem)?;
//! # Ok::<(), appsign::Error>(())
//! ```

use crate::{Error, Result};
use cryptographic_message_syntax::{SignedData, SignedDataBuilder, SignerBuilder};
use log::debug;
use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use std::fmt;
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, X509Certificate};

/// Message signed when checking that a key belongs to a certificate.
const KEY_PROBE: &[u8] = b"appsign key pair probe";

/// Private key algorithm of the signing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// RSA, commonly 2048 bits for Apple identities
    Rsa,
    /// ECDSA on P-256
    Ecdsa,
}

/// Code signing credentials: certificate, private key and chain.
///
/// Read-only once constructed; a single value is shared by every signing
/// worker of a run.
///
/// # Security
///
/// The private key contained in this struct should be treated as sensitive data.
/// The `Debug` output never includes it.
pub struct SigningCredentials {
    certificate: CapturedX509Certificate,
    signing_key: InMemorySigningKeyPair,
    key_kind: KeyKind,
    cert_chain: Vec<CapturedX509Certificate>,
    team_id: Option<String>,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("common_name", &self.common_name())
            .field("key_kind", &self.key_kind)
            .field("chain_len", &self.cert_chain.len())
            .field("team_id", &self.team_id)
            .finish()
    }
}

impl SigningCredentials {
    /// Build credentials from an already parsed certificate and a PKCS#8 key.
    pub fn from_parts(certificate: CapturedX509Certificate, pkcs8_key_der: &[u8]) -> Result<Self> {
        let key_kind = detect_key_kind(pkcs8_key_der)?;
        let signing_key = InMemorySigningKeyPair::from_pkcs8_der(pkcs8_key_der)
            .map_err(|e| Error::Certificate(format!("Unusable private key: {e}")))?;
        let team_id = extract_team_id(&certificate);

        Ok(Self {
            certificate,
            signing_key,
            key_kind,
            cert_chain: Vec::new(),
            team_id,
        })
    }

    /// Load credentials from a PEM certificate and a PEM private key.
    ///
    /// The key may be PKCS#8 (`PRIVATE KEY`), PKCS#1 (`RSA PRIVATE KEY`) or
    /// SEC1 (`EC PRIVATE KEY`). Additional certificates after the first in
    /// `cert_pem` become the chain. Encrypted keys are not supported; use
    /// PKCS#12 for password-protected identities.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut certs = CapturedX509Certificate::from_pem_multiple(cert_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate PEM: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Certificate("No certificate in PEM input".into()));
        }
        let certificate = certs.remove(0);

        let key_str = std::str::from_utf8(key_pem)
            .map_err(|e| Error::Certificate(format!("Invalid UTF-8 in key PEM: {e}")))?;
        let pkcs8 = pem_key_to_pkcs8(key_str)?;

        Ok(Self::from_parts(certificate, &pkcs8)?.with_chain(certs))
    }

    /// Load credentials from a DER certificate and a DER PKCS#8 key.
    pub fn from_der(cert_der: &[u8], key_der: &[u8]) -> Result<Self> {
        let certificate = CapturedX509Certificate::from_der(cert_der.to_vec())
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate DER: {e}")))?;
        Self::from_parts(certificate, key_der)
    }

    /// Load credentials from a PKCS#12 (.p12) container.
    ///
    /// The first certificate is the signing certificate; any further
    /// certificates become the chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPassword`] when the container fails its MAC
    /// check, and [`Error::Certificate`] when it holds no usable key or
    /// certificate.
    pub fn from_p12(p12_data: &[u8], password: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(p12_data)
            .map_err(|e| Error::Certificate(format!("Failed to parse PKCS#12: {e:?}")))?;

        if !pfx.verify_mac(password) {
            return Err(Error::InvalidPassword);
        }

        let keys = pfx
            .key_bags(password)
            .map_err(|e| Error::Certificate(format!("Failed to extract keys from PKCS#12: {e:?}")))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Certificate(format!("Failed to extract certs from PKCS#12: {e:?}")))?;

        let key_der = keys
            .first()
            .ok_or_else(|| Error::Certificate("No private key in PKCS#12".into()))?;
        let mut certs = certs
            .into_iter()
            .map(|der| {
                CapturedX509Certificate::from_der(der)
                    .map_err(|e| Error::Certificate(format!("Failed to parse certificate DER: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::Certificate("No certificate in PKCS#12".into()));
        }
        let certificate = certs.remove(0);

        Ok(Self::from_parts(certificate, key_der)?.with_chain(certs))
    }

    /// Append intermediate certificates to embed in every signature.
    pub fn with_chain(mut self, chain: Vec<CapturedX509Certificate>) -> Self {
        self.cert_chain.extend(chain);
        self
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    pub fn signing_key(&self) -> &InMemorySigningKeyPair {
        &self.signing_key
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn cert_chain(&self) -> &[CapturedX509Certificate] {
        &self.cert_chain
    }

    /// Apple Team ID from the certificate's Organizational Unit.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Subject common name, e.g. `Apple Development: Jane Doe (ABCDE12345)`.
    pub fn common_name(&self) -> Option<String> {
        self.certificate.subject_common_name()
    }

    /// DER encoding of the leaf certificate.
    pub fn certificate_der(&self) -> &[u8] {
        self.certificate.constructed_data()
    }

    /// Check that the private key belongs to the leaf certificate.
    ///
    /// Signs a probe message into a CMS envelope and verifies the signature
    /// with the certificate's public key.
    pub fn verify_key_pair(&self) -> Result<()> {
        let signer = SignerBuilder::new(&self.signing_key, self.certificate.clone());
        let der = SignedDataBuilder::default()
            .content_external(KEY_PROBE.to_vec())
            .signer(signer)
            .build_der()
            .map_err(|e| Error::Signing(format!("Failed to sign key probe: {e}")))?;

        let signed = SignedData::parse_ber(&der)
            .map_err(|e| Error::Signing(format!("Failed to parse key probe: {e}")))?;
        for signer in signed.signers() {
            signer.verify_signature_with_signed_data(&signed).map_err(|e| {
                debug!("key probe verification failed: {e}");
                Error::SigningKeyMismatch
            })?;
        }
        Ok(())
    }
}

/// Decode any supported PEM private key into PKCS#8 DER.
fn pem_key_to_pkcs8(key_pem: &str) -> Result<Vec<u8>> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(key_pem) {
        return rsa_to_pkcs8(&key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(key_pem) {
        return rsa_to_pkcs8(&key);
    }
    if let Ok(key) = p256::SecretKey::from_pkcs8_pem(key_pem) {
        return ec_to_pkcs8(&key);
    }
    if let Ok(key) = p256::SecretKey::from_sec1_pem(key_pem) {
        return ec_to_pkcs8(&key);
    }
    Err(Error::Certificate(
        "Failed to parse private key as RSA or ECDSA P-256".into(),
    ))
}

fn rsa_to_pkcs8(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    key.to_pkcs8_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| Error::Certificate(format!("Failed to encode RSA key: {e}")))
}

fn ec_to_pkcs8(key: &p256::SecretKey) -> Result<Vec<u8>> {
    key.to_pkcs8_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| Error::Certificate(format!("Failed to encode EC key: {e}")))
}

fn detect_key_kind(pkcs8_der: &[u8]) -> Result<KeyKind> {
    if RsaPrivateKey::from_pkcs8_der(pkcs8_der).is_ok() {
        return Ok(KeyKind::Rsa);
    }
    if p256::SecretKey::from_pkcs8_der(pkcs8_der).is_ok() {
        return Ok(KeyKind::Ecdsa);
    }
    Err(Error::Certificate(
        "Failed to parse private key as RSA or ECDSA P-256".into(),
    ))
}

/// Extracts the Apple Team ID from a certificate's Organizational Unit field.
fn extract_team_id(cert: &X509Certificate) -> Option<String> {
    cert.subject_name()
        .iter_organizational_unit()
        .find_map(|atav| atav.to_string().ok())
}
