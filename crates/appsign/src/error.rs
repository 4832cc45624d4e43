//! Error types for appsign operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure case
//! of the signing pipeline, from container parsing through bundle
//! orchestration.
//!
//! Each variant maps to a stable string code via [`Error::code`], so front
//! ends can report a category without matching on messages. Failures tied to
//! one binary in a bundle are wrapped in [`Error::Binary`], which carries the
//! bundle-relative path.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use thiserror::Error;

/// Error type for appsign operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
/// Match on variants to handle specific failure cases.
///
/// # Examples
///
/// ```no_run
/// use appsign::{AppSign, Error};
///
/// let result = AppSign::new().sign_ipa("input.ipa", "output.ipa");
/// match result {
///     Ok(report) => println!("Signed {}", report.main_executable),
///     Err(Error::ProfileMismatch(msg)) => eprintln!("Wrong profile: {msg}"),
///     Err(e) => eprintln!("{}: {e}", e.code()),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Occurs when reading input files, writing output files, or accessing
    /// the filesystem during signing operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The binary container could not be decoded.
    ///
    /// Raised for an unknown magic number, a load-command region whose
    /// declared size disagrees with its commands, segments reaching past the
    /// end of the file, or overlapping/misaligned fat slices.
    #[error("Malformed Mach-O container: {0}")]
    MalformedContainer(String),

    /// A recognized but unhandled CPU type.
    ///
    /// Fat slices with such a CPU type are skipped with a warning unless
    /// [`crate::SigningSettings::require_all_architectures`] is set.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The private key does not belong to the signing certificate.
    #[error("Private key does not match the signing certificate")]
    SigningKeyMismatch,

    /// The provisioning profile cannot sign this bundle.
    ///
    /// Covers application identifier, team, certificate, device and
    /// expiry checks performed before any binary is touched.
    #[error("Provisioning profile mismatch: {0}")]
    ProfileMismatch(String),

    /// The signature does not fit the region reserved for it.
    #[error("Signature region overflow: {0}")]
    SignatureRegionOverflow(String),

    /// No free bytes remain between the load commands and the first section.
    #[error("Not enough header space: need {needed} bytes, {available} available")]
    HeaderSpaceExhausted {
        /// Bytes required by the new load command.
        needed: usize,
        /// Bytes left before the first section's file data.
        available: usize,
    },

    /// Code signing operation failed.
    ///
    /// A general signing failure occurred during signature generation
    /// or embedding.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// A signed binary or resource seal did not verify.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Invalid or malformed certificate.
    ///
    /// The provided certificate could not be parsed or is not suitable
    /// for code signing. See [`crate::SigningCredentials`] for valid formats.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Incorrect password for a private key or PKCS#12 file.
    #[error("Invalid password for private key or PKCS#12")]
    InvalidPassword,

    /// Required credentials not configured.
    ///
    /// Signing was attempted without first calling [`crate::AppSign::credentials`].
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// Invalid or malformed provisioning profile.
    #[error("Invalid provisioning profile: {0}")]
    ProvisioningProfile(String),

    /// The bundle's binaries load each other in a cycle.
    #[error("Dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Signing was cancelled through a [`crate::CancellationToken`].
    #[error("Signing cancelled")]
    Cancelled,

    /// Invalid builder configuration.
    ///
    /// A configuration value is invalid or conflicting options were specified.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A failure attributed to one binary of a bundle.
    #[error("{path}: {source}")]
    Binary {
        /// Bundle-relative path of the binary.
        path: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the bundle-relative path of the binary that failed.
    ///
    /// Errors that already carry a path are returned unchanged.
    pub fn in_binary(self, path: impl Into<String>) -> Self {
        match self {
            Error::Binary { .. } => self,
            other => Error::Binary {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// Stable category code, suitable for scripts and exit diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "E_IO",
            Error::MalformedContainer(_) => "E_MALFORMED_CONTAINER",
            Error::UnsupportedArchitecture(_) => "E_UNSUPPORTED_ARCHITECTURE",
            Error::SigningKeyMismatch => "E_SIGNING_KEY_MISMATCH",
            Error::ProfileMismatch(_) => "E_PROFILE_MISMATCH",
            Error::SignatureRegionOverflow(_) => "E_SIGNATURE_REGION_OVERFLOW",
            Error::HeaderSpaceExhausted { .. } => "E_HEADER_SPACE_EXHAUSTED",
            Error::Signing(_) => "E_SIGNING",
            Error::VerificationFailed(_) => "E_VERIFICATION_FAILED",
            Error::Certificate(_) => "E_CERTIFICATE",
            Error::InvalidPassword => "E_INVALID_PASSWORD",
            Error::MissingCredentials(_) => "E_MISSING_CREDENTIALS",
            Error::ProvisioningProfile(_) => "E_PROVISIONING_PROFILE",
            Error::DependencyCycle(_) => "E_DEPENDENCY_CYCLE",
            Error::Cancelled => "E_CANCELLED",
            Error::Config(_) => "E_CONFIG",
            Error::Plist(_) => "E_PLIST",
            Error::Zip(_) => "E_ZIP",
            Error::Binary { source, .. } => source.code(),
        }
    }

    /// Bundle-relative path of the failing binary, when known.
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::Binary { path, .. } => Some(path),
            _ => None,
        }
    }
}
