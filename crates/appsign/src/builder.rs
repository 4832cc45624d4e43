//! AppSign builder API
//!
//! Collects credential paths, a provisioning profile and signing options,
//! then signs a Mach-O file, an IPA or an unpacked `.app` directory.

use crate::bundle::{AppBundle, BundleSigner, SigningReport};
use crate::codesign::Entitlements;
use crate::crypto::{ProvisioningProfile, SigningCredentials};
use crate::ipa::{self, CompressionLevel};
use crate::macho::{MachOSigner, SigningParams};
use crate::settings::{DylibInjection, SigningContext, SigningSettings};
use crate::{Error, Result};
use log::info;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// iOS code signing with a builder pattern API.
///
/// # Example
///
/// ```no_run
/// use appsign::AppSign;
///
/// let report = AppSign::new()
///     .pkcs12("certificate.p12")
///     .password("secret")
///     .provisioning_profile("profile.mobileprovision")
///     .sign_ipa("input.ipa", "output.ipa")?;
/// println!("signed {}", report.bundle_identifier);
/// # Ok::<(), appsign::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct AppSign {
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    pkcs12: Option<PathBuf>,
    provisioning_profile: Option<PathBuf>,
    password: Option<SecretString>,
    dylib: Option<(PathBuf, bool)>,
    bundle_id: Option<String>,
    bundle_name: Option<String>,
    settings: SigningSettings,
    compression_level: CompressionLevel,
    credentials: Option<Arc<SigningCredentials>>,
}

impl AppSign {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set certificate file path (PEM or DER format).
    ///
    /// Use together with `private_key()`. Alternatively, use `pkcs12()` for
    /// PKCS#12 files that contain both.
    pub fn certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.certificate = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set private key file path (PEM or DER PKCS#8). The key must not be
    /// encrypted.
    pub fn private_key(mut self, path: impl AsRef<Path>) -> Self {
        self.private_key = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set PKCS#12 file path (.p12 format).
    pub fn pkcs12(mut self, path: impl AsRef<Path>) -> Self {
        self.pkcs12 = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set password for the PKCS#12 file.
    ///
    /// The password is stored securely and will be zeroized when dropped.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Set provisioning profile path (.mobileprovision format).
    ///
    /// The profile is checked against the bundle, embedded as
    /// `embedded.mobileprovision` and supplies the entitlements.
    pub fn provisioning_profile(mut self, path: impl AsRef<Path>) -> Self {
        self.provisioning_profile = Some(path.as_ref().to_path_buf());
        self
    }

    /// Copy a dylib into the bundle root and link the main executable to it.
    pub fn inject_dylib(mut self, path: impl AsRef<Path>, weak: bool) -> Self {
        self.dylib = Some((path.as_ref().to_path_buf(), weak));
        self
    }

    /// Replace the app's `CFBundleIdentifier` before signing.
    ///
    /// The new identifier is what the provisioning profile is checked
    /// against and what the main executable is signed as.
    pub fn bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    /// Replace the app's `CFBundleName` and `CFBundleDisplayName`.
    pub fn bundle_name(mut self, bundle_name: impl Into<String>) -> Self {
        self.bundle_name = Some(bundle_name.into());
        self
    }

    pub fn settings(mut self, settings: SigningSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set ZIP compression level for IPA output (0-9).
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = CompressionLevel::new(level);
        self
    }

    /// Use already loaded credentials instead of credential files.
    pub fn credentials(mut self, credentials: impl Into<Arc<SigningCredentials>>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if:
    /// - Both PKCS#12 and PEM credentials are specified
    /// - Neither PKCS#12 nor PEM credentials are specified
    /// - Only one of certificate/private_key is specified (need both)
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_some() {
            return Ok(());
        }
        let has_p12 = self.pkcs12.is_some();
        let has_pem = self.certificate.is_some() || self.private_key.is_some();

        if has_p12 && has_pem {
            return Err(Error::Config(
                "Cannot specify both PKCS#12 and PEM certificate/key".into(),
            ));
        }

        if !has_p12 && !has_pem {
            return Err(Error::MissingCredentials(
                "Must specify either PKCS#12 or certificate/key pair".into(),
            ));
        }

        if has_pem && (self.certificate.is_none() || self.private_key.is_none()) {
            return Err(Error::MissingCredentials(
                "Both certificate and private key must be specified".into(),
            ));
        }

        Ok(())
    }

    fn load_credentials(&self) -> Result<Arc<SigningCredentials>> {
        self.validate()?;
        if let Some(credentials) = &self.credentials {
            return Ok(Arc::clone(credentials));
        }

        if let Some(p12) = &self.pkcs12 {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().as_str())
                .unwrap_or("");
            return SigningCredentials::from_p12(&fs::read(p12)?, password).map(Arc::new);
        }

        let (Some(cert), Some(key)) = (&self.certificate, &self.private_key) else {
            return Err(Error::MissingCredentials(
                "Both certificate and private key must be specified".into(),
            ));
        };
        let cert = fs::read(cert)?;
        let key = fs::read(key)?;
        let credentials = if cert.starts_with(b"-----BEGIN") {
            SigningCredentials::from_pem(&cert, &key)?
        } else {
            SigningCredentials::from_der(&cert, &key)?
        };
        Ok(Arc::new(credentials))
    }

    /// Load every configured input into a shared signing context.
    pub fn context(&self) -> Result<SigningContext> {
        let mut context =
            SigningContext::new(self.load_credentials()?).with_settings(self.settings.clone());
        if let Some(profile) = &self.provisioning_profile {
            context = context.with_profile(ProvisioningProfile::open(profile)?);
        }
        if let Some((path, weak)) = &self.dylib {
            context = context.with_injection(DylibInjection::from_path(path, *weak)?);
        }
        if let Some(bundle_id) = &self.bundle_id {
            context = context.with_bundle_id(bundle_id.clone());
        }
        if let Some(bundle_name) = &self.bundle_name {
            context = context.with_bundle_name(bundle_name.clone());
        }
        Ok(context)
    }

    /// Sign an in-memory bundle and return the signed copy with its report.
    pub fn sign_bundle(&self, bundle: &AppBundle) -> Result<(AppBundle, SigningReport)> {
        let mut signer = BundleSigner::new(Arc::new(self.context()?));
        let signed = signer.sign(bundle)?;
        Ok((signed, signer.into_report()))
    }

    /// Sign an IPA file.
    ///
    /// # Errors
    ///
    /// Returns an error if the IPA cannot be read, any binary fails to sign
    /// or the output cannot be written. The output path is left untouched
    /// on failure.
    pub fn sign_ipa(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<SigningReport> {
        self.validate()?;
        ipa::validate_ipa(input.as_ref())?;
        let bundle = ipa::read_ipa(input)?;
        let (signed, report) = self.sign_bundle(&bundle)?;
        ipa::write_ipa(&signed, output.as_ref(), self.compression_level)?;
        info!("wrote {}", output.as_ref().display());
        Ok(report)
    }

    /// Sign an unpacked `.app` directory into a new directory.
    pub fn sign_app_dir(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<SigningReport> {
        self.validate()?;
        let bundle = ipa::read_app_dir(input)?;
        let (signed, report) = self.sign_bundle(&bundle)?;
        ipa::write_app_dir(&signed, output.as_ref())?;
        info!("wrote {}", output.as_ref().display());
        Ok(report)
    }

    /// Sign a single Mach-O binary.
    ///
    /// The identifier is the file name without extension. Executables get
    /// the profile's entitlements; no bundle checks are made against the
    /// profile.
    pub fn sign_macho(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        let input = input.as_ref();
        let context = self.context()?;
        context.settings.validate()?;
        context.credentials.verify_key_pair()?;

        let data = fs::read(input)?;
        let container = crate::macho::BinaryContainer::parse(&data)?;
        let identifier = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");

        let executable = container.slices().iter().any(|s| s.is_executable());
        let entitlements = match &context.profile {
            Some(profile) if executable => profile.entitlements_for(identifier),
            _ => Entitlements::new(),
        };
        let team_id = context.team_id();
        let params = SigningParams {
            identifier,
            team_id: team_id.as_deref(),
            info_plist: None,
            code_resources: None,
            entitlements: &entitlements,
        };

        let signed = MachOSigner::new(&context.credentials, &context.settings)
            .sign_container(&container, &params)?
            .to_bytes()?;
        write_atomically(output.as_ref(), &signed)
    }
}

/// Replace `path` with `data` in one rename.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o755))?;
    }
    staged.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
