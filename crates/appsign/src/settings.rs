//! Signing configuration
//!
//! [`SigningSettings`] holds the knobs that do not come from the
//! certificate or profile. [`SigningContext`] bundles them with the
//! credentials and profile for one top-level signing request; it is shared
//! read-only (behind an `Arc`) by every worker.

use crate::codesign::DigestType;
use crate::crypto::{ProvisioningProfile, SigningCredentials};
use crate::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How an empty `ProvisionedDevices` list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePolicy {
    /// Treat the profile as enterprise/wildcard and skip the device check.
    #[default]
    EmptyMeansWildcard,
    /// Reject requested target devices when the profile lists none.
    EmptyIsError,
}

/// Cooperative cancellation flag.
///
/// Checked between dependency units and between architecture slices. A
/// slice rewrite already in progress always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Signing options independent of identity.
///
/// # Examples
///
/// ```
/// use appsign::{DevicePolicy, SigningSettings};
///
/// let settings = SigningSettings::default()
///     .device_policy(DevicePolicy::EmptyIsError)
///     .target_device("00008030-001A2B3C4D5E6F70")
///     .workers(4);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SigningSettings {
    pub(crate) digests: Vec<DigestType>,
    pub(crate) page_size: usize,
    pub(crate) device_policy: DevicePolicy,
    pub(crate) target_devices: Vec<String>,
    pub(crate) require_all_architectures: bool,
    pub(crate) workers: usize,
    pub(crate) cancellation: CancellationToken,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            digests: vec![DigestType::Sha1, DigestType::Sha256],
            page_size: crate::codesign::constants::PAGE_SIZE,
            device_policy: DevicePolicy::default(),
            target_devices: Vec::new(),
            require_all_architectures: false,
            workers: 0,
            cancellation: CancellationToken::default(),
        }
    }
}

impl SigningSettings {
    /// CodeDirectory algorithms; the first one fills the primary slot.
    pub fn digests(mut self, digests: Vec<DigestType>) -> Self {
        self.digests = digests;
        self
    }

    /// Code page size, a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn device_policy(mut self, policy: DevicePolicy) -> Self {
        self.device_policy = policy;
        self
    }

    /// Add a device UDID the signed app must run on.
    pub fn target_device(mut self, udid: impl Into<String>) -> Self {
        self.target_devices.push(udid.into());
        self
    }

    /// Fail instead of skipping fat slices with an unsupported CPU type.
    pub fn require_all_architectures(mut self, require: bool) -> Self {
        self.require_all_architectures = require;
        self
    }

    /// Worker threads for dependency signing; 0 uses one per core.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn get_digests(&self) -> &[DigestType] {
        &self.digests
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_device_policy(&self) -> DevicePolicy {
        self.device_policy
    }

    pub fn get_target_devices(&self) -> &[String] {
        &self.target_devices
    }

    pub fn get_require_all_architectures(&self) -> bool {
        self.require_all_architectures
    }

    pub fn get_workers(&self) -> usize {
        self.workers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.digests.is_empty() {
            return Err(Error::Config("at least one digest is required".into()));
        }
        for (i, digest) in self.digests.iter().enumerate() {
            if self.digests[..i].contains(digest) {
                return Err(Error::Config(format!("digest {digest:?} listed twice")));
            }
        }
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(Error::Config(format!(
                "page size {} is not a power of two of at least 512",
                self.page_size
            )));
        }
        Ok(())
    }
}

/// A dynamic library to link into the main executable.
#[derive(Debug, Clone)]
pub struct DylibInjection {
    /// File name placed at the bundle root.
    pub name: String,
    /// Library contents.
    pub bytes: Vec<u8>,
    /// Link with `LC_LOAD_WEAK_DYLIB` instead of `LC_LOAD_DYLIB`.
    pub weak: bool,
}

impl DylibInjection {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, weak: bool) -> Self {
        Self {
            name: name.into(),
            bytes,
            weak,
        }
    }

    /// Read a dylib from disk; the file name becomes its bundle path.
    pub fn from_path(path: impl AsRef<Path>, weak: bool) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("invalid dylib path {}", path.display())))?;
        Ok(Self::new(name, std::fs::read(path)?, weak))
    }

    /// Bundle-relative path of the injected file.
    pub fn bundle_path(&self) -> &str {
        &self.name
    }

    /// Install name recorded in the load command.
    pub fn install_name(&self) -> String {
        format!("@executable_path/{}", self.name)
    }
}

/// Everything one bundle signing run needs.
#[derive(Debug)]
pub struct SigningContext {
    pub credentials: Arc<SigningCredentials>,
    pub profile: Option<ProvisioningProfile>,
    pub injection: Option<DylibInjection>,
    pub settings: SigningSettings,
    /// Replacement `CFBundleIdentifier` for the main bundle.
    pub bundle_id: Option<String>,
    /// Replacement `CFBundleName` and `CFBundleDisplayName`.
    pub bundle_name: Option<String>,
}

impl SigningContext {
    pub fn new(credentials: impl Into<Arc<SigningCredentials>>) -> Self {
        Self {
            credentials: credentials.into(),
            profile: None,
            injection: None,
            settings: SigningSettings::default(),
            bundle_id: None,
            bundle_name: None,
        }
    }

    pub fn with_profile(mut self, profile: ProvisioningProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_injection(mut self, injection: DylibInjection) -> Self {
        self.injection = Some(injection);
        self
    }

    pub fn with_settings(mut self, settings: SigningSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_bundle_name(mut self, bundle_name: impl Into<String>) -> Self {
        self.bundle_name = Some(bundle_name.into());
        self
    }

    /// True when the injected dylib is weak-linked.
    pub fn weak_link(&self) -> bool {
        self.injection.as_ref().map(|i| i.weak).unwrap_or(false)
    }

    /// Team identifier from the certificate, falling back to the profile.
    pub fn team_id(&self) -> Option<String> {
        self.credentials.team_id().map(str::to_owned).or_else(|| {
            self.profile
                .as_ref()
                .and_then(|p| p.team_identifiers().first().cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SigningSettings::default();
        assert_eq!(settings.get_digests(), &[DigestType::Sha1, DigestType::Sha256]);
        assert_eq!(settings.get_page_size(), 4096);
        assert_eq!(settings.get_device_policy(), DevicePolicy::EmptyMeansWildcard);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let settings = SigningSettings::default().page_size(3000);
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_digest() {
        let settings =
            SigningSettings::default().digests(vec![DigestType::Sha256, DigestType::Sha256]);
        assert!(settings.validate().is_err());
        assert!(SigningSettings::default().digests(vec![]).validate().is_err());
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_injection_install_name() {
        let inj = DylibInjection::new("libhook.dylib", vec![], true);
        assert_eq!(inj.install_name(), "@executable_path/libhook.dylib");
        assert_eq!(inj.bundle_path(), "libhook.dylib");
    }
}
