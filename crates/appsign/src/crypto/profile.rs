//! Provisioning profile parsing and validation
//!
//! A `.mobileprovision` file is a CMS `SignedData` whose encapsulated content
//! is an XML plist. Only the payload is consumed; trust evaluation of the
//! profile's own signature is left to the caller.

use super::cert::SigningCredentials;
use crate::codesign::Entitlements;
use crate::settings::{DevicePolicy, SigningSettings};
use crate::{Error, Result};
use cryptographic_message_syntax::SignedData;
use log::{debug, warn};
use plist::{Dictionary, Value};
use std::path::Path;
use std::time::SystemTime;

/// Parsed provisioning profile payload.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    name: Option<String>,
    app_id_name: Option<String>,
    application_identifier: Option<String>,
    team_identifiers: Vec<String>,
    devices: Vec<String>,
    provisions_all_devices: bool,
    entitlements: Dictionary,
    developer_certificates: Vec<Vec<u8>>,
    expiration: Option<SystemTime>,
}

impl ProvisioningProfile {
    /// Read and parse a profile from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Parse a profile from its raw (CMS-wrapped) bytes.
    ///
    /// A bare XML plist is accepted too, which is convenient for tests and
    /// for profiles that were already unwrapped.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let payload = extract_payload(&raw)?;
        let dict: Dictionary = plist::from_bytes(&payload)
            .map_err(|e| Error::ProvisioningProfile(format!("Failed to parse plist: {e}")))?;

        let entitlements = match dict.get("Entitlements") {
            Some(Value::Dictionary(d)) => d.clone(),
            Some(_) => {
                return Err(Error::ProvisioningProfile(
                    "Entitlements is not a dictionary".into(),
                ))
            }
            None => Dictionary::new(),
        };

        let application_identifier = entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
            .map(str::to_owned);

        Ok(Self {
            name: string_value(&dict, "Name"),
            app_id_name: string_value(&dict, "AppIDName"),
            application_identifier,
            team_identifiers: string_array(&dict, "TeamIdentifier"),
            devices: string_array(&dict, "ProvisionedDevices"),
            provisions_all_devices: dict
                .get("ProvisionsAllDevices")
                .and_then(Value::as_boolean)
                .unwrap_or(false),
            developer_certificates: dict
                .get("DeveloperCertificates")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_data).map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            expiration: dict
                .get("ExpirationDate")
                .and_then(Value::as_date)
                .map(SystemTime::from),
            entitlements,
            raw,
        })
    }

    /// The profile bytes as they are embedded in the bundle.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn app_id_name(&self) -> Option<&str> {
        self.app_id_name.as_deref()
    }

    /// `application-identifier` entitlement, e.g. `ABCDE12345.com.example.app`.
    pub fn application_identifier(&self) -> Option<&str> {
        self.application_identifier.as_deref()
    }

    pub fn team_identifiers(&self) -> &[String] {
        &self.team_identifiers
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn provisions_all_devices(&self) -> bool {
        self.provisions_all_devices
    }

    pub fn developer_certificates(&self) -> &[Vec<u8>] {
        &self.developer_certificates
    }

    pub fn expiration(&self) -> Option<SystemTime> {
        self.expiration
    }

    /// Entitlements granted by the profile, in profile order.
    pub fn entitlements(&self) -> Entitlements {
        Entitlements::from_dictionary(self.entitlements.clone())
    }

    /// Entitlements for the executable of `bundle_id`.
    ///
    /// A trailing `*` in `application-identifier` or in a
    /// `keychain-access-groups` entry is replaced by `bundle_id`, keeping the
    /// team prefix.
    pub fn entitlements_for(&self, bundle_id: &str) -> Entitlements {
        let mut dict = self.entitlements.clone();
        if let Some(Value::String(app_id)) = dict.get_mut("application-identifier") {
            if let Some(resolved) = self.resolve_wildcard(app_id, bundle_id) {
                *app_id = resolved;
            }
        }
        if let Some(Value::Array(groups)) = dict.get_mut("keychain-access-groups") {
            for group in groups.iter_mut() {
                if let Value::String(group) = group {
                    if let Some(resolved) = self.resolve_wildcard(group, bundle_id) {
                        *group = resolved;
                    }
                }
            }
        }
        Entitlements::from_dictionary(dict)
    }

    fn resolve_wildcard(&self, value: &str, bundle_id: &str) -> Option<String> {
        value.strip_suffix('*')?;
        match self.split_team_prefix(value) {
            (Some(team), _) => Some(format!("{team}.{bundle_id}")),
            (None, _) => Some(bundle_id.to_string()),
        }
    }

    /// Split `TEAMID.rest` into its team prefix and the rest.
    fn split_team_prefix<'a>(&self, value: &'a str) -> (Option<&'a str>, &'a str) {
        match value.split_once('.') {
            Some((prefix, rest))
                if self.team_identifiers.iter().any(|t| t == prefix)
                    || (prefix.len() == 10
                        && prefix.chars().all(|c| c.is_ascii_alphanumeric())) =>
            {
                (Some(prefix), rest)
            }
            _ => (None, value),
        }
    }

    /// Application identifier with the team prefix removed.
    pub fn bundle_id_pattern(&self) -> Option<&str> {
        let app_id = self.application_identifier.as_deref()?;
        Some(self.split_team_prefix(app_id).1)
    }

    /// True when the profile's application identifier covers `bundle_id`.
    ///
    /// Supports the `*` and `com.example.*` wildcard forms.
    pub fn matches_bundle_identifier(&self, bundle_id: &str) -> bool {
        match self.bundle_id_pattern() {
            Some("*") => true,
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => bundle_id.starts_with(prefix),
                None => pattern == bundle_id,
            },
            None => false,
        }
    }

    /// Check the profile against the bundle and the signing identity.
    ///
    /// Every failure is reported as [`Error::ProfileMismatch`].
    pub fn validate(
        &self,
        bundle_id: &str,
        credentials: &SigningCredentials,
        settings: &SigningSettings,
    ) -> Result<()> {
        if !self.matches_bundle_identifier(bundle_id) {
            return Err(Error::ProfileMismatch(format!(
                "profile application identifier {} does not cover bundle identifier {bundle_id}",
                self.application_identifier.as_deref().unwrap_or("<none>")
            )));
        }

        if let Some(team) = credentials.team_id() {
            if !self.team_identifiers.is_empty() && !self.team_identifiers.iter().any(|t| t == team)
            {
                return Err(Error::ProfileMismatch(format!(
                    "certificate team {team} is not in profile teams {:?}",
                    self.team_identifiers
                )));
            }
        }

        if !self.developer_certificates.is_empty() {
            let leaf = credentials.certificate_der();
            if !self.developer_certificates.iter().any(|c| c == leaf) {
                return Err(Error::ProfileMismatch(
                    "signing certificate is not listed in the profile".into(),
                ));
            }
        }

        self.validate_devices(settings)?;

        if let Some(expiration) = self.expiration {
            if expiration < SystemTime::now() {
                return Err(Error::ProfileMismatch(format!(
                    "profile {} has expired",
                    self.name.as_deref().unwrap_or("<unnamed>")
                )));
            }
        }

        debug!("profile accepted for {bundle_id}");
        Ok(())
    }

    fn validate_devices(&self, settings: &SigningSettings) -> Result<()> {
        let targets = settings.get_target_devices();
        if targets.is_empty() || self.provisions_all_devices {
            return Ok(());
        }

        if self.devices.is_empty() {
            return match settings.get_device_policy() {
                DevicePolicy::EmptyMeansWildcard => {
                    warn!("profile lists no devices; skipping device check");
                    Ok(())
                }
                DevicePolicy::EmptyIsError => Err(Error::ProfileMismatch(
                    "profile lists no provisioned devices".into(),
                )),
            };
        }

        match targets.iter().find(|udid| !self.devices.contains(udid)) {
            Some(udid) => Err(Error::ProfileMismatch(format!(
                "device {udid} is not provisioned by the profile"
            ))),
            None => Ok(()),
        }
    }
}

/// Pull the plist payload out of the CMS envelope.
fn extract_payload(raw: &[u8]) -> Result<Vec<u8>> {
    if let Ok(signed) = SignedData::parse_ber(raw) {
        if let Some(content) = signed.signed_content() {
            return Ok(content.to_vec());
        }
    }

    // Fall back to locating the XML plist between its markers.
    let start = find(raw, b"<?xml")
        .ok_or_else(|| Error::ProvisioningProfile("No plist found in profile".into()))?;
    let end = find(&raw[start..], b"</plist>")
        .map(|p| start + p + b"</plist>".len())
        .ok_or_else(|| Error::ProvisioningProfile("Invalid plist in profile".into()))?;
    Ok(raw[start..end].to_vec())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn string_value(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_owned)
}

fn string_array(dict: &Dictionary, key: &str) -> Vec<String> {
    dict.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_string).map(str::to_owned).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn credentials(team: &str) -> SigningCredentials {
        let (cert, key) = testutil::ecdsa_identity("Apple Development: Test", team);
        SigningCredentials::from_parts(cert, &key).unwrap()
    }

    fn profile(app_id: &str, devices: &[&str]) -> ProvisioningProfile {
        let xml = testutil::profile_plist(app_id, "TEAM000001", devices, None);
        ProvisioningProfile::from_bytes(xml).unwrap()
    }

    #[test]
    fn test_parse_fields() {
        let p = profile("TEAM000001.com.example.app", &["udid-1"]);
        assert_eq!(p.application_identifier(), Some("TEAM000001.com.example.app"));
        assert_eq!(p.team_identifiers(), &["TEAM000001".to_string()]);
        assert_eq!(p.devices(), &["udid-1".to_string()]);
        assert_eq!(p.bundle_id_pattern(), Some("com.example.app"));
        assert!(p.entitlements().get_task_allow());
    }

    #[test]
    fn test_marker_fallback_inside_garbage() {
        let mut raw = b"\x30\x80garbage".to_vec();
        raw.extend(testutil::profile_plist("TEAM000001.*", "TEAM000001", &[], None));
        raw.extend(b"trailing");
        let p = ProvisioningProfile::from_bytes(raw).unwrap();
        assert_eq!(p.bundle_id_pattern(), Some("*"));
    }

    #[test]
    fn test_wildcard_matching() {
        let p = profile("TEAM000001.com.example.*", &[]);
        assert!(p.matches_bundle_identifier("com.example.app"));
        assert!(p.matches_bundle_identifier("com.example.app.widget"));
        assert!(!p.matches_bundle_identifier("org.example.app"));
        assert!(profile("TEAM000001.*", &[]).matches_bundle_identifier("anything"));
    }

    #[test]
    fn test_wildcard_entitlements_resolve_to_bundle_id() {
        let p = profile("TEAM000001.com.example.*", &[]);
        let resolved = p.entitlements_for("com.example.app");
        assert_eq!(
            resolved.application_identifier(),
            Some("TEAM000001.com.example.app")
        );
        let groups: Vec<_> = resolved
            .get("keychain-access-groups")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(Value::as_string)
            .collect();
        assert_eq!(groups, vec!["TEAM000001.com.example.app"]);
        assert!(resolved.get_task_allow());

        let bare = profile("TEAM000001.*", &[]).entitlements_for("org.example.tool");
        assert_eq!(bare.application_identifier(), Some("TEAM000001.org.example.tool"));

        let exact = profile("TEAM000001.com.example.app", &[]).entitlements_for("com.example.app");
        assert_eq!(exact.application_identifier(), Some("TEAM000001.com.example.app"));
        assert_eq!(p.entitlements().application_identifier(), Some("TEAM000001.com.example.*"));
    }

    #[test]
    fn test_bundle_id_mismatch() {
        let p = profile("TEAM000001.com.example.app", &[]);
        let err = p
            .validate("com.example.other", &credentials("TEAM000001"), &SigningSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::ProfileMismatch(_)));
    }

    #[test]
    fn test_team_mismatch() {
        let p = profile("TEAM000001.com.example.app", &[]);
        let err = p
            .validate("com.example.app", &credentials("OTHERTEAM1"), &SigningSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::ProfileMismatch(_)));
    }

    #[test]
    fn test_device_policy() {
        let creds = credentials("TEAM000001");
        let empty = profile("TEAM000001.com.example.app", &[]);
        let targeted = SigningSettings::default().target_device("udid-9");
        assert!(empty.validate("com.example.app", &creds, &targeted).is_ok());

        let strict = targeted.clone().device_policy(DevicePolicy::EmptyIsError);
        assert!(empty.validate("com.example.app", &creds, &strict).is_err());

        let listed = profile("TEAM000001.com.example.app", &["udid-1"]);
        assert!(listed.validate("com.example.app", &creds, &targeted).is_err());
        let ok = SigningSettings::default().target_device("udid-1");
        assert!(listed.validate("com.example.app", &creds, &ok).is_ok());
    }

    #[test]
    fn test_expired_profile() {
        let xml = testutil::profile_plist(
            "TEAM000001.com.example.app",
            "TEAM000001",
            &[],
            Some(SystemTime::UNIX_EPOCH),
        );
        let p = ProvisioningProfile::from_bytes(xml).unwrap();
        assert!(p
            .validate("com.example.app", &credentials("TEAM000001"), &SigningSettings::default())
            .is_err());
    }

    #[test]
    fn test_developer_certificates_must_contain_leaf() {
        let creds = credentials("TEAM000001");
        let mut dict: Dictionary = plist::from_bytes(&testutil::profile_plist(
            "TEAM000001.com.example.app",
            "TEAM000001",
            &[],
            None,
        ))
        .unwrap();
        dict.insert(
            "DeveloperCertificates".into(),
            Value::Array(vec![Value::Data(b"someone else".to_vec())]),
        );
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, &dict).unwrap();
        let p = ProvisioningProfile::from_bytes(xml).unwrap();
        assert!(p
            .validate("com.example.app", &creds, &SigningSettings::default())
            .is_err());
    }
}
