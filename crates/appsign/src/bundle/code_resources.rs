//! CodeResources generation for iOS app bundle signing
//!
//! Generates the CodeResources plist that holds hashes of every file in a
//! bundle except the main executable and the signature directory. The
//! serialized plist is hashed into the main executable's resource-directory
//! special slot, so any later change to a sealed file breaks the signature.

use super::{AppBundle, BundleDir, CODE_RESOURCES_PATH};
use crate::codesign::code_directory::SpecialSlot;
use crate::macho::parser::BinaryContainer;
use crate::macho::verify::primary_code_directory;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;

/// Digests of one sealed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDigest {
    pub sha1: [u8; 20],
    /// Absent for entries read from the legacy `files` dictionary only.
    pub sha256: Option<[u8; 32]>,
}

impl FileDigest {
    /// Hash data with both algorithms.
    pub fn of(data: &[u8]) -> Self {
        let mut sha1 = [0u8; 20];
        let mut sha256 = [0u8; 32];
        sha1.copy_from_slice(&Sha1::digest(data));
        sha256.copy_from_slice(&Sha256::digest(data));
        Self {
            sha1,
            sha256: Some(sha256),
        }
    }

    fn matches(&self, other: &FileDigest) -> bool {
        self.sha1 == other.sha1
            && match (self.sha256, other.sha256) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Standard exclusion rules for CodeResources
fn standard_rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));
    rules.insert("^.*\\.lproj/".into(), rule(Some(1000.0), false, true));
    rules.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        rule(Some(1100.0), true, false),
    );
    rules.insert("^Base\\.lproj/".into(), rule(Some(1010.0), false, false));
    rules.insert("^version.plist$".into(), Value::Boolean(true));
    rules
}

/// Modern rules2 for CodeResources
fn standard_rules2() -> Dictionary {
    let mut rules2 = Dictionary::new();
    rules2.insert("^.*".into(), Value::Boolean(true));
    rules2.insert(".*\\.dSYM($|/)".into(), rule(Some(11.0), false, false));
    rules2.insert(
        "^(.*/)?\\.DS_Store$".into(),
        rule(Some(2000.0), true, false),
    );
    rules2.insert("^.*\\.lproj/".into(), rule(Some(1000.0), false, true));
    rules2.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        rule(Some(1100.0), true, false),
    );
    rules2.insert("^Base\\.lproj/".into(), rule(Some(1010.0), false, false));
    rules2.insert("^Info\\.plist$".into(), rule(Some(20.0), true, false));
    rules2.insert("^PkgInfo$".into(), rule(Some(20.0), true, false));
    rules2.insert(
        "^embedded\\.provisionprofile$".into(),
        rule(Some(20.0), false, false),
    );
    rules2.insert("^version\\.plist$".into(), rule(Some(20.0), false, false));
    rules2
}

fn rule(weight: Option<f64>, omit: bool, optional: bool) -> Value {
    let mut dict = Dictionary::new();
    if omit {
        dict.insert("omit".into(), Value::Boolean(true));
    }
    if optional {
        dict.insert("optional".into(), Value::Boolean(true));
    }
    if let Some(weight) = weight {
        dict.insert("weight".into(), Value::Real(weight));
    }
    Value::Dictionary(dict)
}

fn is_optional(path: &str) -> bool {
    path.contains(".lproj/")
}

/// Left out of `files2` but kept in `files`.
fn omitted_from_files2(path: &str) -> bool {
    path == "Info.plist" || path == "PkgInfo" || path.ends_with(".DS_Store")
}

/// Manifest of bundle file digests.
///
/// Paths are relative to the bundle directory the seal belongs to. Files of
/// nested bundles are included, so nested bundles must be fully signed
/// before their parent is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSeal {
    main_executable: Option<String>,
    files: BTreeMap<String, FileDigest>,
}

impl ResourceSeal {
    /// Seal `entries`, skipping `_CodeSignature/` and `main_executable`.
    pub fn build<'e>(
        entries: impl IntoIterator<Item = (&'e str, &'e [u8])>,
        main_executable: Option<&str>,
    ) -> Self {
        let candidates: Vec<_> = entries
            .into_iter()
            .filter(|(path, _)| !Self::excluded(path, main_executable))
            .collect();

        let files = candidates
            .par_iter()
            .map(|(path, data)| (path.to_string(), FileDigest::of(data)))
            .collect();

        Self {
            main_executable: main_executable.map(str::to_owned),
            files,
        }
    }

    /// Seal the bundle directory `dir` of `bundle`.
    pub fn for_bundle(bundle: &AppBundle, dir: &BundleDir) -> Self {
        Self::build(bundle.files_under(&dir.root), Some(&dir.info.executable))
    }

    fn excluded(path: &str, main_executable: Option<&str>) -> bool {
        path == "_CodeSignature"
            || path.starts_with("_CodeSignature/")
            || Some(path) == main_executable
    }

    /// Read a serialized CodeResources plist.
    ///
    /// `files2` supplies both digests; entries omitted from it fall back to
    /// the SHA-1 in `files`.
    pub fn from_plist(data: &[u8], main_executable: Option<&str>) -> Result<Self> {
        let value: Value = plist::from_bytes(data)?;
        let root = value
            .as_dictionary()
            .ok_or_else(|| Error::VerificationFailed("CodeResources is not a dictionary".into()))?;

        let mut files = BTreeMap::new();
        if let Some(legacy) = root.get("files").and_then(Value::as_dictionary) {
            for (path, entry) in legacy {
                let hash = match entry {
                    Value::Data(hash) => Some(hash.as_slice()),
                    Value::Dictionary(d) => d.get("hash").and_then(Value::as_data),
                    _ => None,
                };
                if let Some(sha1) = hash.and_then(|h| <[u8; 20]>::try_from(h).ok()) {
                    files.insert(path.clone(), FileDigest { sha1, sha256: None });
                }
            }
        }
        if let Some(modern) = root.get("files2").and_then(Value::as_dictionary) {
            for (path, entry) in modern {
                let Some(d) = entry.as_dictionary() else {
                    continue;
                };
                let sha1 = d
                    .get("hash")
                    .and_then(Value::as_data)
                    .and_then(|h| <[u8; 20]>::try_from(h).ok());
                let sha256 = d
                    .get("hash2")
                    .and_then(Value::as_data)
                    .and_then(|h| <[u8; 32]>::try_from(h).ok());
                if let Some(sha1) = sha1 {
                    files.insert(path.clone(), FileDigest { sha1, sha256 });
                }
            }
        }

        Ok(Self {
            main_executable: main_executable.map(str::to_owned),
            files,
        })
    }

    /// Serialize as an XML CodeResources plist.
    pub fn to_plist(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        let mut files2 = Dictionary::new();
        for (path, digest) in &self.files {
            let optional = is_optional(path);
            let sha1 = Value::Data(digest.sha1.to_vec());

            if optional {
                let mut entry = Dictionary::new();
                entry.insert("hash".into(), sha1.clone());
                entry.insert("optional".into(), Value::Boolean(true));
                files.insert(path.clone(), Value::Dictionary(entry));
            } else {
                files.insert(path.clone(), sha1.clone());
            }

            if omitted_from_files2(path) {
                continue;
            }
            let mut entry = Dictionary::new();
            entry.insert("hash".into(), sha1);
            if let Some(sha256) = digest.sha256 {
                entry.insert("hash2".into(), Value::Data(sha256.to_vec()));
            }
            if optional {
                entry.insert("optional".into(), Value::Boolean(true));
            }
            files2.insert(path.clone(), Value::Dictionary(entry));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(standard_rules()));
        root.insert("rules2".into(), Value::Dictionary(standard_rules2()));

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(root))?;
        Ok(buf)
    }

    /// Recompute the seal over `entries` and report the first difference.
    pub fn verify<'e>(&self, entries: impl IntoIterator<Item = (&'e str, &'e [u8])>) -> Result<()> {
        let current = Self::build(entries, self.main_executable.as_deref());

        for (path, sealed) in &self.files {
            match current.files.get(path) {
                None => {
                    return Err(Error::VerificationFailed(format!(
                        "sealed file {path} is missing"
                    )))
                }
                Some(digest) if !sealed.matches(digest) => {
                    return Err(Error::VerificationFailed(format!("{path} was modified")))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = current.files.keys().find(|p| !self.files.contains_key(*p)) {
            return Err(Error::VerificationFailed(format!(
                "{extra} is not covered by the seal"
            )));
        }
        Ok(())
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileDigest)> {
        self.files.iter().map(|(path, digest)| (path.as_str(), digest))
    }

    pub fn get(&self, path: &str) -> Option<&FileDigest> {
        self.files.get(path)
    }

    /// Number of sealed files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Check the resource seal of bundle directory `dir` against its executable.
///
/// The stored CodeResources must hash to the executable's resource-directory
/// slot, and recomputing the seal over the current files must reproduce it.
pub fn verify_resource_seal(bundle: &AppBundle, dir: &BundleDir) -> Result<()> {
    let executable_path = dir.executable_path();
    let executable = bundle.get(&executable_path).ok_or_else(|| {
        Error::VerificationFailed(format!("executable {executable_path} is missing"))
    })?;
    let container = BinaryContainer::parse(executable)?;
    let slice = container
        .slices()
        .iter()
        .find(|s| s.code_signature_count() > 0)
        .ok_or_else(|| Error::VerificationFailed(format!("{executable_path} is not signed")))?;
    let cd = primary_code_directory(slice)?;

    let seal_path = dir.code_resources_path();
    let stored = bundle
        .get(&seal_path)
        .ok_or_else(|| Error::VerificationFailed(format!("{seal_path} is missing")))?;
    if cd.special_slot(SpecialSlot::ResourceDir) != Some(cd.digest_type.digest(stored).as_slice()) {
        return Err(Error::VerificationFailed(format!(
            "{seal_path} does not match the signature of {executable_path}"
        )));
    }

    let recomputed = ResourceSeal::for_bundle(bundle, dir).to_plist()?;
    if cd.special_slot(SpecialSlot::ResourceDir) != Some(cd.digest_type.digest(&recomputed).as_slice())
    {
        ResourceSeal::from_plist(stored, Some(&dir.info.executable))?
            .verify(bundle.files_under(&dir.root))?;
        return Err(Error::VerificationFailed(format!(
            "{} resources do not match the seal",
            dir.info.identifier
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(&'static str, &'static [u8])> {
        vec![
            ("Info.plist", b"plist".as_slice()),
            ("PkgInfo", b"APPL????".as_slice()),
            ("Demo", b"main binary".as_slice()),
            ("Assets.car", b"assets".as_slice()),
            ("en.lproj/Main.strings", b"strings".as_slice()),
            ("Frameworks/Kit.framework/Kit", b"framework".as_slice()),
            (CODE_RESOURCES_PATH, b"old seal".as_slice()),
        ]
    }

    #[test]
    fn test_excludes_signature_and_main_executable() {
        let seal = ResourceSeal::build(entries(), Some("Demo"));
        assert_eq!(seal.len(), 5);
        assert!(seal.get("Demo").is_none());
        assert!(seal.get(CODE_RESOURCES_PATH).is_none());
        assert!(seal.get("Frameworks/Kit.framework/Kit").is_some());
        assert_eq!(seal.get("Assets.car"), Some(&FileDigest::of(b"assets")));
    }

    #[test]
    fn test_plist_structure() {
        let data = ResourceSeal::build(entries(), Some("Demo")).to_plist().unwrap();
        let value: Value = plist::from_bytes(&data).unwrap();
        let root = value.as_dictionary().unwrap();
        for key in ["files", "files2", "rules", "rules2"] {
            assert!(root.contains_key(key), "missing {key}");
        }

        let files = root.get("files").unwrap().as_dictionary().unwrap();
        assert!(files.contains_key("Info.plist"));
        assert!(files
            .get("en.lproj/Main.strings")
            .unwrap()
            .as_dictionary()
            .is_some());

        let files2 = root.get("files2").unwrap().as_dictionary().unwrap();
        assert!(!files2.contains_key("Info.plist"));
        assert!(!files2.contains_key("PkgInfo"));
        let assets = files2.get("Assets.car").unwrap().as_dictionary().unwrap();
        assert_eq!(
            assets.get("hash2").unwrap().as_data().unwrap().len(),
            32
        );

        let rules2 = root.get("rules2").unwrap().as_dictionary().unwrap();
        assert!(rules2.contains_key("^(.*/)?\\.DS_Store$"));
        assert!(rules2.contains_key("^Info\\.plist$"));
    }

    #[test]
    fn test_plist_is_deterministic() {
        let a = ResourceSeal::build(entries(), Some("Demo")).to_plist().unwrap();
        let mut reversed = entries();
        reversed.reverse();
        let b = ResourceSeal::build(reversed, Some("Demo")).to_plist().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_plist_round_trips_digests() {
        let seal = ResourceSeal::build(entries(), Some("Demo"));
        let parsed = ResourceSeal::from_plist(&seal.to_plist().unwrap(), Some("Demo")).unwrap();
        assert_eq!(parsed.len(), seal.len());
        assert!(parsed.verify(entries()).is_ok());
        assert_eq!(parsed.get("Info.plist").unwrap().sha256, None);
    }

    #[test]
    fn test_verify_reports_modified_file() {
        let seal = ResourceSeal::build(entries(), Some("Demo"));
        let mut tampered = entries();
        tampered[3].1 = b"patched assets".as_slice();
        let err = seal.verify(tampered).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Verification failed: Assets.car was modified"
        );
    }

    #[test]
    fn test_verify_reports_missing_and_extra_files() {
        let seal = ResourceSeal::build(entries(), Some("Demo"));

        let mut fewer = entries();
        fewer.remove(3);
        assert!(seal.verify(fewer).unwrap_err().to_string().contains("missing"));

        let mut more = entries();
        more.push(("extra.txt", b"new".as_slice()));
        assert!(seal
            .verify(more)
            .unwrap_err()
            .to_string()
            .contains("extra.txt is not covered"));
    }
}
