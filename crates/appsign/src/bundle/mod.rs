//! App bundle handling for iOS code signing.
//!
//! An [`AppBundle`] is the in-memory form of a `.app` directory: a map from
//! bundle-relative path to file contents. The packaging adapters in
//! [`crate::ipa`] fill it from an IPA or a directory and write it back; the
//! signer only ever substitutes buffers in the map.
//!
//! # Layout
//!
//! | Path | Role |
//! |------|------|
//! | `Info.plist` | `CFBundleIdentifier` and `CFBundleExecutable` |
//! | `<executable>` | main Mach-O, signed last |
//! | `Frameworks/*.framework`, `PlugIns/*.appex` | nested bundles, each with its own `Info.plist` |
//! | `_CodeSignature/CodeResources` | resource seal, see [`ResourceSeal`] |
//! | `embedded.mobileprovision` | provisioning profile |

pub mod code_resources;
pub mod graph;
pub mod signer;

pub use code_resources::{verify_resource_seal, ResourceSeal};
pub use graph::DependencyGraph;
pub use signer::{BundleSigner, SigningReport, SigningState};

use crate::{Error, Result};
use log::info;
use std::collections::BTreeMap;

/// Extensions of directories that form a nested bundle.
const BUNDLE_EXTENSIONS: [&str; 4] = [".app", ".framework", ".appex", ".xctest"];

/// Relative path of the resource seal inside a bundle.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

/// Relative path of the embedded provisioning profile.
pub const EMBEDDED_PROFILE_PATH: &str = "embedded.mobileprovision";

/// Join a bundle root and a path relative to it.
pub(crate) fn join(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}

/// Most architectures a fat header may plausibly declare.
///
/// Java class files share the `0xcafebabe` magic; their version field lands
/// where `nfat_arch` would be and is always larger than this.
const MAX_FAT_ARCHES: u32 = 30;

/// True when `data` starts with a thin Mach-O magic number, or a fat magic
/// followed by a plausible architecture count.
pub fn is_macho(data: &[u8]) -> bool {
    match data.get(..8) {
        Some([0xca, 0xfe, 0xba, 0xbe, n @ ..]) => {
            let nfat_arch = u32::from_be_bytes([n[0], n[1], n[2], n[3]]);
            (1..=MAX_FAT_ARCHES).contains(&nfat_arch)
        }
        _ => matches!(
            data.get(..4),
            Some(
                [0xfe, 0xed, 0xfa, 0xce]
                    | [0xfe, 0xed, 0xfa, 0xcf]
                    | [0xce, 0xfa, 0xed, 0xfe]
                    | [0xcf, 0xfa, 0xed, 0xfe]
            )
        ),
    }
}

/// The two `Info.plist` keys signing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub identifier: String,
    pub executable: String,
}

impl BundleInfo {
    /// Read `CFBundleIdentifier` and `CFBundleExecutable` from XML or binary
    /// plist bytes. `fallback_name` stands in for a missing executable name.
    pub fn parse(data: &[u8], fallback_name: &str) -> Result<Self> {
        let value: plist::Value = plist::from_bytes(data)?;
        let dict = value
            .as_dictionary()
            .ok_or_else(|| Error::Signing("Info.plist is not a dictionary".into()))?;
        let identifier = dict
            .get("CFBundleIdentifier")
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::Signing("Info.plist has no CFBundleIdentifier".into()))?
            .to_string();
        let executable = dict
            .get("CFBundleExecutable")
            .and_then(|v| v.as_string())
            .unwrap_or(fallback_name)
            .to_string();
        Ok(Self {
            identifier,
            executable,
        })
    }
}

/// A bundle directory inside an [`AppBundle`], the main one included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDir {
    /// Path of the directory relative to the app root; empty for the app.
    pub root: String,
    pub info: BundleInfo,
}

impl BundleDir {
    pub fn is_main(&self) -> bool {
        self.root.is_empty()
    }

    pub fn executable_path(&self) -> String {
        join(&self.root, &self.info.executable)
    }

    pub fn info_plist_path(&self) -> String {
        join(&self.root, "Info.plist")
    }

    pub fn code_resources_path(&self) -> String {
        join(&self.root, CODE_RESOURCES_PATH)
    }

    /// True when `path` lies inside this bundle directory.
    pub fn contains(&self, path: &str) -> bool {
        self.is_main() || path.strip_prefix(&self.root).is_some_and(|r| r.starts_with('/'))
    }
}

/// An application bundle held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppBundle {
    name: String,
    entries: BTreeMap<String, Vec<u8>>,
}

impl AppBundle {
    /// Empty bundle whose directory is called `name` (for example `Demo.app`).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(name: impl Into<String>, entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Directory name of the bundle.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, Vec<u8>> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Add or replace a member.
    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(path.into(), data)
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.entries.remove(path)
    }

    /// The app itself, described by the root `Info.plist`.
    pub fn main_bundle(&self) -> Result<BundleDir> {
        let data = self
            .get("Info.plist")
            .ok_or_else(|| Error::Signing(format!("Info.plist not found in {}", self.name)))?;
        let info = BundleInfo::parse(data, bundle_stem(&self.name))?;
        Ok(BundleDir {
            root: String::new(),
            info,
        })
    }

    /// Rewrite the identity keys of the root `Info.plist`.
    ///
    /// `bundle_id` replaces `CFBundleIdentifier`; `bundle_name` replaces
    /// `CFBundleName` and `CFBundleDisplayName`. A binary plist stays binary.
    pub fn update_info_plist(
        &mut self,
        bundle_id: Option<&str>,
        bundle_name: Option<&str>,
    ) -> Result<()> {
        if bundle_id.is_none() && bundle_name.is_none() {
            return Ok(());
        }
        let data = self
            .get("Info.plist")
            .ok_or_else(|| Error::Signing(format!("Info.plist not found in {}", self.name)))?;
        let binary = data.starts_with(b"bplist00");
        let mut dict: plist::Dictionary = plist::from_bytes(data)?;

        if let Some(id) = bundle_id {
            info!("setting bundle identifier to {id}");
            dict.insert("CFBundleIdentifier".into(), id.into());
        }
        if let Some(name) = bundle_name {
            info!("setting bundle name to {name}");
            dict.insert("CFBundleName".into(), name.into());
            dict.insert("CFBundleDisplayName".into(), name.into());
        }

        let mut out = Vec::new();
        if binary {
            plist::to_writer_binary(&mut out, &dict)?;
        } else {
            plist::to_writer_xml(&mut out, &dict)?;
        }
        self.insert("Info.plist", out);
        Ok(())
    }

    /// Every bundle directory, deepest first, the main bundle last.
    ///
    /// A nested bundle is a directory with a bundle extension holding an
    /// `Info.plist`.
    pub fn bundles(&self) -> Result<Vec<BundleDir>> {
        let mut bundles = Vec::new();
        for (path, data) in &self.entries {
            let Some(root) = path.strip_suffix("/Info.plist") else {
                continue;
            };
            let dir_name = root.rsplit('/').next().unwrap_or(root);
            if !BUNDLE_EXTENSIONS.iter().any(|ext| dir_name.ends_with(ext)) {
                continue;
            }
            let info = BundleInfo::parse(data, bundle_stem(dir_name))
                .map_err(|e| e.in_binary(path.clone()))?;
            bundles.push(BundleDir {
                root: root.to_string(),
                info,
            });
        }
        bundles.sort_by_key(|b| std::cmp::Reverse(b.root.matches('/').count()));
        bundles.push(self.main_bundle()?);
        Ok(bundles)
    }

    /// The innermost bundle containing `path`.
    pub fn owning_bundle<'b>(bundles: &'b [BundleDir], path: &str) -> Option<&'b BundleDir> {
        bundles
            .iter()
            .filter(|b| b.contains(path))
            .max_by_key(|b| b.root.len())
    }

    /// Members under `root`, with paths relative to it.
    pub fn files_under<'a>(&'a self, root: &'a str) -> impl Iterator<Item = (&'a str, &'a [u8])> {
        self.entries.iter().filter_map(move |(path, data)| {
            let relative = if root.is_empty() {
                path.as_str()
            } else {
                path.strip_prefix(root)?.strip_prefix('/')?
            };
            Some((relative, data.as_slice()))
        })
    }

    /// Paths of members that carry a Mach-O magic number.
    pub fn macho_paths(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, data)| is_macho(data))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

fn bundle_stem(dir_name: &str) -> &str {
    dir_name.rsplit_once('.').map_or(dir_name, |(stem, _)| stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MachOSpec};

    fn sample() -> AppBundle {
        let mut bundle = AppBundle::new("Demo.app");
        bundle.insert("Info.plist", testutil::info_plist("com.example.demo", "Demo"));
        bundle.insert("Demo", MachOSpec::executable().build());
        bundle.insert("Assets.car", b"assets".to_vec());
        bundle.insert(
            "Frameworks/Kit.framework/Info.plist",
            testutil::info_plist("com.example.kit", "Kit"),
        );
        bundle.insert(
            "Frameworks/Kit.framework/Kit",
            MachOSpec::dylib("@rpath/Kit.framework/Kit").build(),
        );
        bundle
    }

    #[test]
    fn test_main_bundle() {
        let main = sample().main_bundle().unwrap();
        assert!(main.is_main());
        assert_eq!(main.info.identifier, "com.example.demo");
        assert_eq!(main.executable_path(), "Demo");
        assert_eq!(main.code_resources_path(), "_CodeSignature/CodeResources");
    }

    #[test]
    fn test_nested_bundles_deepest_first() {
        let bundles = sample().bundles().unwrap();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].root, "Frameworks/Kit.framework");
        assert_eq!(bundles[0].executable_path(), "Frameworks/Kit.framework/Kit");
        assert!(bundles[1].is_main());

        let owner = AppBundle::owning_bundle(&bundles, "Frameworks/Kit.framework/Kit").unwrap();
        assert_eq!(owner.info.identifier, "com.example.kit");
        let owner = AppBundle::owning_bundle(&bundles, "Assets.car").unwrap();
        assert!(owner.is_main());
        assert!(!bundles[0].contains("Frameworks/Kit.frameworkX/Kit"));
    }

    #[test]
    fn test_macho_detection() {
        let bundle = sample();
        assert_eq!(
            bundle.macho_paths(),
            vec!["Demo".to_string(), "Frameworks/Kit.framework/Kit".to_string()]
        );
        assert!(!is_macho(b"\xca\xfe"));
    }

    #[test]
    fn test_java_class_is_not_fat_macho() {
        // Java 8 class file header: magic, minor 0, major 52.
        let class = b"\xca\xfe\xba\xbe\x00\x00\x00\x34\x00\x1d".to_vec();
        assert!(!is_macho(&class));
        assert!(!is_macho(b"\xca\xfe\xba\xbe\x00\x00\x00\x00"));
        assert!(is_macho(&testutil::fat(&[(
            testutil::CPU_TYPE_ARM64,
            0,
            MachOSpec::executable().build()
        )])));

        let mut bundle = sample();
        bundle.insert("Resources/Helper.class", class);
        assert_eq!(bundle.macho_paths().len(), 2);
    }

    #[test]
    fn test_files_under() {
        let bundle = sample();
        let nested: Vec<_> = bundle
            .files_under("Frameworks/Kit.framework")
            .map(|(p, _)| p)
            .collect();
        assert_eq!(nested, vec!["Info.plist", "Kit"]);
        assert_eq!(bundle.files_under("").count(), bundle.len());
    }

    #[test]
    fn test_update_info_plist() {
        let mut bundle = sample();
        bundle
            .update_info_plist(Some("com.example.renamed"), Some("Renamed"))
            .unwrap();
        let dict: plist::Dictionary = plist::from_bytes(bundle.get("Info.plist").unwrap()).unwrap();
        assert_eq!(
            dict.get("CFBundleIdentifier").and_then(|v| v.as_string()),
            Some("com.example.renamed")
        );
        assert_eq!(dict.get("CFBundleName").and_then(|v| v.as_string()), Some("Renamed"));
        assert_eq!(
            dict.get("CFBundleDisplayName").and_then(|v| v.as_string()),
            Some("Renamed")
        );
        assert_eq!(
            dict.get("CFBundleExecutable").and_then(|v| v.as_string()),
            Some("Demo")
        );
        assert_eq!(
            bundle.get("Frameworks/Kit.framework/Info.plist"),
            sample().get("Frameworks/Kit.framework/Info.plist")
        );
    }

    #[test]
    fn test_update_info_plist_keeps_binary_format() {
        let mut bundle = sample();
        let dict: plist::Dictionary = plist::from_bytes(bundle.get("Info.plist").unwrap()).unwrap();
        let mut binary = Vec::new();
        plist::to_writer_binary(&mut binary, &dict).unwrap();
        bundle.insert("Info.plist", binary);

        bundle.update_info_plist(None, Some("Renamed")).unwrap();
        assert!(bundle.get("Info.plist").unwrap().starts_with(b"bplist00"));
        assert_eq!(bundle.main_bundle().unwrap().info.identifier, "com.example.demo");

        let unchanged = bundle.clone();
        bundle.update_info_plist(None, None).unwrap();
        assert_eq!(bundle, unchanged);
    }

    #[test]
    fn test_missing_info_plist() {
        let bundle = AppBundle::new("Empty.app");
        assert!(matches!(bundle.main_bundle(), Err(Error::Signing(_))));
    }
}
