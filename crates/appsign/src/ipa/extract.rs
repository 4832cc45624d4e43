//! IPA and bundle-directory reading.
//!
//! Loads the `.app` found under `Payload/` into an [`AppBundle`]. Only
//! regular files are kept; directory entries are implied by member paths.

use crate::bundle::AppBundle;
use crate::{Error, Result};
use log::{debug, warn};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::Path;
use walkdir::WalkDir;
use zip::ZipArchive;

fn invalid(message: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// Split `Payload/<name>.app/<rest>` into the bundle name and `rest`.
fn split_payload_path(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("Payload/")?;
    let (app, member) = rest.split_once('/')?;
    app.ends_with(".app").then_some((app, member))
}

/// Read the app bundle out of an IPA file.
///
/// The archive is memory-mapped and members are inflated in parallel. When
/// `Payload/` holds several `.app` directories the first one is used.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read or holds no
/// `Payload/*.app`, and [`Error::Zip`] if it is not a ZIP archive.
pub fn read_ipa(ipa_path: impl AsRef<Path>) -> Result<AppBundle> {
    let ipa_path = ipa_path.as_ref();
    let file = File::open(ipa_path)?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;

    let mut app_name: Option<String> = None;
    let mut members = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() || entry.enclosed_name().is_none() {
            continue;
        }
        let Some((app, member)) = split_payload_path(entry.name()) else {
            continue;
        };
        match &app_name {
            None => app_name = Some(app.to_string()),
            Some(name) if name != app => {
                warn!("ignoring {} outside {name}", entry.name());
                continue;
            }
            Some(_) => {}
        }
        let is_symlink = entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000);
        if is_symlink {
            warn!("skipping symlink {}", entry.name());
            continue;
        }
        members.push((index, member.to_string()));
    }

    let app_name = app_name
        .ok_or_else(|| invalid(format!("no Payload/*.app in {}", ipa_path.display())))?;

    let entries = members
        .into_par_iter()
        .map_init(
            || archive.clone(),
            |archive, (index, member)| -> Result<(String, Vec<u8>)> {
                let mut entry = archive.by_index(index)?;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok((member, data))
            },
        )
        .collect::<Result<BTreeMap<_, _>>>()?;

    debug!("read {} members of {app_name}", entries.len());
    Ok(AppBundle::from_entries(app_name, entries))
}

/// Read an unpacked `.app` directory. Symlinks are skipped.
pub fn read_app_dir(app_path: impl AsRef<Path>) -> Result<AppBundle> {
    let app_path = app_path.as_ref();
    if !app_path.is_dir() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("App bundle not found: {}", app_path.display()),
        )));
    }
    let name = app_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid(format!("invalid bundle path {}", app_path.display())))?;

    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(app_path).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        if entry.file_type().is_symlink() {
            warn!("skipping symlink {}", entry.path().display());
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(app_path)
            .map_err(|_| invalid(format!("{} is outside the bundle", entry.path().display())))?;
        let member = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.insert(member, fs::read(entry.path())?);
    }
    Ok(AppBundle::from_entries(name, entries))
}

/// Validate that a path is a ZIP file.
pub fn validate_ipa(ipa_path: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();
    let mut magic = [0u8; 2];
    File::open(ipa_path)?.read_exact(&mut magic)?;
    if &magic != b"PK" {
        return Err(invalid(format!("{} is not a ZIP/IPA file", ipa_path.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn create_test_ipa(dir: &Path) -> PathBuf {
        let ipa_path = dir.join("test.ipa");
        let mut zip = ZipWriter::new(File::create(&ipa_path).unwrap());
        let options = SimpleFileOptions::default();

        zip.add_directory("Payload/", options).unwrap();
        zip.add_directory("Payload/Test.app/", options).unwrap();
        zip.start_file("Payload/Test.app/Info.plist", options).unwrap();
        zip.write_all(b"<plist/>").unwrap();
        zip.start_file("Payload/Test.app/Test", options).unwrap();
        zip.write_all(b"MACHO_PLACEHOLDER").unwrap();
        zip.start_file("Payload/Test.app/en.lproj/Main.strings", options)
            .unwrap();
        zip.write_all(b"strings").unwrap();
        zip.start_file("iTunesMetadata.plist", options).unwrap();
        zip.write_all(b"metadata").unwrap();
        zip.finish().unwrap();

        ipa_path
    }

    #[test]
    fn test_split_payload_path() {
        assert_eq!(
            split_payload_path("Payload/Test.app/Frameworks/A.framework/A"),
            Some(("Test.app", "Frameworks/A.framework/A"))
        );
        assert_eq!(split_payload_path("Payload/readme.txt"), None);
        assert_eq!(split_payload_path("Payload/Other/file"), None);
    }

    #[test]
    fn test_read_ipa() {
        let temp_dir = TempDir::new().unwrap();
        let bundle = read_ipa(create_test_ipa(temp_dir.path())).unwrap();

        assert_eq!(bundle.name(), "Test.app");
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.get("Test"), Some(b"MACHO_PLACEHOLDER".as_slice()));
        assert!(bundle.contains("en.lproj/Main.strings"));
        assert!(!bundle.contains("iTunesMetadata.plist"));
    }

    #[test]
    fn test_read_ipa_without_payload() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = temp_dir.path().join("empty.ipa");
        let mut zip = ZipWriter::new(File::create(&ipa_path).unwrap());
        zip.start_file("readme.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"nothing here").unwrap();
        zip.finish().unwrap();

        assert!(matches!(read_ipa(&ipa_path), Err(Error::Io(_))));
    }

    #[test]
    fn test_read_app_dir() {
        let temp_dir = TempDir::new().unwrap();
        let app = temp_dir.path().join("Demo.app");
        fs::create_dir_all(app.join("Frameworks/Kit.framework")).unwrap();
        fs::write(app.join("Info.plist"), b"<plist/>").unwrap();
        fs::write(app.join("Frameworks/Kit.framework/Kit"), b"kit").unwrap();

        let bundle = read_app_dir(&app).unwrap();
        assert_eq!(bundle.name(), "Demo.app");
        assert_eq!(bundle.len(), 2);
        assert_eq!(
            bundle.get("Frameworks/Kit.framework/Kit"),
            Some(b"kit".as_slice())
        );
    }

    #[test]
    fn test_validate_ipa() {
        let temp_dir = TempDir::new().unwrap();
        assert!(validate_ipa(create_test_ipa(temp_dir.path())).is_ok());

        let invalid_path = temp_dir.path().join("invalid.ipa");
        fs::write(&invalid_path, b"not a zip file").unwrap();
        assert!(validate_ipa(&invalid_path).is_err());
        assert!(validate_ipa("/nonexistent/file.ipa").is_err());
    }
}
