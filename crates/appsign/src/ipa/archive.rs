//! IPA and bundle-directory writing.
//!
//! Outputs are staged next to their destination and moved into place once
//! complete, so a failed run never leaves a partial file behind.
//!
//! # Examples
//!
//! ```no_run
//! use appsign::ipa::{read_ipa, write_ipa, CompressionLevel};
//!
//! let bundle = read_ipa("input.ipa")?;
//! write_ipa(&bundle, "output.ipa", CompressionLevel::DEFAULT)?;
//! # Ok::<(), appsign::Error>(())
//! ```

use crate::bundle::{is_macho, AppBundle};
use crate::{Error, Result};
use log::debug;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// ZIP compression level for IPA creation.
///
/// ```
/// use appsign::ipa::CompressionLevel;
///
/// assert_eq!(CompressionLevel::new(3).level(), 3);
/// assert_eq!(CompressionLevel::new(12).level(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// Stored entries, no deflate.
    pub const NONE: CompressionLevel = CompressionLevel(0);

    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Values greater than 9 are clamped to 9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn file_options(&self) -> SimpleFileOptions {
        if self.0 == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.0)))
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Every directory that must exist for the members of `bundle`.
fn directories(bundle: &AppBundle) -> BTreeSet<&str> {
    let mut dirs = BTreeSet::new();
    for path in bundle.entries().keys() {
        let mut rest = path.as_str();
        while let Some((dir, _)) = rest.rsplit_once('/') {
            if !dirs.insert(dir) {
                break;
            }
            rest = dir;
        }
    }
    dirs
}

fn file_mode(data: &[u8]) -> u32 {
    if is_macho(data) {
        0o755
    } else {
        0o644
    }
}

/// Write `bundle` as an IPA with the `Payload/<name>/` layout.
///
/// Mach-O members get mode 0755, everything else 0644.
///
/// # Errors
///
/// Returns [`Error::Io`] if the output cannot be created or moved into
/// place, and [`Error::Zip`] if the archive cannot be written.
pub fn write_ipa(
    bundle: &AppBundle,
    output_path: impl AsRef<Path>,
    compression_level: CompressionLevel,
) -> Result<()> {
    let output_path = output_path.as_ref();
    let parent = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    {
        let mut zip = ZipWriter::new(staged.as_file_mut());
        let options = compression_level.file_options();
        let root = format!("Payload/{}", bundle.name());

        zip.add_directory("Payload/", options)?;
        zip.add_directory(format!("{root}/"), options)?;
        for dir in directories(bundle) {
            zip.add_directory(format!("{root}/{dir}/"), options)?;
        }
        for (path, data) in bundle.entries() {
            zip.start_file(
                format!("{root}/{path}"),
                options.unix_permissions(file_mode(data)),
            )?;
            zip.write_all(data)?;
        }
        zip.finish()?;
    }

    staged.persist(output_path).map_err(|e| Error::Io(e.error))?;
    debug!("wrote {} members to {}", bundle.len(), output_path.display());
    Ok(())
}

/// Write `bundle` as a directory at `output_path`.
///
/// # Errors
///
/// Returns [`Error::Io`] if `output_path` already exists or any member
/// cannot be written.
pub fn write_app_dir(bundle: &AppBundle, output_path: impl AsRef<Path>) -> Result<()> {
    let output_path = output_path.as_ref();
    if output_path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", output_path.display()),
        )));
    }
    let parent = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let staged = tempfile::Builder::new()
        .prefix(".appsign-")
        .tempdir_in(parent)?;
    for dir in directories(bundle) {
        fs::create_dir_all(staged.path().join(dir))?;
    }
    for (path, data) in bundle.entries() {
        let target = staged.path().join(path);
        fs::write(&target, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(file_mode(data)))?;
        }
    }

    fs::rename(staged.path(), output_path)?;
    debug!("wrote {} members to {}", bundle.len(), output_path.display());
    Ok(())
}
