//! Packaging adapters between the file system and [`AppBundle`].
//!
//! Signing works on an in-memory bundle. This module loads one from an IPA
//! or an unpacked `.app` directory and writes the signed result back out.
//!
//! [`AppBundle`]: crate::bundle::AppBundle

pub mod archive;
pub mod extract;

pub use archive::{write_app_dir, write_ipa, CompressionLevel};
pub use extract::{read_app_dir, read_ipa, validate_ipa};
