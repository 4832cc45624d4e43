//! Code signature structures for iOS/macOS binaries
//!
//! Everything here is pure: builders take bytes and return bytes, leaving
//! placement inside the binary to [`crate::macho::writer`].

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod entitlements;
pub mod requirements;
pub mod superblob;

pub use code_directory::{CodeDirectory, CodeDirectoryBuilder, DigestType, SpecialSlot};
pub use entitlements::Entitlements;
pub use superblob::{SuperBlob, SuperBlobBuilder};
