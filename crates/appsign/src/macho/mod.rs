//! Mach-O parsing, rewriting, signing and verification

pub mod parser;
pub mod signer;
pub mod verify;
pub mod writer;

pub use parser::{
    ArchitectureSlice, BinaryContainer, ContainerKind, DylibCommand, DylibKind, Endian,
    LoadCommand, LoadCommandKind, Segment,
};
pub use signer::{MachOSigner, SigningParams};
pub use verify::{verify_signed_binary, VerificationReport};
pub use writer::{inject_dylib, layout_fat_slices, remove_dylib};
