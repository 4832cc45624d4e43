//! Signing identity, provisioning profiles and CMS envelopes

pub mod cert;
pub mod cms;
pub mod profile;

pub use cert::{KeyKind, SigningCredentials};
pub use cms::{CdHash, SignatureEnvelopeBuilder};
pub use profile::ProvisioningProfile;
