pub mod builder;
pub mod bundle;
pub mod codesign;
pub mod crypto;
pub mod error;
pub mod ipa;
pub mod macho;
pub mod settings;

#[cfg(test)]
pub(crate) mod testutil;

pub use builder::AppSign;
pub use bundle::{AppBundle, BundleSigner, ResourceSeal, SigningReport, SigningState};
pub use crypto::{ProvisioningProfile, SigningCredentials};
pub use error::Error;
pub use ipa::{read_app_dir, read_ipa, validate_ipa, write_app_dir, write_ipa, CompressionLevel};
pub use macho::{verify_signed_binary, VerificationReport};
pub use settings::{
    CancellationToken, DevicePolicy, DylibInjection, SigningContext, SigningSettings,
};

pub type Result<T> = std::result::Result<T, Error>;
