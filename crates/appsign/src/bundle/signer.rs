//! Bundle signing orchestrator
//!
//! Runs one signing request through
//! `Validating → SigningDependencies → SigningMainExecutable →
//! SealingResources → Done`, or into `Failed` from any of them.
//!
//! Work happens on a copy of the input bundle. Nothing is returned unless
//! every binary was signed, so a failure never leaves a half-signed bundle
//! behind.

use super::graph::DependencyGraph;
use super::{is_macho, AppBundle, BundleDir, ResourceSeal, EMBEDDED_PROFILE_PATH};
use crate::codesign::Entitlements;
use crate::macho::parser::BinaryContainer;
use crate::macho::signer::{MachOSigner, SigningParams};
use crate::macho::writer::inject_dylib;
use crate::settings::SigningContext;
use crate::{Error, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Orchestrator states, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningState {
    Validating,
    SigningDependencies,
    SigningMainExecutable,
    SealingResources,
    Done,
    Failed,
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningReport {
    /// Every state entered, in order.
    pub states: Vec<SigningState>,
    /// Bundle-relative paths signed before the main executable, in signing order.
    pub signed_dependencies: Vec<String>,
    /// Bundle-relative path of the main executable.
    pub main_executable: String,
    pub bundle_identifier: String,
}

impl SigningReport {
    /// Last state entered.
    pub fn state(&self) -> Option<SigningState> {
        self.states.last().copied()
    }
}

/// Signs whole bundles with one [`SigningContext`].
pub struct BundleSigner {
    context: Arc<SigningContext>,
    report: SigningReport,
}

impl BundleSigner {
    pub fn new(context: Arc<SigningContext>) -> Self {
        Self {
            context,
            report: SigningReport::default(),
        }
    }

    pub fn context(&self) -> &SigningContext {
        &self.context
    }

    /// Report of the latest run, also after a failure.
    pub fn report(&self) -> &SigningReport {
        &self.report
    }

    pub fn into_report(self) -> SigningReport {
        self.report
    }

    /// Sign every Mach-O member of `bundle` and return the signed copy.
    pub fn sign(&mut self, bundle: &AppBundle) -> Result<AppBundle> {
        self.report = SigningReport::default();
        match self.run(bundle) {
            Ok(signed) => {
                self.enter(SigningState::Done);
                info!(
                    "signed {} ({} dependencies)",
                    self.report.bundle_identifier,
                    self.report.signed_dependencies.len()
                );
                Ok(signed)
            }
            Err(e) => {
                warn!("signing {} failed in {:?}: {e}", bundle.name(), self.report.state());
                self.enter(SigningState::Failed);
                Err(e)
            }
        }
    }

    fn enter(&mut self, state: SigningState) {
        debug!("entering {state:?}");
        self.report.states.push(state);
    }

    fn run(&mut self, input: &AppBundle) -> Result<AppBundle> {
        let context = Arc::clone(&self.context);
        let settings = &context.settings;

        self.enter(SigningState::Validating);
        settings.validate()?;
        context.credentials.verify_key_pair()?;
        let mut bundle = input.clone();
        bundle.update_info_plist(context.bundle_id.as_deref(), context.bundle_name.as_deref())?;
        let main = bundle.main_bundle()?;
        if let Some(profile) = &context.profile {
            profile.validate(&main.info.identifier, &context.credentials, settings)?;
        }
        let main_executable = main.executable_path();
        if !bundle.contains(&main_executable) {
            return Err(Error::Signing(format!(
                "main executable {main_executable} not found in {}",
                input.name()
            )));
        }
        self.report.main_executable = main_executable.clone();
        self.report.bundle_identifier = main.info.identifier.clone();

        self.enter(SigningState::SigningDependencies);
        if let Some(injection) = &context.injection {
            bundle.insert(injection.bundle_path(), injection.bytes.clone());
        }
        let bundles = bundle.bundles()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.get_workers())
            .build()
            .map_err(|e| Error::Signing(format!("failed to start worker pool: {e}")))?;

        let mut binaries = pool.install(|| parse_binaries(&bundle))?;
        let graph = DependencyGraph::build(&bundle, &bundles, &binaries, &main_executable);
        let levels = graph.levels()?;

        let team_id = context.team_id();

        for level in &levels {
            settings.cancellation().check()?;
            let units = {
                let worker = UnitSigner {
                    context: &context,
                    bundle: &bundle,
                    bundles: &bundles,
                    team_id: team_id.as_deref(),
                };
                pool.install(|| {
                    level
                        .par_iter()
                        .map(|path| {
                            worker
                                .sign(path, &binaries[path])
                                .map_err(|e| e.in_binary(path.clone()))
                        })
                        .collect::<Result<Vec<_>>>()
                })?
            };
            for unit in units {
                if let Some((seal_path, seal)) = unit.seal {
                    bundle.insert(seal_path, seal);
                }
                bundle.insert(unit.path.clone(), unit.data);
                self.report.signed_dependencies.push(unit.path);
            }
        }

        self.enter(SigningState::SigningMainExecutable);
        settings.cancellation().check()?;
        let mut container = binaries
            .remove(&main_executable)
            .ok_or_else(|| Error::MalformedContainer(format!("{main_executable} is not Mach-O")))?;
        if let Some(injection) = &context.injection {
            let install_name = injection.install_name();
            for index in 0..container.slices().len() {
                let slice = &container.slices()[index];
                if !slice.is_supported() {
                    continue;
                }
                let injected = inject_dylib(slice, &install_name, injection.weak)
                    .map_err(|e| e.in_binary(main_executable.clone()))?;
                container.replace_slice(index, injected);
            }
            if !self
                .report
                .signed_dependencies
                .iter()
                .any(|p| p == injection.bundle_path())
            {
                return Err(Error::Signing(format!(
                    "injected {} was not signed",
                    injection.bundle_path()
                ))
                .in_binary(main_executable));
            }
        }
        if let Some(profile) = &context.profile {
            bundle.insert(EMBEDDED_PROFILE_PATH, profile.raw().to_vec());
        }

        self.enter(SigningState::SealingResources);
        let seal = ResourceSeal::for_bundle(&bundle, &main).to_plist()?;
        bundle.insert(main.code_resources_path(), seal.clone());

        let entitlements = context
            .profile
            .as_ref()
            .map(|p| p.entitlements_for(&main.info.identifier))
            .unwrap_or_default();
        let params = SigningParams {
            identifier: &main.info.identifier,
            team_id: team_id.as_deref(),
            info_plist: bundle.get(&main.info_plist_path()),
            code_resources: Some(&seal),
            entitlements: &entitlements,
        };
        let signed = MachOSigner::new(&context.credentials, settings)
            .sign_container(&container, &params)
            .and_then(|c| c.to_bytes())
            .map_err(|e| e.in_binary(main_executable.clone()))?;
        bundle.insert(main_executable, signed);

        Ok(bundle)
    }
}

fn parse_binaries(bundle: &AppBundle) -> Result<BTreeMap<String, BinaryContainer>> {
    bundle
        .entries()
        .par_iter()
        .filter(|(_, data)| is_macho(data))
        .map(|(path, data)| {
            BinaryContainer::parse(data)
                .map(|container| (path.clone(), container))
                .map_err(|e| e.in_binary(path.clone()))
        })
        .collect()
}

/// Output of signing one dependency.
struct SignedUnit {
    path: String,
    data: Vec<u8>,
    /// New `_CodeSignature/CodeResources` when the unit is a nested bundle's executable.
    seal: Option<(String, Vec<u8>)>,
}

/// Signs dependencies of one level; shared read-only by the workers.
struct UnitSigner<'a> {
    context: &'a SigningContext,
    bundle: &'a AppBundle,
    bundles: &'a [BundleDir],
    team_id: Option<&'a str>,
}

impl UnitSigner<'_> {
    fn sign(&self, path: &str, container: &BinaryContainer) -> Result<SignedUnit> {
        self.context.settings.cancellation().check()?;

        let owner = AppBundle::owning_bundle(self.bundles, path)
            .filter(|dir| !dir.is_main() && dir.executable_path() == path);
        let (identifier, info_plist, seal) = match owner {
            Some(dir) => {
                let seal = ResourceSeal::for_bundle(self.bundle, dir).to_plist()?;
                (
                    dir.info.identifier.clone(),
                    self.bundle.get(&dir.info_plist_path()),
                    Some((dir.code_resources_path(), seal)),
                )
            }
            None => (file_stem(path).to_string(), None, None),
        };

        let executable = container.slices().iter().any(|s| s.is_executable());
        let entitlements = match &self.context.profile {
            Some(profile) if executable => profile.entitlements_for(&identifier),
            _ => Entitlements::new(),
        };
        let params = SigningParams {
            identifier: &identifier,
            team_id: self.team_id,
            info_plist,
            code_resources: seal.as_ref().map(|(_, data)| data.as_slice()),
            entitlements: &entitlements,
        };

        let signed = MachOSigner::new(&self.context.credentials, &self.context.settings)
            .sign_container(container, &params)?;
        debug!("signed {path} as {identifier}");
        Ok(SignedUnit {
            path: path.to_string(),
            data: signed.to_bytes()?,
            seal,
        })
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().filter(|s| !s.is_empty()).unwrap_or(name)
}
