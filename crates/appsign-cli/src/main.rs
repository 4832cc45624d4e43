//! Command-line interface for appsign.
//!
//! Signs IPA files, unpacked app bundles and single Mach-O binaries, and
//! checks the embedded signature of a Mach-O file.

use appsign::{verify_signed_binary, AppSign, Error, SigningReport};
use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "appsign")]
#[command(about = "iOS code signing tool", version)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign an IPA, an app bundle directory or a Mach-O binary
    Sign(SignArgs),
    /// Check the code signature of a Mach-O binary
    Verify {
        /// Mach-O file to check
        input: PathBuf,
    },
}

#[derive(Args)]
struct SignArgs {
    /// Input file (IPA, Mach-O, or app bundle)
    input: PathBuf,

    /// Output path
    #[arg(short, long)]
    output: PathBuf,

    /// Certificate file (PEM or DER)
    #[arg(short = 'c', long = "cert")]
    certificate: Option<PathBuf>,

    /// Private key file (PEM or DER PKCS#8)
    #[arg(short = 'k', long = "key")]
    private_key: Option<PathBuf>,

    /// PKCS#12 file (.p12)
    #[arg(short = 'p', long = "p12")]
    pkcs12: Option<PathBuf>,

    /// Password for the PKCS#12 file
    #[arg(long)]
    password: Option<String>,

    /// Provisioning profile
    #[arg(short = 'm', long)]
    profile: Option<PathBuf>,

    /// New bundle identifier for the app
    #[arg(short = 'b', long)]
    bundle_id: Option<String>,

    /// New bundle display name for the app
    #[arg(short = 'n', long = "name")]
    bundle_name: Option<String>,

    /// Dylib to copy into the bundle and link from the main executable
    #[arg(short = 'l', long)]
    dylib: Option<PathBuf>,

    /// Link the injected dylib weakly
    #[arg(short = 'w', long, requires = "dylib")]
    weak: bool,

    /// ZIP compression level (0-9)
    #[arg(short = 'z', long, default_value = "6")]
    zip_level: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Sign(args) => sign(args),
        Command::Verify { input } => verify(&input),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn sign(args: SignArgs) -> Result<(), Error> {
    let mut signer = AppSign::new().compression_level(args.zip_level);
    if let Some(p12) = &args.pkcs12 {
        signer = signer.pkcs12(p12);
    }
    if let Some(cert) = &args.certificate {
        signer = signer.certificate(cert);
    }
    if let Some(key) = &args.private_key {
        signer = signer.private_key(key);
    }
    if let Some(password) = args.password {
        signer = signer.password(password);
    }
    if let Some(profile) = &args.profile {
        signer = signer.provisioning_profile(profile);
    }
    if let Some(bundle_id) = args.bundle_id {
        signer = signer.bundle_id(bundle_id);
    }
    if let Some(bundle_name) = args.bundle_name {
        signer = signer.bundle_name(bundle_name);
    }
    if let Some(dylib) = &args.dylib {
        signer = signer.inject_dylib(dylib, args.weak);
    }

    let input = &args.input;
    let is_ipa = input
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("ipa"));

    if is_ipa {
        print_report(&signer.sign_ipa(input, &args.output)?);
    } else if input.is_dir() {
        print_report(&signer.sign_app_dir(input, &args.output)?);
    } else {
        signer.sign_macho(input, &args.output)?;
    }

    println!("Signed: {}", args.output.display());
    Ok(())
}

fn print_report(report: &SigningReport) {
    debug!("states: {:?}", report.states);
    for path in &report.signed_dependencies {
        println!("  {path}");
    }
    println!("  {} ({})", report.main_executable, report.bundle_identifier);
}

fn verify(input: &Path) -> Result<(), Error> {
    let data = std::fs::read(input)?;
    let report = verify_signed_binary(&data)?;

    for slice in &report.slices {
        println!(
            "{}: {} team={} signer={}",
            slice.arch,
            slice.identifier,
            slice.team_id.as_deref().unwrap_or("-"),
            slice.signers.first().map(String::as_str).unwrap_or("-"),
        );
        for cd in &slice.code_directories {
            println!(
                "  {:?}: {} code pages, {} special slots",
                cd.digest_type,
                cd.code_hashes.len(),
                cd.special_slots.len()
            );
        }
    }
    for arch in &report.unsigned {
        println!("{arch}: not signed (unsupported architecture)");
    }
    println!("Valid: {}", input.display());
    Ok(())
}
