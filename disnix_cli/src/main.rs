//! Thin command-line front-end (C14): parses a small argument surface and
//! calls `disnix_core::activate_system`. No business logic lives here --
//! every decision is made by the library crate so it stays independently
//! testable.
//!
//! Grounded on `shipcat_cli::main`'s `clap` builder, `loggerv` verbosity
//! setup and `print_error_debug`'s CIRCLECI-vs-unwound error rendering,
//! generalized here to a `DISNIX_DEBUG_ERRORS` environment variable.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate loggerv;

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use clap::{App, Arg, ArgMatches};

use disnix_core::{activate_system, ActivationOptions, Error};
use disnix_definitions::manifest::LoadFlags;
use disnix_definitions::Manifest;

fn print_error_debug(e: &Error) {
    if env::var("DISNIX_DEBUG_ERRORS").is_ok() {
        warn!("{:?}", e);
    } else {
        for cause in e.iter().skip(1) {
            warn!("caused by: {}", cause);
        }
    }
}

fn main() {
    let app = App::new("disnix-activate")
        .version(crate_version!())
        .about("Activate a manifest across a set of targets")
        .arg(Arg::with_name("verbose").short("v").multiple(true).help("Increase verbosity"))
        .arg(
            Arg::with_name("manifest")
                .long("manifest")
                .takes_value(true)
                .required(true)
                .help("Path to the new manifest XML file"),
        )
        .arg(
            Arg::with_name("old-manifest")
                .long("old-manifest")
                .takes_value(true)
                .help("Path to the previous manifest; defaults to the coordinator profile"),
        )
        .arg(
            Arg::with_name("profile")
                .long("profile")
                .takes_value(true)
                .help("Deployment name (default: \"default\")"),
        )
        .arg(
            Arg::with_name("coordinator-profile-path")
                .long("coordinator-profile-path")
                .takes_value(true)
                .help("Overrides the coordinator-profile base directory"),
        )
        .arg(
            Arg::with_name("interface")
                .long("interface")
                .takes_value(true)
                .help("Overrides every target's clientInterface"),
        )
        .arg(
            Arg::with_name("max-concurrent-transfers")
                .long("max-concurrent-transfers")
                .takes_value(true)
                .help("Bounds concurrent closure transfers (default: 2)"),
        )
        .arg(Arg::with_name("no-lock").long("no-lock").help("Skip the locking phase"))
        .arg(
            Arg::with_name("no-target-profiles")
                .long("no-target-profiles")
                .help("Skip setting per-target profiles"),
        )
        .arg(
            Arg::with_name("no-coordinator-profile")
                .long("no-coordinator-profile")
                .help("Skip committing the coordinator profile"),
        )
        .arg(
            Arg::with_name("no-upgrade")
                .long("no-upgrade")
                .help("Treat every mapping as a fresh install; skip pairing against the previous manifest"),
        )
        .arg(
            Arg::with_name("depth-first")
                .long("depth-first")
                .help("Migrate state depth-first instead of breadth-first"),
        )
        .arg(
            Arg::with_name("transfer-only")
                .long("transfer-only")
                .help("Stop the migration after the transfer phase; skip restore"),
        )
        .arg(Arg::with_name("dry-run").long("dry-run").help("Run without touching any target"));

    let args = app.get_matches();

    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(true)
        .init()
        .unwrap();

    process::exit(match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!("disnix-activate error: {}", e);
            print_error_debug(&e);
            1
        }
    });
}

#[tokio::main]
async fn run(args: &ArgMatches<'_>) -> Result<i32, Error> {
    // Canonicalized so the coordinator profile symlink (set_coordinator_profile)
    // stores a path that still resolves correctly regardless of the caller's
    // working directory on a later run.
    let manifest_path = std::fs::canonicalize(args.value_of("manifest").unwrap())?;
    let new_manifest = Manifest::load(&manifest_path, LoadFlags::ALL, None, None)?;
    new_manifest.validate()?;

    let profile = args.value_of("profile").unwrap_or("default").to_string();
    let coordinator_profile_path = args.value_of("coordinator-profile-path").map(PathBuf::from);

    let old_manifest = if let Some(p) = args.value_of("old-manifest") {
        Some(Manifest::load(Path::new(p), LoadFlags::ALL, None, None)?)
    } else {
        Manifest::open_provided_or_previous(None, coordinator_profile_path.as_deref(), &profile)?
    };

    let max_concurrent_transfers = args
        .value_of("max-concurrent-transfers")
        .map(|v| v.parse().unwrap_or(2))
        .unwrap_or(2);

    let options = ActivationOptions {
        no_coordinator_profile: args.is_present("no-coordinator-profile"),
        no_target_profiles: args.is_present("no-target-profiles"),
        no_upgrade: args.is_present("no-upgrade"),
        no_lock: args.is_present("no-lock"),
        dry_run: args.is_present("dry-run"),
        depth_first_migration: args.is_present("depth-first"),
        transfer_only: args.is_present("transfer-only"),
        all_generations: false,
        keep_generations: 1,
        coordinator_profile_path,
        profile,
        interface_override: args.value_of("interface").map(str::to_string),
        max_concurrent_transfers,
    };

    let report = activate_system(&new_manifest, old_manifest.as_ref(), &manifest_path, &options).await?;

    if report.success {
        info!("activation succeeded");
        Ok(0)
    } else {
        warn!(
            "activation failed (locked={} transitioned={} migrated={} target_profiles_set={} coordinator_profile_set={})",
            report.locked, report.transitioned, report.migrated, report.target_profiles_set, report.coordinator_profile_set
        );
        Ok(1)
    }
}
