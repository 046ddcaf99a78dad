//! The pipeline driver (C10): wires the manifest model, set algebra,
//! transition engine, migration engine, locking phase and profile commit
//! into the single `activate_system` entry point the CLI (C14) calls.
//!
//! Grounded on `src/activate/activate.c`'s `activate_system`, the top-level
//! driver invoked from `src/activate/main.c`, which runs the same phases in
//! the same order: lock, transition (deactivate obsolete then activate new),
//! migrate moved state, push target profiles, unlock, commit the
//! coordinator profile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use disnix_definitions::mapping::SnapshotMapping;
use disnix_definitions::setalgebra::{intersect, subtract, unify, Keyed};
use disnix_definitions::Manifest;

use crate::migration::{self, Migration, MigrationOptions};
use crate::signal::Interrupt;
use crate::{lock, profile, transition, Result};

/// Every knob `disnix-activate` exposes on the command line (C14), collected
/// into one struct so the library entry point stays the single source of
/// truth for what a run does.
#[derive(Debug, Clone)]
pub struct ActivationOptions {
    pub no_coordinator_profile: bool,
    pub no_target_profiles: bool,
    pub no_upgrade: bool,
    pub no_lock: bool,
    pub dry_run: bool,
    pub depth_first_migration: bool,
    pub transfer_only: bool,
    pub all_generations: bool,
    pub keep_generations: u32,
    pub coordinator_profile_path: Option<PathBuf>,
    pub profile: String,
    pub interface_override: Option<String>,
    pub max_concurrent_transfers: u32,
}

impl Default for ActivationOptions {
    fn default() -> Self {
        ActivationOptions {
            no_coordinator_profile: false,
            no_target_profiles: false,
            no_upgrade: false,
            no_lock: false,
            dry_run: false,
            depth_first_migration: false,
            transfer_only: false,
            all_generations: false,
            keep_generations: 1,
            coordinator_profile_path: None,
            profile: "default".to_string(),
            interface_override: None,
            max_concurrent_transfers: 2,
        }
    }
}

/// Per-phase outcome, so the CLI (C14) can report exactly which phase failed
/// even though the process as a whole yields one exit code.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    pub locked: bool,
    pub transitioned: bool,
    pub migrated: bool,
    pub target_profiles_set: bool,
    pub coordinator_profile_set: bool,
    pub success: bool,
}

/// Pairs up the old and new manifests' snapshot mappings by `(service,
/// component)`, ignoring target, and returns the ones whose target actually
/// changed. With `no_upgrade` set (or no previous manifest at all) every
/// mapping in `new_manifest` is treated as freshly arriving -- there's
/// nothing to migrate *from*, so each is paired with itself; `migrate` then
/// runs a same-target snapshot/restore, which is a no-op for state that
/// doesn't exist yet but keeps the pipeline's phase sequence uniform.
fn build_migrations(old: &Manifest, new_manifest: &Manifest, no_upgrade: bool) -> Vec<Migration> {
    if no_upgrade || old.snapshot_mapping_array.is_empty() {
        return new_manifest
            .snapshot_mapping_array
            .iter()
            .map(|m| Migration {
                snapshot_mapping: m.clone(),
                from_target: m.target.clone(),
                to_target: m.target.clone(),
            })
            .collect();
    }

    let mut old_by_component: BTreeMap<(String, String), &SnapshotMapping> = BTreeMap::new();
    for m in &old.snapshot_mapping_array {
        old_by_component.insert((m.service.clone(), m.component.clone()), m);
    }

    new_manifest
        .snapshot_mapping_array
        .iter()
        .filter_map(|new_m| {
            let old_m = old_by_component.get(&(new_m.service.clone(), new_m.component.clone()))?;
            if old_m.target == new_m.target {
                return None;
            }
            Some(Migration {
                snapshot_mapping: new_m.clone(),
                from_target: old_m.target.clone(),
                to_target: new_m.target.clone(),
            })
        })
        .collect()
}

/// Runs a full activation: lock, transition, migrate, push target profiles,
/// unlock, commit the coordinator profile -- skipping whichever phases
/// `options` disables. `manifest_path` is the file the coordinator profile
/// symlink should end up pointing at.
pub async fn activate_system(
    new_manifest: &Manifest,
    old_manifest: Option<&Manifest>,
    manifest_path: &Path,
    options: &ActivationOptions,
) -> Result<ActivationReport> {
    let interrupt = Interrupt::new();
    interrupt.install();

    let empty = Manifest::default();
    let old = old_manifest.unwrap_or(&empty);

    let mut services = old.services.clone();
    services.extend(new_manifest.services.clone());

    let mut targets = old.targets_table.clone();
    targets.extend(new_manifest.targets_table.clone());

    let inter = intersect(&old.service_mapping_array, &new_manifest.service_mapping_array);
    let to_deactivate_mappings = subtract(&old.service_mapping_array, &inter);
    let to_activate_mappings = subtract(&new_manifest.service_mapping_array, &inter);
    let mut union = unify(&old.service_mapping_array, &new_manifest.service_mapping_array, &inter);

    let to_deactivate: Vec<_> = to_deactivate_mappings.iter().map(|m| m.key()).collect();
    let to_activate: Vec<_> = to_activate_mappings.iter().map(|m| m.key()).collect();
    let old_keys: Vec<_> = old.service_mapping_array.iter().map(|m| m.key()).collect();

    let mut report = ActivationReport::default();
    let iface = options.interface_override.as_deref();

    if options.no_lock || options.dry_run {
        report.locked = true;
    } else {
        info!("phase: lock");
        report.locked = lock::lock(&targets, &options.profile, iface, options.dry_run, &interrupt).await?;
        if !report.locked {
            return Ok(report);
        }
    }

    info!("phase: transition");
    if let Err(e) = transition::transition(
        &mut union,
        &to_deactivate,
        &to_activate,
        &old_keys,
        &services,
        &mut targets,
        iface,
        options.dry_run,
        &interrupt,
    )
    .await
    {
        warn!("transition failed: {}", e);
        if !options.no_lock && !options.dry_run {
            let _ = lock::unlock(&targets, &options.profile, iface, options.dry_run).await;
        }
        return Ok(report);
    }
    report.transitioned = true;

    info!("phase: state migration");
    let migrations = build_migrations(old, new_manifest, options.no_upgrade);
    let migration_options = MigrationOptions {
        depth_first: options.depth_first_migration,
        transfer_only: options.transfer_only,
        all_generations: options.all_generations,
        keep_generations: options.keep_generations,
    };
    report.migrated = migration::migrate(
        &migrations,
        &targets,
        iface,
        options.max_concurrent_transfers as usize,
        options.dry_run,
        &migration_options,
    )
    .await?;
    if !report.migrated {
        warn!("state migration reported failures; continuing (migration is never rolled back)");
    }

    if options.no_target_profiles || options.dry_run {
        report.target_profiles_set = true;
    } else {
        info!("phase: set target profiles");
        report.target_profiles_set =
            profile::set_target_profiles(&new_manifest.profile_mapping_table, &targets, &options.profile, iface, options.dry_run)
                .await?;
        if !report.target_profiles_set {
            if !options.no_lock {
                let _ = lock::unlock(&targets, &options.profile, iface, options.dry_run).await;
            }
            return Ok(report);
        }
    }

    if !options.no_lock && !options.dry_run {
        info!("phase: unlock");
        let _ = lock::unlock(&targets, &options.profile, iface, options.dry_run).await;
    }

    if options.no_coordinator_profile || options.dry_run {
        report.coordinator_profile_set = true;
    } else {
        info!("phase: commit coordinator profile");
        profile::set_coordinator_profile(options.coordinator_profile_path.as_deref(), manifest_path, &options.profile)?;
        report.coordinator_profile_set = true;
    }

    report.success =
        report.locked && report.transitioned && report.migrated && report.target_profiles_set && report.coordinator_profile_set;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use disnix_definitions::mapping::ServiceMapping;
    use disnix_definitions::service::{InterDependencyMapping, ManifestService};
    use disnix_definitions::target::Target;
    use disnix_definitions::PropertyValue;
    use maplit::btreemap;

    fn target() -> Target {
        Target::new(
            "x86_64-linux".into(),
            "true".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => PropertyValue::String("t1".into()) },
            std::collections::BTreeMap::new(),
            1,
        )
    }

    fn service(name: &str, deps: Vec<InterDependencyMapping>) -> ManifestService {
        ManifestService {
            name: name.to_string(),
            pkg: format!("/nix/store/{}", name),
            service_type: "process".into(),
            depends_on: deps,
            connects_to: vec![],
            provides_containers: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn fresh_install_activates_and_commits_the_profile() {
        let mut new_manifest = Manifest::default();
        new_manifest.services = btreemap! {
            "db".to_string() => service("db", vec![]),
            "api".to_string() => service("api", vec![InterDependencyMapping::new("db", "main", "T1")]),
        };
        new_manifest.service_mapping_array = vec![
            ServiceMapping::new("db", "main", "T1"),
            ServiceMapping::new("api", "main", "T1"),
        ];
        new_manifest.targets_table = btreemap! { "T1".to_string() => target() };

        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.xml");
        std::fs::write(&manifest_path, "<manifest/>").unwrap();

        let options = ActivationOptions {
            coordinator_profile_path: Some(dir.path().to_path_buf()),
            dry_run: true,
            ..Default::default()
        };

        let report = activate_system(&new_manifest, None, &manifest_path, &options).await.unwrap();
        assert!(report.success);
        assert!(report.transitioned);
    }

    #[test]
    fn build_migrations_pairs_moved_components_across_old_and_new() {
        let mut old = Manifest::default();
        old.snapshot_mapping_array = vec![SnapshotMapping {
            component: "db-state".into(),
            container: "main".into(),
            target: "T1".into(),
            service: "db".into(),
            container_provided_by_service: None,
            transferred: false,
        }];
        let mut new_manifest = Manifest::default();
        new_manifest.snapshot_mapping_array = vec![SnapshotMapping {
            component: "db-state".into(),
            container: "main".into(),
            target: "T2".into(),
            service: "db".into(),
            container_provided_by_service: None,
            transferred: false,
        }];

        let migrations = build_migrations(&old, &new_manifest, false);
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].from_target, "T1");
        assert_eq!(migrations[0].to_target, "T2");
    }

    #[test]
    fn build_migrations_skips_components_that_did_not_move() {
        let mut old = Manifest::default();
        old.snapshot_mapping_array = vec![SnapshotMapping {
            component: "db-state".into(),
            container: "main".into(),
            target: "T1".into(),
            service: "db".into(),
            container_provided_by_service: None,
            transferred: false,
        }];
        let new_manifest = old.clone();

        let migrations = build_migrations(&old, &new_manifest, false);
        assert!(migrations.is_empty());
    }
}
