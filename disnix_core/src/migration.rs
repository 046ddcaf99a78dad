//! The state-migration engine (C7): snapshot, transfer and restore state for
//! every service whose placement moved between the old and new manifest.
//!
//! Grounded on `src/libmigrate/migrate.c`'s `migrate`: a breadth-first
//! pipeline (three full passes -- snapshot all, transfer all, restore all)
//! with a depth-first alternative (chain each moved service's
//! snapshot/transfer/restore/clean back to back before starting the next).
//! Snapshot and restore draw on the same per-target core budget the
//! scheduler (C5) uses -- in depth-first mode that budget is shared across
//! concurrently-running chains via a `tokio::sync::Semaphore` per target,
//! since two chains can land on the same target; transfer draws on the
//! separate, global `max_concurrent_transfers` bound (§5).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use disnix_definitions::mapping::SnapshotMapping;
use disnix_definitions::target::Target;

use crate::client::Invocation;
use crate::process::spawn_bounded;
use crate::Result;

/// One service's state crossing from `from_target` to `to_target`. Built by
/// the pipeline driver (C10) from the symmetric difference of the old and
/// new manifests' snapshot mappings, keyed by `(component, container, service)`
/// ignoring target.
#[derive(Debug, Clone)]
pub struct Migration {
    pub snapshot_mapping: SnapshotMapping,
    pub from_target: String,
    pub to_target: String,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub depth_first: bool,
    pub transfer_only: bool,
    pub all_generations: bool,
    pub keep_generations: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        MigrationOptions {
            depth_first: false,
            transfer_only: false,
            all_generations: false,
            keep_generations: 1,
        }
    }
}

fn cores_for(targets: &BTreeMap<String, Target>, key: &str) -> usize {
    targets.get(key).map(|t| t.num_of_cores.max(1) as usize).unwrap_or(1)
}

fn interface_for<'a>(targets: &'a BTreeMap<String, Target>, key: &str, override_iface: Option<&'a str>) -> &'a str {
    override_iface.unwrap_or_else(|| {
        targets
            .get(key)
            .map(|t| t.client_interface.as_str())
            .unwrap_or("disnix-client")
    })
}

async fn snapshot_one(m: &Migration, iface: &str, dry_run: bool) -> Result<()> {
    Invocation::new(
        iface,
        dry_run,
        m.from_target.clone(),
        "snapshot",
        vec![m.snapshot_mapping.component.clone()],
        vec![],
    )
    .run()
    .await
}

async fn transfer_one(m: &Migration, iface: &str, dry_run: bool, all_generations: bool) -> Result<()> {
    let mut args = vec![m.to_target.clone(), m.snapshot_mapping.component.clone()];
    if all_generations {
        args.push("--all".to_string());
    }
    Invocation::new(iface, dry_run, m.from_target.clone(), "copy-snapshots-to", args, vec![])
        .run()
        .await
}

async fn restore_one(m: &Migration, iface: &str, dry_run: bool) -> Result<()> {
    Invocation::new(
        iface,
        dry_run,
        m.to_target.clone(),
        "restore",
        vec![m.snapshot_mapping.component.clone()],
        vec![],
    )
    .run()
    .await
}

async fn clean_one(m: &Migration, iface: &str, dry_run: bool, keep: u32) -> Result<()> {
    Invocation::new(
        iface,
        dry_run,
        m.to_target.clone(),
        "clean-snapshots",
        vec!["--keep".into(), keep.to_string(), m.snapshot_mapping.component.clone()],
        vec![],
    )
    .run()
    .await
}

/// Groups `migrations` by the target named by `pick`, running each group
/// with its own target's core budget as the bound, all groups concurrently.
async fn per_target_bounded<F, Fut>(
    migrations: &[Migration],
    targets: &BTreeMap<String, Target>,
    pick: impl Fn(&Migration) -> &str,
    make: F,
) -> bool
where
    F: Fn(Migration) -> Fut + Clone,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut groups: BTreeMap<String, Vec<Migration>> = BTreeMap::new();
    for m in migrations {
        groups.entry(pick(m).to_string()).or_default().push(m.clone());
    }

    let mut group_futs = Vec::new();
    for (target_key, items) in groups {
        let cores = cores_for(targets, &target_key);
        let make = make.clone();
        group_futs.push(async move {
            spawn_bounded(items, cores, make).await.into_iter().all(|r| r.is_ok())
        });
    }
    futures::future::join_all(group_futs).await.into_iter().all(|ok| ok)
}

async fn run_breadth_first(
    migrations: &[Migration],
    targets: &BTreeMap<String, Target>,
    interface_override: Option<&str>,
    max_concurrent_transfers: usize,
    dry_run: bool,
    options: &MigrationOptions,
) -> bool {
    info!("migration: breadth-first snapshot phase ({} mapping(s))", migrations.len());
    let snap_ok = per_target_bounded(migrations, targets, |m| &m.from_target, {
        let targets = targets.clone();
        let interface_override = interface_override.map(str::to_string);
        move |m: Migration| {
            let iface = interface_for(&targets, &m.from_target, interface_override.as_deref()).to_string();
            async move { snapshot_one(&m, &iface, dry_run).await }
        }
    })
    .await;

    info!("migration: transfer phase, bounded by {} concurrent transfer(s)", max_concurrent_transfers);
    let transfer_results = spawn_bounded(migrations.to_vec(), max_concurrent_transfers, {
        let targets = targets.clone();
        let interface_override = interface_override.map(str::to_string);
        move |m: Migration| {
            let iface = interface_for(&targets, &m.from_target, interface_override.as_deref()).to_string();
            async move { transfer_one(&m, &iface, dry_run, options.all_generations).await }
        }
    })
    .await;
    let transfer_ok = transfer_results.into_iter().all(|r| r.is_ok());

    let restore_ok = if options.transfer_only {
        true
    } else {
        info!("migration: restore phase");
        per_target_bounded(migrations, targets, |m| &m.to_target, {
            let targets = targets.clone();
            let interface_override = interface_override.map(str::to_string);
            move |m: Migration| {
                let iface = interface_for(&targets, &m.to_target, interface_override.as_deref()).to_string();
                async move { restore_one(&m, &iface, dry_run).await }
            }
        })
        .await
    };

    snap_ok && transfer_ok && restore_ok
}

/// Runs `f` while holding a permit on `sem` (a no-op gate when `sem` is
/// `None`, e.g. a target absent from the table). Used to apply the same
/// per-target core budget the breadth-first path enforces via `cores_for`/
/// `spawn_bounded`, even though depth-first chains for different targets run
/// concurrently.
async fn with_core_permit<F, Fut>(sem: Option<&Semaphore>, f: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    match sem {
        Some(sem) => {
            let _permit = sem.acquire().await;
            f().await
        }
        None => f().await,
    }
}

async fn run_depth_first(
    migrations: &[Migration],
    targets: &BTreeMap<String, Target>,
    interface_override: Option<&str>,
    max_concurrent_transfers: usize,
    dry_run: bool,
    options: &MigrationOptions,
) -> bool {
    info!("migration: depth-first pipeline ({} mapping(s))", migrations.len());
    let mut groups: BTreeMap<String, Vec<Migration>> = BTreeMap::new();
    for m in migrations {
        groups.entry(m.from_target.clone()).or_default().push(m.clone());
    }

    let options = options.clone();
    let interface_override = interface_override.map(str::to_string);
    let targets = targets.clone();

    // One semaphore per target, sized to its core budget, shared across all
    // chains so two chains landing on the same target (e.g. different
    // sources migrating to the same destination) still serialize the same
    // way the scheduler's `request_core`/`release_core` does.
    let core_permits: BTreeMap<String, Arc<Semaphore>> = targets
        .keys()
        .map(|k| (k.clone(), Arc::new(Semaphore::new(cores_for(&targets, k)))))
        .collect();
    let transfer_permits = Arc::new(Semaphore::new(max_concurrent_transfers.max(1)));

    let chains = groups.into_iter().map(|(_, items)| {
        let options = options.clone();
        let interface_override = interface_override.clone();
        let targets = targets.clone();
        let core_permits = core_permits.clone();
        let transfer_permits = transfer_permits.clone();
        async move {
            let mut ok = true;
            for m in items {
                let from_iface = interface_for(&targets, &m.from_target, interface_override.as_deref()).to_string();
                let to_iface = interface_for(&targets, &m.to_target, interface_override.as_deref()).to_string();

                let snap_result = with_core_permit(core_permits.get(&m.from_target).map(Arc::as_ref), || {
                    snapshot_one(&m, &from_iface, dry_run)
                })
                .await;
                if snap_result.is_err() {
                    ok = false;
                    continue;
                }

                let transfer_result = with_core_permit(Some(transfer_permits.as_ref()), || {
                    transfer_one(&m, &from_iface, dry_run, options.all_generations)
                })
                .await;
                if transfer_result.is_err() {
                    ok = false;
                    continue;
                }

                if !options.transfer_only {
                    let restore_result = with_core_permit(core_permits.get(&m.to_target).map(Arc::as_ref), || {
                        restore_one(&m, &to_iface, dry_run)
                    })
                    .await;
                    if restore_result.is_err() {
                        ok = false;
                        continue;
                    }
                    if clean_one(&m, &to_iface, dry_run, options.keep_generations).await.is_err() {
                        ok = false;
                    }
                }
            }
            ok
        }
    });

    futures::future::join_all(chains).await.into_iter().all(|ok| ok)
}

/// Runs the full migration for `migrations`, in breadth-first or depth-first
/// order per `options.depth_first`. Migration failures never roll back
/// already-completed work (§9 design note) -- the return value only reports
/// success or aggregate failure.
pub async fn migrate(
    migrations: &[Migration],
    targets: &BTreeMap<String, Target>,
    interface_override: Option<&str>,
    max_concurrent_transfers: usize,
    dry_run: bool,
    options: &MigrationOptions,
) -> Result<bool> {
    if migrations.is_empty() {
        return Ok(true);
    }
    let ok = if options.depth_first {
        run_depth_first(migrations, targets, interface_override, max_concurrent_transfers, dry_run, options).await
    } else {
        run_breadth_first(migrations, targets, interface_override, max_concurrent_transfers, dry_run, options).await
    };
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use disnix_definitions::PropertyValue;
    use maplit::btreemap;
    use std::collections::BTreeMap as Map;

    fn target() -> Target {
        Target::new(
            "x86_64-linux".into(),
            "true".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => PropertyValue::String("t1".into()) },
            Map::new(),
            1,
        )
    }

    fn mapping(component: &str, from: &str, to: &str) -> Migration {
        Migration {
            snapshot_mapping: SnapshotMapping {
                component: component.to_string(),
                container: "main".to_string(),
                target: from.to_string(),
                service: component.to_string(),
                container_provided_by_service: None,
                transferred: false,
            },
            from_target: from.to_string(),
            to_target: to.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_migration_list_is_trivially_successful() {
        let targets: BTreeMap<String, Target> = BTreeMap::new();
        let ok = migrate(&[], &targets, None, 2, true, &MigrationOptions::default())
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn breadth_first_dry_run_succeeds_across_phases() {
        let targets = btreemap! { "T1".to_string() => target(), "T2".to_string() => target() };
        let migrations = vec![mapping("api", "T1", "T2")];
        let ok = migrate(&migrations, &targets, None, 2, true, &MigrationOptions::default())
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn depth_first_dry_run_succeeds() {
        let targets = btreemap! { "T1".to_string() => target(), "T2".to_string() => target() };
        let migrations = vec![mapping("api", "T1", "T2"), mapping("web", "T1", "T2")];
        let options = MigrationOptions {
            depth_first: true,
            ..Default::default()
        };
        let ok = migrate(&migrations, &targets, None, 2, true, &options).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn transfer_only_skips_restore_but_still_succeeds() {
        let targets = btreemap! { "T1".to_string() => target(), "T2".to_string() => target() };
        let migrations = vec![mapping("api", "T1", "T2")];
        let options = MigrationOptions {
            transfer_only: true,
            ..Default::default()
        };
        let ok = migrate(&migrations, &targets, None, 2, true, &options).await.unwrap();
        assert!(ok);
    }
}
