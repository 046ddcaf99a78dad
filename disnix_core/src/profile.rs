//! Profile commit (C9): pushes the new store-path distribution onto every
//! target, then atomically repoints the coordinator's own profile symlink.
//!
//! Grounded on `src/activate/profiles.c`'s `set_target_profiles` for the
//! per-target fan-out and its `set_coordinator_profile` for the symlink
//! repoint, and on `Manifest::open_provided_or_previous`'s
//! one-generation symlink indirection (`disnix_definitions::manifest`) for
//! what "the coordinator profile already points here" means.

use std::fs;
use std::path::{Path, PathBuf};

use disnix_definitions::target::Target;
use std::collections::BTreeMap;

use crate::client::Invocation;
use crate::{ErrorKind, Result};

/// Pushes `distribution[target] = store_path` onto every named target via
/// the client-interface `set --profile P --path S` verb, in parallel.
pub async fn set_target_profiles(
    distribution: &BTreeMap<String, String>,
    targets: &BTreeMap<String, Target>,
    profile: &str,
    interface_override: Option<&str>,
    dry_run: bool,
) -> Result<bool> {
    let mut handles = Vec::new();
    for (target_key, store_path) in distribution {
        let target = match targets.get(target_key) {
            Some(t) => t,
            None => continue,
        };
        let iface = interface_override.unwrap_or(&target.client_interface).to_string();
        let tk = target.find_target_key().unwrap_or_else(|_| target_key.clone());
        let profile = profile.to_string();
        let store_path = store_path.clone();
        handles.push(async move {
            let inv = Invocation::new(
                &iface,
                dry_run,
                tk.clone(),
                "set",
                vec!["--profile".into(), profile, "--path".into(), store_path],
                vec![],
            );
            (tk, inv.run().await)
        });
    }

    info!("profile commit: setting target profiles on {} target(s)", handles.len());
    let results = futures::future::join_all(handles).await;
    let mut ok = true;
    for (key, r) in results {
        if let Err(e) = r {
            warn!("[{}]: failed to set profile: {}", key, e);
            ok = false;
        }
    }
    Ok(ok)
}

fn resolve_one_indirection(link: &Path, target: &Path) -> PathBuf {
    let resolved = if target.is_relative() {
        link.parent().unwrap_or_else(|| Path::new(".")).join(target)
    } else {
        target.to_path_buf()
    };
    match fs::read_link(&resolved) {
        Ok(indirect) if indirect.is_relative() => resolved
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(indirect),
        Ok(indirect) => indirect,
        Err(_) => resolved,
    }
}

/// Atomically repoints the coordinator profile symlink `base_dir/profile` at
/// `manifest_file`. A no-op if it already resolves there (following one
/// generation of indirection, the same rule `Manifest::open_provided_or_previous`
/// reads back).
pub fn set_coordinator_profile(base_dir: Option<&Path>, manifest_file: &Path, profile: &str) -> Result<()> {
    let dir = base_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(disnix_definitions::CoordinatorConfig::default_state_dir);
    fs::create_dir_all(&dir)
        .map_err(|e| ErrorKind::SchedulerError(format!("cannot create profile directory '{}': {}", dir.display(), e)))?;

    let link = dir.join(profile);
    if let Ok(existing) = fs::read_link(&link) {
        let resolved = resolve_one_indirection(&link, &existing);
        if resolved == manifest_file {
            debug!("coordinator profile '{}' already points at {}", profile, manifest_file.display());
            return Ok(());
        }
    }

    let tmp = dir.join(format!(".{}.tmp", profile));
    if tmp.exists() {
        fs::remove_file(&tmp).ok();
    }
    std::os::unix::fs::symlink(manifest_file, &tmp)
        .map_err(|e| ErrorKind::SchedulerError(format!("cannot create temp symlink: {}", e)))?;
    fs::rename(&tmp, &link)
        .map_err(|e| ErrorKind::SchedulerError(format!("cannot commit coordinator profile: {}", e)))?;
    info!("coordinator profile '{}' now points at {}", profile, manifest_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_coordinator_profile_is_idempotent() {
        let dir = tempdir().unwrap();
        let manifest_file = dir.path().join("manifest.xml");
        fs::write(&manifest_file, "<manifest/>").unwrap();

        set_coordinator_profile(Some(dir.path()), &manifest_file, "default").unwrap();
        let first = fs::read_link(dir.path().join("default")).unwrap();

        set_coordinator_profile(Some(dir.path()), &manifest_file, "default").unwrap();
        let second = fs::read_link(dir.path().join("default")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn set_coordinator_profile_repoints_on_a_new_manifest() {
        let dir = tempdir().unwrap();
        let first_manifest = dir.path().join("a.xml");
        let second_manifest = dir.path().join("b.xml");
        fs::write(&first_manifest, "<manifest/>").unwrap();
        fs::write(&second_manifest, "<manifest/>").unwrap();

        set_coordinator_profile(Some(dir.path()), &first_manifest, "default").unwrap();
        set_coordinator_profile(Some(dir.path()), &second_manifest, "default").unwrap();

        let link_target = fs::read_link(dir.path().join("default")).unwrap();
        assert_eq!(link_target, second_manifest);
    }
}
